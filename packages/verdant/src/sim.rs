//! Device simulator
//!
//! Drives the hub without hardware: one simulated device per sensor
//! type, each registering over WebSocket, streaming random readings,
//! and answering application pings. With `--flap` the devices also
//! drop and re-register periodically to exercise the grace period.

use crate::device::DeviceType;
use crate::hub::protocol::{HubMessage, Inbound};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub url: String,
    pub devices: Vec<DeviceType>,
    pub interval: Duration,
    /// Drop the connection after this long, then reconnect.
    pub flap_after: Option<Duration>,
}

pub async fn run(opts: SimOptions) -> Result<()> {
    let mut tasks = Vec::new();
    for device in opts.devices.clone() {
        let opts = opts.clone();
        tasks.push(tokio::spawn(async move {
            simulate_device(device, opts).await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn simulate_device(device: DeviceType, opts: SimOptions) {
    let name = format!("{}Tune-sim", device.as_str());
    loop {
        info!(device = %name, url = %opts.url, "simulator connecting");
        match connect_async(opts.url.as_str()).await {
            Ok((ws, _)) => {
                if let Err(err) = device_session(&name, device, ws, &opts).await {
                    warn!(device = %name, %err, "session ended");
                }
            }
            Err(err) => {
                warn!(device = %name, %err, "connect failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn device_session(
    name: &str,
    device: DeviceType,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    opts: &SimOptions,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();

    let register = serde_json::to_string(&Inbound::RegisterEsp {
        name: name.to_string(),
    })?;
    sink.send(Message::Text(register.into())).await?;

    let mut readings = tokio::time::interval(opts.interval);
    let flap = opts.flap_after.unwrap_or(Duration::MAX);
    let deadline = tokio::time::sleep(flap);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline, if opts.flap_after.is_some() => {
                info!(device = %name, "flapping: dropping connection");
                let _ = sink.close().await;
                return Ok(());
            }
            _ = readings.tick() => {
                let value: f64 = rand::random_range(0.0..1.0);
                let msg = serde_json::to_string(&Inbound::SensorData {
                    sensor: device,
                    name: name.to_string(),
                    value: Some(value),
                })?;
                sink.send(Message::Text(msg.into())).await?;
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(payload))) => {
                        sink.send(Message::Pong(payload)).await?;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(err.into()),
                };
                match serde_json::from_str::<HubMessage>(&text) {
                    Ok(HubMessage::Ping { timestamp }) => {
                        let pong = serde_json::to_string(&Inbound::Pong { timestamp })?;
                        sink.send(Message::Text(pong.into())).await?;
                    }
                    Ok(other) => debug!(device = %name, ?other, "hub message"),
                    Err(err) => warn!(device = %name, %err, "malformed hub message"),
                }
            }
        }
    }
}
