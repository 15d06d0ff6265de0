//! Composite scene resolution
//!
//! Maps the per-sensor activity triple (soil, light, temperature) to
//! exactly one of eight scenes with a strict priority: the triple beats
//! every pair, every pair beats every single, every single beats idle.
//! Also decides which single-sensor features a combined scene mutes.

use crate::device::DeviceType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The eight composite scenes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scene {
    /// Nothing active.
    Idle,
    Soil,
    Light,
    Temp,
    /// Soil + light.
    Bloom,
    /// Light + temperature.
    Drift,
    /// Soil + temperature.
    Mire,
    /// All three.
    Chorus,
}

impl Scene {
    /// Resolve the activity triple. The match is the priority table:
    /// exactly one arm fires per combination, triple first, then pairs,
    /// then singles, then idle.
    pub fn resolve(soil: bool, light: bool, temp: bool) -> Scene {
        match (soil, light, temp) {
            (true, true, true) => Scene::Chorus,
            (true, true, false) => Scene::Bloom,
            (false, true, true) => Scene::Drift,
            (true, false, true) => Scene::Mire,
            (true, false, false) => Scene::Soil,
            (false, true, false) => Scene::Light,
            (false, false, true) => Scene::Temp,
            (false, false, false) => Scene::Idle,
        }
    }

    /// The pair scenes engaged by this scene. Chorus engages all three
    /// pairs at once; a pair scene engages itself; singles and idle
    /// engage none.
    fn engaged_pairs(&self) -> &'static [Scene] {
        match self {
            Scene::Chorus => &[Scene::Bloom, Scene::Drift, Scene::Mire],
            Scene::Bloom => &[Scene::Bloom],
            Scene::Drift => &[Scene::Drift],
            Scene::Mire => &[Scene::Mire],
            _ => &[],
        }
    }

    /// The sensors a pair scene owns.
    fn owned_sensors(&self) -> &'static [DeviceType] {
        match self {
            Scene::Bloom => &[DeviceType::Soil, DeviceType::Light],
            Scene::Drift => &[DeviceType::Light, DeviceType::Temperature],
            Scene::Mire => &[DeviceType::Soil, DeviceType::Temperature],
            _ => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scene::Idle => "idle",
            Scene::Soil => "soil",
            Scene::Light => "light",
            Scene::Temp => "temp",
            Scene::Bloom => "bloom",
            Scene::Drift => "drift",
            Scene::Mire => "mire",
            Scene::Chorus => "chorus",
        }
    }
}

impl fmt::Display for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved scene plus the single-sensor features it mutes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub scene: Scene,
    /// A sensor's solo feature is muted iff some engaged pair owns it.
    pub muted: BTreeSet<DeviceType>,
}

/// Tracks the current resolution and reports changes.
#[derive(Debug, Clone)]
pub struct CompositeStateResolver {
    active: BTreeMap<DeviceType, bool>,
    current: Resolution,
}

impl Default for CompositeStateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CompositeStateResolver {
    pub fn new() -> Self {
        Self {
            active: DeviceType::ALL.iter().map(|t| (*t, false)).collect(),
            current: Resolution {
                scene: Scene::Idle,
                muted: BTreeSet::new(),
            },
        }
    }

    pub fn current(&self) -> &Resolution {
        &self.current
    }

    /// Update one sensor's activity. Returns the new resolution when
    /// the scene or the mute set changed.
    pub fn update(&mut self, sensor: DeviceType, active: bool) -> Option<Resolution> {
        self.active.insert(sensor, active);
        let next = self.resolve();
        if next == self.current {
            return None;
        }
        self.current = next.clone();
        Some(next)
    }

    fn resolve(&self) -> Resolution {
        let on = |t: DeviceType| self.active.get(&t).copied().unwrap_or(false);
        let scene = Scene::resolve(
            on(DeviceType::Soil),
            on(DeviceType::Light),
            on(DeviceType::Temperature),
        );
        let muted = scene
            .engaged_pairs()
            .iter()
            .flat_map(|p| p.owned_sensors().iter().copied())
            .collect();
        Resolution { scene, muted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_table_is_strict() {
        assert_eq!(Scene::resolve(false, false, false), Scene::Idle);
        assert_eq!(Scene::resolve(true, false, false), Scene::Soil);
        assert_eq!(Scene::resolve(false, true, false), Scene::Light);
        assert_eq!(Scene::resolve(false, false, true), Scene::Temp);
        assert_eq!(Scene::resolve(true, true, false), Scene::Bloom);
        assert_eq!(Scene::resolve(false, true, true), Scene::Drift);
        assert_eq!(Scene::resolve(true, false, true), Scene::Mire);
        assert_eq!(Scene::resolve(true, true, true), Scene::Chorus);
    }

    #[test]
    fn pair_scene_mutes_exactly_its_constituents() {
        let mut r = CompositeStateResolver::new();
        r.update(DeviceType::Soil, true);
        let res = r.update(DeviceType::Light, true).unwrap();
        assert_eq!(res.scene, Scene::Bloom);
        assert_eq!(
            res.muted,
            BTreeSet::from([DeviceType::Soil, DeviceType::Light])
        );
    }

    #[test]
    fn chorus_mutes_all_singles() {
        let mut r = CompositeStateResolver::new();
        r.update(DeviceType::Soil, true);
        r.update(DeviceType::Light, true);
        let res = r.update(DeviceType::Temperature, true).unwrap();
        assert_eq!(res.scene, Scene::Chorus);
        assert_eq!(res.muted, BTreeSet::from_iter(DeviceType::ALL));
    }

    #[test]
    fn single_scene_mutes_nothing() {
        let mut r = CompositeStateResolver::new();
        let res = r.update(DeviceType::Temperature, true).unwrap();
        assert_eq!(res.scene, Scene::Temp);
        assert!(res.muted.is_empty());
    }

    #[test]
    fn partial_release_keeps_shared_constituents_muted() {
        let mut r = CompositeStateResolver::new();
        r.update(DeviceType::Soil, true);
        r.update(DeviceType::Light, true);
        r.update(DeviceType::Temperature, true);
        assert_eq!(r.current().scene, Scene::Chorus);

        // Light drops out. The soil+temperature pair still owns both of
        // its constituents, so only light may be released.
        let res = r.update(DeviceType::Light, false).unwrap();
        assert_eq!(res.scene, Scene::Mire);
        assert!(res.muted.contains(&DeviceType::Soil));
        assert!(res.muted.contains(&DeviceType::Temperature));
        assert!(!res.muted.contains(&DeviceType::Light));
    }

    #[test]
    fn losing_a_constituent_unmutes_the_survivor() {
        let mut r = CompositeStateResolver::new();
        r.update(DeviceType::Soil, true);
        r.update(DeviceType::Light, true);
        let res = r.update(DeviceType::Light, false).unwrap();
        assert_eq!(res.scene, Scene::Soil);
        assert!(res.muted.is_empty());
    }

    #[test]
    fn no_change_reports_none() {
        let mut r = CompositeStateResolver::new();
        assert!(r.update(DeviceType::Soil, false).is_none());
        r.update(DeviceType::Soil, true);
        assert!(r.update(DeviceType::Soil, true).is_none());
    }
}
