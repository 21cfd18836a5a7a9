// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Name Generator for VMs allocated without a requested name.

use std::path::Path;

use rand::seq::SliceRandom;

use crate::error::{Error, Result};

const BUILTIN_NAMES: &[&str] = &[
    "Albatross", "Anchor", "Armada", "Atoll", "Ballast", "Barnacle", "Beacon", "Bilge",
    "Bosun", "Bowsprit", "Breaker", "Brigantine", "Buoy", "Capstan", "Caravel", "Cartographer",
    "Clipper", "Compass", "Coral", "Corsair", "Current", "Cutter", "Dinghy", "Dolphin",
    "Dory", "Drift", "Estuary", "Fathom", "Ferry", "Fjord", "Flagship", "Frigate",
    "Galleon", "Gannet", "Gull", "Halyard", "Harbor", "Heron", "Hull", "Inlet",
    "Jetty", "Junk", "Keel", "Kelp", "Ketch", "Lagoon", "Lantern", "Lighthouse",
    "Longboat", "Mainsail", "Mariner", "Mast", "Narwhal", "Nautilus", "Navigator", "Oar",
    "Orca", "Osprey", "Pelican", "Pier", "Pilot", "Porpoise", "Quay", "Reef",
    "Rigging", "Riptide", "Rudder", "Schooner", "Seal", "Sextant", "Shoal", "Skiff",
    "Sloop", "Sonar", "Spinnaker", "Starboard", "Steamer", "Swell", "Tern", "Tide",
    "Tiller", "Trawler", "Trident", "Tugboat", "Undertow", "Voyager", "Wake", "Walrus",
    "Wharf", "Whaler", "Windlass", "Yacht", "Yawl", "Zephyr",
];

/// Draws human-readable names from a dictionary.
#[derive(Debug, Clone)]
pub struct NameGenerator {
    names: Vec<String>,
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::from_names(BUILTIN_NAMES.iter().map(|s| s.to_string()).collect())
    }
}

impl NameGenerator {
    /// Use the given dictionary. Blank entries are dropped.
    pub fn from_names(names: Vec<String>) -> Self {
        Self {
            names: names
                .into_iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    /// Load a dictionary with one name per line.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_names(content.lines().map(str::to_string).collect()))
    }

    /// Number of dictionary entries.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the dictionary is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Pick a random name for which `is_taken` returns false.
    ///
    /// Every dictionary entry is tried at most once; when all of them are
    /// taken the result is a [`Error::NameConflict`].
    pub fn generate(&self, is_taken: impl Fn(&str) -> bool) -> Result<String> {
        let mut candidates: Vec<&String> = self.names.iter().collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .find(|name| !is_taken(name))
            .cloned()
            .ok_or_else(|| Error::NameConflict("<every generated name is taken>".to_string()))
    }
}

/// Apply the blank-space policy to a requested name.
pub fn apply_space_policy(name: &str, allow_blank_space: bool) -> String {
    let name = name.trim();
    if allow_blank_space {
        name.to_string()
    } else {
        name.replace(' ', "-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_skips_taken_names() {
        let generator = NameGenerator::from_names(vec!["alpha".into(), "beta".into()]);
        let name = generator.generate(|n| n == "alpha").unwrap();
        assert_eq!(name, "beta");
    }

    #[test]
    fn test_generate_exhausted_dictionary() {
        let generator = NameGenerator::from_names(vec!["alpha".into(), "beta".into()]);
        let result = generator.generate(|_| true);
        assert!(matches!(result, Err(Error::NameConflict(_))));
    }

    #[test]
    fn test_from_file_ignores_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.txt");
        std::fs::write(&path, "one\n\n  two  \n").unwrap();
        let generator = NameGenerator::from_file(&path).unwrap();
        assert_eq!(generator.len(), 2);
    }

    #[test]
    fn test_space_policy() {
        assert_eq!(apply_space_policy("db node", false), "db-node");
        assert_eq!(apply_space_policy("db node", true), "db node");
    }

    #[test]
    fn test_builtin_dictionary_not_empty() {
        assert!(!NameGenerator::default().is_empty());
    }
}
