use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metronome::MetronomeSettings;
use crate::registry::TargetType;

/// A test as submitted in the suite; shipped to every participant in
/// `CreateTest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: String,
    /// Name resolved by the worker's `TestFactory`.
    pub test_type: String,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default)]
    pub target: TargetType,
    #[serde(default)]
    pub metronome: MetronomeSettings,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

const fn default_threads() -> u32 {
    1
}

impl TestDefinition {
    #[must_use]
    pub fn new(id: impl Into<String>, test_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            test_type: test_type.into(),
            threads: 1,
            target: TargetType::All,
            metronome: MetronomeSettings::default(),
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
