use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub max_instances: usize,
    pub max_attachments_per_instance: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_instances: 64,
            max_attachments_per_instance: 16,
        }
    }
}

impl BridgeConfig {
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_max_attachments_per_instance(mut self, max: usize) -> Self {
        self.max_attachments_per_instance = max;
        self
    }
}
