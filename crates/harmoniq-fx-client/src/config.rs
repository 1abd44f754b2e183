use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_PARAM_BUFFER_BYTES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectConfig {
    /// Capacity of the deferred parameter staging area, in encoded bytes.
    pub param_buffer_bytes: usize,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            param_buffer_bytes: DEFAULT_PARAM_BUFFER_BYTES,
        }
    }
}

impl EffectConfig {
    pub fn with_param_buffer_bytes(mut self, bytes: usize) -> Self {
        self.param_buffer_bytes = bytes;
        self
    }
}
