use crate::error::{EffectError, EffectResult};
use crate::event::{encode_parameters, encoded_entry_len};
use crate::ids::{ParamId, ParamValue};

pub const DEFAULT_PARAM_BUFFER_BYTES: usize = 1024;

/// Parameter writes staged by a controlling handle, committed in one request.
#[derive(Debug, Clone)]
pub struct ParameterBatch {
    entries: Vec<(ParamId, ParamValue)>,
    used: usize,
    capacity: usize,
    epoch: Option<u64>,
}

impl ParameterBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            used: 0,
            capacity,
            epoch: None,
        }
    }

    /// Append a write. `epoch` is the caller's control epoch; the first
    /// staged write pins it for the whole batch.
    pub fn stage(&mut self, id: ParamId, value: ParamValue, epoch: u64) -> EffectResult<()> {
        if value.is_empty() {
            return Err(EffectError::invalid_argument("empty parameter value"));
        }
        let size = encoded_entry_len(value.len());
        let available = self.available();
        if size > available {
            return Err(EffectError::ResourceExhausted {
                requested: size,
                available,
            });
        }
        self.epoch.get_or_insert(epoch);
        self.used += size;
        self.entries.push((id, value));
        Ok(())
    }

    /// Take every staged write, leaving the batch empty.
    pub fn take(&mut self) -> StagedWrites {
        let epoch = self.epoch.take();
        self.used = 0;
        StagedWrites {
            entries: std::mem::take(&mut self.entries),
            epoch,
        }
    }

    pub fn clear(&mut self) {
        self.take();
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }
}

impl Default for ParameterBatch {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PARAM_BUFFER_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedWrites {
    pub entries: Vec<(ParamId, ParamValue)>,
    pub epoch: Option<u64>,
}

impl StagedWrites {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_parameters(&self.entries)
    }
}
