use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_INSTANCE: AtomicI32 = AtomicI32::new(0);
static NEXT_ATTACHMENT: AtomicU64 = AtomicU64::new(0);

/// 128-bit identifier of an effect type or of a concrete implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectUuid(pub u128);

impl fmt::Display for EffectUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xffff_ffff_ffff
        )
    }
}

/// Audio session an engine instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub i32);

impl SessionId {
    /// The global output mix.
    pub const OUTPUT_MIX: SessionId = SessionId(0);
}

impl Default for SessionId {
    fn default() -> Self {
        Self::OUTPUT_MIX
    }
}

/// System-wide unique id of a remote engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub i32);

impl InstanceId {
    /// Reported for probe attachments, which never allocate an engine.
    pub const NONE: InstanceId = InstanceId(-1);

    pub fn next() -> Self {
        InstanceId(NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fx#{}", self.0)
    }
}

/// One client's registered relationship to an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentId(pub u64);

impl AttachmentId {
    pub fn next() -> Self {
        AttachmentId(NEXT_ATTACHMENT.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "att#{}", self.0)
    }
}

/// Control priority of an attachment. Higher wins, `0` is neutral.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Priority(pub i32);

impl Priority {
    pub const NEUTRAL: Priority = Priority(0);
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

/// Immutable identity of a shared engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineIdentity {
    pub effect_type: EffectUuid,
    pub implementation: EffectUuid,
    pub instance: InstanceId,
    pub session: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub u32);

impl From<u32> for ParamId {
    fn from(value: u32) -> Self {
        ParamId(value)
    }
}

/// Opaque parameter value as understood by the remote engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamValue(pub Vec<u8>);

impl ParamValue {
    pub fn from_i32(value: i32) -> Self {
        ParamValue(value.to_le_bytes().to_vec())
    }

    /// Interpret the payload as a little-endian `i32`.
    pub fn as_i32(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.0.as_slice().try_into().ok()?;
        Some(i32::from_le_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::from_i32(value)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(value: Vec<u8>) -> Self {
        ParamValue(value)
    }
}
