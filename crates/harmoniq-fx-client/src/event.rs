use serde::{Deserialize, Serialize};

use crate::error::{status, EffectError, EffectResult};
use crate::ids::{ParamId, ParamValue};

/// Notification originated by a remote engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    ControlStatusChanged { granted: bool },
    EnableStatusChanged { enabled: bool },
    /// Raw parameter payload, see [`encode_parameters`].
    ParameterChanged { payload: Vec<u8> },
    Error { code: i32 },
    FramesProcessed { frames: u32 },
}

impl EngineEvent {
    pub fn dead_object() -> Self {
        EngineEvent::Error {
            code: status::DEAD_OBJECT,
        }
    }

    /// The error an `Error` event stands for, if its code is a known status.
    pub fn error(&self) -> Option<EffectError> {
        match self {
            EngineEvent::Error { code } => EffectError::from_status(*code),
            _ => None,
        }
    }

    pub fn is_dead_object(&self) -> bool {
        self.error() == Some(EffectError::DeadObject)
    }
}

/// Command codes understood by effect engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectCommand {
    Init,
    Reset,
    Enable,
    Disable,
    SetParam,
    GetParam,
    Other(u32),
}

impl EffectCommand {
    pub fn code(&self) -> u32 {
        match self {
            EffectCommand::Init => 0,
            EffectCommand::Reset => 2,
            EffectCommand::Enable => 3,
            EffectCommand::Disable => 4,
            EffectCommand::SetParam => 5,
            EffectCommand::GetParam => 8,
            EffectCommand::Other(code) => *code,
        }
    }
}

impl From<u32> for EffectCommand {
    fn from(code: u32) -> Self {
        match code {
            0 => EffectCommand::Init,
            2 => EffectCommand::Reset,
            3 => EffectCommand::Enable,
            4 => EffectCommand::Disable,
            5 => EffectCommand::SetParam,
            8 => EffectCommand::GetParam,
            other => EffectCommand::Other(other),
        }
    }
}

const ENTRY_HEADER: usize = 8;

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Bytes one `(id, value)` entry occupies in a parameter payload.
pub fn encoded_entry_len(value_len: usize) -> usize {
    ENTRY_HEADER + padded(value_len)
}

pub fn encode_parameter_into(out: &mut Vec<u8>, id: ParamId, value: &ParamValue) {
    out.extend_from_slice(&id.0.to_le_bytes());
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    out.resize(out.len() + padded(value.len()) - value.len(), 0);
}

/// Encode a parameter sequence: per entry a `u32` id, a `u32` value length,
/// the value and zero padding to four bytes. All integers little-endian.
pub fn encode_parameters(entries: &[(ParamId, ParamValue)]) -> Vec<u8> {
    let len = entries
        .iter()
        .map(|(_, value)| encoded_entry_len(value.len()))
        .sum();
    let mut out = Vec::with_capacity(len);
    for (id, value) in entries {
        encode_parameter_into(&mut out, *id, value);
    }
    out
}

pub fn decode_parameters(mut bytes: &[u8]) -> EffectResult<Vec<(ParamId, ParamValue)>> {
    let mut entries = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < ENTRY_HEADER {
            return Err(EffectError::invalid_argument("truncated parameter header"));
        }
        let id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let body = &bytes[ENTRY_HEADER..];
        if len > body.len() || padded(len) > body.len() {
            return Err(EffectError::invalid_argument("truncated parameter value"));
        }
        entries.push((ParamId(id), ParamValue(body[..len].to_vec())));
        bytes = &body[padded(len)..];
    }
    Ok(entries)
}

pub fn status_word(code: i32) -> Vec<u8> {
    code.to_le_bytes().to_vec()
}

/// Read the leading status word of a command reply.
pub fn reply_status(reply: &[u8]) -> Option<i32> {
    let word: [u8; 4] = reply.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(word))
}
