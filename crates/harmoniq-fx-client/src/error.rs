use thiserror::Error;

/// Numeric status codes carried by `error(code)` events and command replies.
pub mod status {
    pub const OK: i32 = 0;
    pub const PERMISSION_DENIED: i32 = -1;
    pub const NAME_NOT_FOUND: i32 = -2;
    pub const NO_MEMORY: i32 = -12;
    pub const NO_INIT: i32 = -19;
    pub const BAD_VALUE: i32 = -22;
    pub const DEAD_OBJECT: i32 = -32;
    pub const INVALID_OPERATION: i32 = -38;
    pub const NOT_ENOUGH_DATA: i32 = -61;
}

/// Errors surfaced by effect handles and engine channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("effect engine unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("effect handle is not initialized")]
    NotInitialized,
    #[error("parameter staging area full: {requested} bytes requested, {available} available")]
    ResourceExhausted { requested: usize, available: usize },
    #[error("effect engine is dead")]
    DeadObject,
    #[error("no parameters staged")]
    NothingStaged,
    #[error("handle does not hold control of the effect engine")]
    NotController,
}

impl EffectError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ResourceUnavailable(message.into())
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub fn status(&self) -> i32 {
        match self {
            EffectError::InvalidArgument(_) => status::BAD_VALUE,
            EffectError::ResourceUnavailable(_) => status::NAME_NOT_FOUND,
            EffectError::InvalidOperation(_) => status::INVALID_OPERATION,
            EffectError::NotInitialized => status::NO_INIT,
            EffectError::ResourceExhausted { .. } => status::NO_MEMORY,
            EffectError::DeadObject => status::DEAD_OBJECT,
            EffectError::NothingStaged => status::NOT_ENOUGH_DATA,
            EffectError::NotController => status::PERMISSION_DENIED,
        }
    }

    /// Map a status code back to an error. `OK` and unknown codes yield `None`.
    pub fn from_status(code: i32) -> Option<Self> {
        let error = match code {
            status::BAD_VALUE => Self::invalid_argument("rejected by effect engine"),
            status::NAME_NOT_FOUND => Self::unavailable("rejected by effect engine"),
            status::INVALID_OPERATION => Self::invalid_operation("rejected by effect engine"),
            status::NO_INIT => Self::NotInitialized,
            status::NO_MEMORY => Self::ResourceExhausted {
                requested: 0,
                available: 0,
            },
            status::DEAD_OBJECT => Self::DeadObject,
            status::NOT_ENOUGH_DATA => Self::NothingStaged,
            status::PERMISSION_DENIED => Self::NotController,
            _ => return None,
        };
        Some(error)
    }
}

pub type EffectResult<T> = Result<T, EffectError>;
