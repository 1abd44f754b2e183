//! Client side of the shared effect engine protocol.
//!
//! Several clients may attach to the same remote effect instance. At most one
//! of them controls it at a time (the highest-priority attachment), and every
//! attachment is told about control, enable and parameter changes through
//! asynchronous notifications. [`EffectHandle`] is the per-client view; the
//! remaining modules are the building blocks an engine host uses to arbitrate
//! and fan out to those handles.

pub mod arbiter;
pub mod batch;
pub mod callback;
pub mod channel;
pub mod config;
mod error;
pub mod event;
pub mod handle;
pub mod hub;
pub mod ids;

pub use arbiter::{Attached, ControlArbiter, ControlChange};
pub use batch::{ParameterBatch, StagedWrites, DEFAULT_PARAM_BUFFER_BYTES};
pub use callback::{callback_fn, EffectCallback};
pub use channel::{Attachment, EffectRequest, EngineChannel};
pub use config::EffectConfig;
pub use error::{status, EffectError, EffectResult};
pub use event::{
    decode_parameters, encode_parameters, encoded_entry_len, reply_status, status_word,
    EffectCommand, EngineEvent,
};
pub use handle::{EffectHandle, HandleState};
pub use hub::{EventSink, NotificationHub, Recipients, DISPATCHER_THREAD_NAME};
pub use ids::{
    AttachmentId, EffectUuid, EngineIdentity, InstanceId, ParamId, ParamValue, Priority, SessionId,
};
