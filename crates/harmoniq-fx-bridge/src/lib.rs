//! In-process effect engine host used for tests and offline development.
//!
//! [`LoopbackChannel`] implements the client's `EngineChannel` on top of a
//! [`BridgeServer`] thread that owns every shared engine instance.

pub mod channel;
pub mod config;
pub mod engine;
pub mod ipc;
pub mod registry;
pub mod server;

pub use channel::LoopbackChannel;
pub use config::BridgeConfig;
pub use engine::{CommandOutcome, EngineInstance};
pub use ipc::{request_channel, BridgeRequest, InstanceSnapshot, Reply};
pub use registry::{
    EffectDescriptor, EffectRegistry, ParamSpec, BASS_BOOST, EQUALIZER, PRESET_REVERB, VIRTUALIZER,
};
pub use server::{BridgeServer, SERVER_THREAD_NAME};
