use std::sync::Weak;

use serde::{Deserialize, Serialize};

use crate::error::EffectResult;
use crate::hub::EventSink;
use crate::ids::{
    AttachmentId, EffectUuid, EngineIdentity, ParamId, ParamValue, Priority, SessionId,
};

/// What a client asks for when attaching to an effect engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectRequest {
    pub effect_type: Option<EffectUuid>,
    pub implementation: Option<EffectUuid>,
    pub session: SessionId,
    pub priority: Priority,
    /// Only check that the engine could be created; attach nothing.
    pub probe: bool,
    pub notify_frames_processed: bool,
}

impl EffectRequest {
    pub fn for_type(effect_type: EffectUuid) -> Self {
        Self {
            effect_type: Some(effect_type),
            ..Self::default()
        }
    }

    pub fn for_implementation(implementation: EffectUuid) -> Self {
        Self {
            implementation: Some(implementation),
            ..Self::default()
        }
    }

    pub fn with_implementation(mut self, implementation: EffectUuid) -> Self {
        self.implementation = Some(implementation);
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn probe(mut self) -> Self {
        self.probe = true;
        self
    }

    pub fn with_frames_processed(mut self) -> Self {
        self.notify_frames_processed = true;
        self
    }

    pub fn has_identifier(&self) -> bool {
        self.effect_type.is_some() || self.implementation.is_some()
    }
}

impl Default for EffectRequest {
    fn default() -> Self {
        Self {
            effect_type: None,
            implementation: None,
            session: SessionId::OUTPUT_MIX,
            priority: Priority::NEUTRAL,
            probe: false,
            notify_frames_processed: false,
        }
    }
}

/// Reply to a successful attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub identity: EngineIdentity,
    /// `None` for probes.
    pub id: Option<AttachmentId>,
    pub controlling: bool,
    pub enabled: bool,
}

/// Transport to the remote effect engine.
///
/// Every call blocks until the engine replies or the connection is declared
/// dead, in which case it fails with [`EffectError::DeadObject`].
///
/// [`EffectError::DeadObject`]: crate::EffectError::DeadObject
pub trait EngineChannel: Send + Sync {
    /// Attach to the engine for `request`, creating it if needed. `sink`
    /// is subscribed before any event for the new attachment is published.
    fn create_or_attach(
        &self,
        request: &EffectRequest,
        sink: Weak<dyn EventSink>,
    ) -> EffectResult<Attachment>;

    fn detach(&self, attachment: AttachmentId);

    fn send_command(
        &self,
        attachment: AttachmentId,
        code: u32,
        payload: &[u8],
    ) -> EffectResult<Vec<u8>>;

    fn set_parameters(
        &self,
        attachment: AttachmentId,
        batch: &[(ParamId, ParamValue)],
    ) -> EffectResult<()>;

    fn get_parameter(&self, attachment: AttachmentId, id: ParamId) -> EffectResult<ParamValue>;

    fn set_enabled(&self, attachment: AttachmentId, enabled: bool) -> EffectResult<()>;
}
