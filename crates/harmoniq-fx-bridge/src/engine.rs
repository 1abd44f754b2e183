use std::collections::{BTreeMap, BTreeSet};

use harmoniq_fx_client::{
    decode_parameters, encode_parameters, status, status_word, Attached, AttachmentId,
    ControlArbiter, ControlChange, EffectCommand, EffectError, EffectResult, EngineEvent,
    EngineIdentity, ParamId, ParamValue, Priority,
};
use tracing::trace;

use crate::registry::EffectDescriptor;

/// Result of a raw command: the reply bytes plus the event other
/// attachments should see, if the command changed engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub reply: Vec<u8>,
    pub broadcast: Option<EngineEvent>,
}

impl CommandOutcome {
    fn status(code: i32) -> Self {
        Self {
            reply: status_word(code),
            broadcast: None,
        }
    }
}

/// Authoritative state of one shared effect instance.
#[derive(Debug)]
pub struct EngineInstance {
    identity: EngineIdentity,
    descriptor: EffectDescriptor,
    arbiter: ControlArbiter,
    enabled: bool,
    params: BTreeMap<ParamId, ParamValue>,
    frame_listeners: BTreeSet<AttachmentId>,
    frames_processed: u64,
}

impl EngineInstance {
    pub fn new(identity: EngineIdentity, descriptor: EffectDescriptor) -> Self {
        let params = default_params(&descriptor);
        Self {
            identity,
            descriptor,
            arbiter: ControlArbiter::new(),
            enabled: false,
            params,
            frame_listeners: BTreeSet::new(),
            frames_processed: 0,
        }
    }

    pub fn identity(&self) -> EngineIdentity {
        self.identity
    }

    pub fn descriptor(&self) -> &EffectDescriptor {
        &self.descriptor
    }

    pub fn arbiter(&self) -> &ControlArbiter {
        &self.arbiter
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn attach(&mut self, priority: Priority, wants_frames: bool) -> Attached {
        let attached = self.arbiter.attach(priority, false);
        if wants_frames {
            self.frame_listeners.insert(attached.attachment);
        }
        attached
    }

    pub fn detach(&mut self, attachment: AttachmentId) -> Vec<ControlChange> {
        self.frame_listeners.remove(&attachment);
        self.arbiter.detach(attachment)
    }

    /// Every attachment currently on this instance.
    pub fn attachments(&self) -> Vec<AttachmentId> {
        self.arbiter.attachments().into_iter().map(|(id, _)| id).collect()
    }

    /// Tear the instance down. Returns the attachments it still had.
    pub fn destroy(&mut self) -> Vec<AttachmentId> {
        let attachments = self.attachments();
        let revoked = self.arbiter.clear();
        self.frame_listeners.clear();
        self.enabled = false;
        trace!(
            instance = %self.identity.instance,
            attachments = attachments.len(),
            revoked = revoked.len(),
            "instance destroyed"
        );
        attachments
    }

    pub fn require_controller(&self, attachment: AttachmentId) -> EffectResult<()> {
        if self.arbiter.is_controller(attachment) {
            Ok(())
        } else {
            Err(EffectError::invalid_operation(format!(
                "{attachment} does not control {}",
                self.identity.instance
            )))
        }
    }

    /// Check a whole batch without applying any of it. All problems are
    /// folded into one error.
    pub fn validate(&self, batch: &[(ParamId, ParamValue)]) -> EffectResult<()> {
        let problems: Vec<String> = batch
            .iter()
            .filter_map(|(id, value)| match self.descriptor.param(*id) {
                None => Some(format!("unknown parameter {}", id.0)),
                Some(spec) if spec.size != value.len() => Some(format!(
                    "parameter {} expects {} bytes, got {}",
                    id.0,
                    spec.size,
                    value.len()
                )),
                Some(_) => None,
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(EffectError::invalid_argument(problems.join("; ")))
        }
    }

    pub fn apply(&mut self, batch: &[(ParamId, ParamValue)]) -> EffectResult<()> {
        self.validate(batch)?;
        for (id, value) in batch {
            self.params.insert(*id, value.clone());
        }
        trace!(instance = %self.identity.instance, writes = batch.len(), "parameters applied");
        Ok(())
    }

    pub fn get(&self, id: ParamId) -> EffectResult<ParamValue> {
        self.params
            .get(&id)
            .cloned()
            .ok_or_else(|| EffectError::invalid_argument(format!("unknown parameter {}", id.0)))
    }

    /// Returns whether the state changed.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let changed = self.enabled != enabled;
        self.enabled = enabled;
        changed
    }

    pub fn command(&mut self, code: u32, payload: &[u8]) -> EffectResult<CommandOutcome> {
        match EffectCommand::from(code) {
            EffectCommand::Init | EffectCommand::Reset => {
                self.params = default_params(&self.descriptor);
                self.frames_processed = 0;
                Ok(CommandOutcome::status(status::OK))
            }
            EffectCommand::Enable | EffectCommand::Disable => {
                let enabled = EffectCommand::from(code) == EffectCommand::Enable;
                let broadcast = self
                    .set_enabled(enabled)
                    .then_some(EngineEvent::EnableStatusChanged { enabled });
                Ok(CommandOutcome {
                    reply: status_word(status::OK),
                    broadcast,
                })
            }
            EffectCommand::SetParam => {
                let batch = decode_parameters(payload)?;
                match self.apply(&batch) {
                    Ok(()) => Ok(CommandOutcome {
                        reply: status_word(status::OK),
                        broadcast: Some(EngineEvent::ParameterChanged {
                            payload: encode_parameters(&batch),
                        }),
                    }),
                    Err(err) => Ok(CommandOutcome::status(err.status())),
                }
            }
            EffectCommand::GetParam => {
                let id: [u8; 4] = payload
                    .get(..4)
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or_else(|| EffectError::invalid_argument("missing parameter id"))?;
                let id = ParamId(u32::from_le_bytes(id));
                match self.get(id) {
                    Ok(value) => {
                        let mut reply = status_word(status::OK);
                        reply.extend(encode_parameters(&[(id, value)]));
                        Ok(CommandOutcome {
                            reply,
                            broadcast: None,
                        })
                    }
                    Err(err) => Ok(CommandOutcome::status(err.status())),
                }
            }
            EffectCommand::Other(code) => Err(EffectError::invalid_argument(format!(
                "unsupported command {code}"
            ))),
        }
    }

    /// Account for a processed block. Returns the attachments that asked to
    /// hear about it, or nothing while the engine is disabled.
    pub fn process(&mut self, frames: u32) -> Vec<AttachmentId> {
        if !self.enabled {
            return Vec::new();
        }
        self.frames_processed += u64::from(frames);
        self.frame_listeners.iter().copied().collect()
    }
}

fn default_params(descriptor: &EffectDescriptor) -> BTreeMap<ParamId, ParamValue> {
    descriptor
        .params
        .iter()
        .map(|spec| (spec.id, spec.default.clone()))
        .collect()
}
