//! Request loop owning every engine instance served by the bridge.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::Receiver;
use harmoniq_fx_client::{
    encode_parameters, Attachment, AttachmentId, ControlChange, EffectError, EffectRequest,
    EffectResult, EffectUuid, EngineEvent, EngineIdentity, EventSink, InstanceId,
    NotificationHub, ParamId, ParamValue, Recipients, SessionId,
};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::engine::EngineInstance;
use crate::ipc::{BridgeRequest, InstanceSnapshot};
use crate::registry::EffectRegistry;

pub const SERVER_THREAD_NAME: &str = "fx-bridge";

#[derive(Debug)]
pub struct BridgeServer {
    config: BridgeConfig,
    registry: EffectRegistry,
    hub: Arc<NotificationHub>,
}

impl BridgeServer {
    pub fn new(config: BridgeConfig, registry: EffectRegistry, hub: Arc<NotificationHub>) -> Self {
        Self {
            config,
            registry,
            hub,
        }
    }

    /// Serve `requests` on a dedicated thread until a shutdown request
    /// arrives or every sender is gone. Instances still alive at that point
    /// die with the server.
    pub fn run(self, requests: Receiver<BridgeRequest>) -> EffectResult<thread::JoinHandle<()>> {
        let mut state = ServerState::new(self);
        thread::Builder::new()
            .name(SERVER_THREAD_NAME.into())
            .spawn(move || {
                while let Ok(request) = requests.recv() {
                    if !state.handle(request) {
                        break;
                    }
                }
                state.kill_all();
            })
            .map_err(|err| {
                EffectError::unavailable(format!("failed to spawn bridge server: {err}"))
            })
    }
}

struct ServerState {
    config: BridgeConfig,
    registry: EffectRegistry,
    hub: Arc<NotificationHub>,
    instances: HashMap<InstanceId, EngineInstance>,
    by_key: HashMap<(EffectUuid, SessionId), InstanceId>,
    attachments: HashMap<AttachmentId, InstanceId>,
    orphaned: HashSet<AttachmentId>,
}

impl ServerState {
    fn new(server: BridgeServer) -> Self {
        Self {
            config: server.config,
            registry: server.registry,
            hub: server.hub,
            instances: HashMap::new(),
            by_key: HashMap::new(),
            attachments: HashMap::new(),
            orphaned: HashSet::new(),
        }
    }

    /// Returns `false` once the loop should stop.
    fn handle(&mut self, request: BridgeRequest) -> bool {
        debug!(request = request.name(), "bridge request");
        // A failed reply send means the caller gave up waiting; nothing to do.
        match request {
            BridgeRequest::Attach {
                request,
                sink,
                reply,
            } => {
                let _ = reply.send(self.attach(&request, sink));
            }
            BridgeRequest::Detach { attachment, reply } => {
                self.detach(attachment);
                let _ = reply.send(Ok(()));
            }
            BridgeRequest::Command {
                attachment,
                code,
                payload,
                reply,
            } => {
                let _ = reply.send(self.command(attachment, code, &payload));
            }
            BridgeRequest::SetParameters {
                attachment,
                batch,
                reply,
            } => {
                let _ = reply.send(self.set_parameters(attachment, &batch));
            }
            BridgeRequest::GetParameter {
                attachment,
                id,
                reply,
            } => {
                let _ = reply.send(self.get_parameter(attachment, id));
            }
            BridgeRequest::SetEnabled {
                attachment,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_enabled(attachment, enabled));
            }
            BridgeRequest::ProcessFrames {
                instance,
                frames,
                reply,
            } => {
                let _ = reply.send(self.process_frames(instance, frames));
            }
            BridgeRequest::ReportError {
                instance,
                code,
                reply,
            } => {
                let _ = reply.send(self.report_error(instance, code));
            }
            BridgeRequest::KillInstance { instance, reply } => {
                let _ = reply.send(Ok(self.kill(instance)));
            }
            BridgeRequest::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            BridgeRequest::Shutdown => {
                info!(instances = self.instances.len(), "bridge shutting down");
                return false;
            }
        }
        true
    }

    /// Check that `request` could be served right now. Returns the instance
    /// it would join, or `None` when a new one has to be created.
    fn admit(
        &self,
        request: &EffectRequest,
        key: (EffectUuid, SessionId),
    ) -> EffectResult<Option<InstanceId>> {
        let Some(id) = self.by_key.get(&key).copied() else {
            if self.instances.len() >= self.config.max_instances {
                return Err(EffectError::unavailable("engine instance limit reached"));
            }
            return Ok(None);
        };
        let instance = self
            .instances
            .get(&id)
            .ok_or_else(|| EffectError::unavailable("instance vanished"))?;
        if request
            .implementation
            .is_some_and(|imp| imp != instance.identity().implementation)
        {
            return Err(EffectError::unavailable(format!(
                "{} already runs another implementation",
                instance.identity().instance
            )));
        }
        if instance.arbiter().len() >= self.config.max_attachments_per_instance {
            return Err(EffectError::unavailable(format!(
                "{} has no free attachment slots",
                instance.identity().instance
            )));
        }
        Ok(Some(id))
    }

    fn attach(
        &mut self,
        request: &EffectRequest,
        sink: Weak<dyn EventSink>,
    ) -> EffectResult<Attachment> {
        let descriptor = self
            .registry
            .resolve(request.effect_type, request.implementation)?
            .clone();
        let key = (descriptor.effect_type, request.session);
        let existing = self.admit(request, key)?;

        if request.probe {
            debug!(effect = %descriptor.name, joins = ?existing, "probe attach");
            return Ok(Attachment {
                identity: EngineIdentity {
                    effect_type: descriptor.effect_type,
                    implementation: descriptor.implementation,
                    instance: InstanceId::NONE,
                    session: request.session,
                },
                id: None,
                controlling: false,
                enabled: false,
            });
        }

        let instance_id = match existing {
            Some(id) => id,
            None => {
                let identity = EngineIdentity {
                    effect_type: descriptor.effect_type,
                    implementation: descriptor.implementation,
                    instance: InstanceId::next(),
                    session: request.session,
                };
                info!(
                    instance = %identity.instance,
                    effect = %descriptor.name,
                    session = request.session.0,
                    "engine created"
                );
                self.instances
                    .insert(identity.instance, EngineInstance::new(identity, descriptor));
                self.by_key.insert(key, identity.instance);
                identity.instance
            }
        };

        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| EffectError::unavailable("instance vanished"))?;
        let identity = instance.identity();
        let attached = instance.attach(request.priority, request.notify_frames_processed);
        if let Err(err) = self.hub.subscribe(identity, attached.attachment, sink) {
            instance.detach(attached.attachment);
            return Err(err);
        }
        let controlling = instance.arbiter().is_controller(attached.attachment);
        let enabled = instance.enabled();
        self.attachments.insert(attached.attachment, instance_id);
        self.publish_control(instance_id, &attached.changes);
        Ok(Attachment {
            identity,
            id: Some(attached.attachment),
            controlling,
            enabled,
        })
    }

    fn detach(&mut self, attachment: AttachmentId) {
        if self.orphaned.remove(&attachment) {
            return;
        }
        let Some(instance_id) = self.attachments.remove(&attachment) else {
            return;
        };
        self.hub.unsubscribe(attachment);
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            return;
        };
        let changes = instance.detach(attachment);
        let now_empty = instance.arbiter().is_empty();
        self.publish_control(instance_id, &changes);
        if now_empty {
            if let Some(instance) = self.instances.remove(&instance_id) {
                let identity = instance.identity();
                self.by_key.remove(&(identity.effect_type, identity.session));
                info!(
                    instance = %instance_id,
                    effect = %instance.descriptor().name,
                    "engine released"
                );
            }
        }
    }

    fn publish_control(&self, instance: InstanceId, changes: &[ControlChange]) {
        for change in changes {
            self.hub.publish(
                instance,
                Recipients::Only(change.attachment),
                EngineEvent::ControlStatusChanged {
                    granted: change.granted,
                },
            );
        }
    }

    fn lookup(&self, attachment: AttachmentId) -> EffectResult<InstanceId> {
        if self.orphaned.contains(&attachment) {
            return Err(EffectError::DeadObject);
        }
        self.attachments
            .get(&attachment)
            .copied()
            .ok_or_else(|| EffectError::invalid_operation(format!("{attachment} is not attached")))
    }

    fn controlled(&mut self, attachment: AttachmentId) -> EffectResult<&mut EngineInstance> {
        let instance_id = self.lookup(attachment)?;
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or(EffectError::DeadObject)?;
        instance.require_controller(attachment)?;
        Ok(instance)
    }

    fn command(
        &mut self,
        attachment: AttachmentId,
        code: u32,
        payload: &[u8],
    ) -> EffectResult<Vec<u8>> {
        let instance = self.controlled(attachment)?;
        let instance_id = instance.identity().instance;
        let outcome = instance.command(code, payload)?;
        if let Some(event) = outcome.broadcast {
            self.hub
                .publish(instance_id, Recipients::AllExcept(attachment), event);
        }
        Ok(outcome.reply)
    }

    fn set_parameters(
        &mut self,
        attachment: AttachmentId,
        batch: &[(ParamId, ParamValue)],
    ) -> EffectResult<()> {
        let instance = self.controlled(attachment)?;
        let instance_id = instance.identity().instance;
        instance.apply(batch)?;
        self.hub.publish(
            instance_id,
            Recipients::AllExcept(attachment),
            EngineEvent::ParameterChanged {
                payload: encode_parameters(batch),
            },
        );
        Ok(())
    }

    fn get_parameter(&self, attachment: AttachmentId, id: ParamId) -> EffectResult<ParamValue> {
        let instance_id = self.lookup(attachment)?;
        self.instances
            .get(&instance_id)
            .ok_or(EffectError::DeadObject)?
            .get(id)
    }

    fn set_enabled(&mut self, attachment: AttachmentId, enabled: bool) -> EffectResult<()> {
        let instance = self.controlled(attachment)?;
        let instance_id = instance.identity().instance;
        if instance.set_enabled(enabled) {
            self.hub.publish(
                instance_id,
                Recipients::AllExcept(attachment),
                EngineEvent::EnableStatusChanged { enabled },
            );
        }
        Ok(())
    }

    fn process_frames(&mut self, instance_id: InstanceId, frames: u32) -> EffectResult<usize> {
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| {
                EffectError::invalid_argument(format!("unknown instance {instance_id}"))
            })?;
        let listeners = instance.process(frames);
        Ok(listeners
            .into_iter()
            .map(|listener| {
                self.hub.publish(
                    instance_id,
                    Recipients::Only(listener),
                    EngineEvent::FramesProcessed { frames },
                )
            })
            .sum())
    }

    fn report_error(&self, instance_id: InstanceId, code: i32) -> EffectResult<usize> {
        if !self.instances.contains_key(&instance_id) {
            return Err(EffectError::invalid_argument(format!(
                "unknown instance {instance_id}"
            )));
        }
        Ok(self
            .hub
            .publish(instance_id, Recipients::All, EngineEvent::Error { code }))
    }

    /// Simulate the death of one engine. Its attachments keep answering
    /// `DeadObject` until their owners detach.
    fn kill(&mut self, instance_id: InstanceId) -> bool {
        let Some(mut instance) = self.instances.remove(&instance_id) else {
            return false;
        };
        let identity = instance.identity();
        self.by_key.remove(&(identity.effect_type, identity.session));
        for attachment in instance.destroy() {
            self.attachments.remove(&attachment);
            self.orphaned.insert(attachment);
        }
        warn!(
            instance = %instance_id,
            effect = %instance.descriptor().name,
            "engine killed"
        );
        self.hub.engine_died(instance_id)
    }

    fn kill_all(&mut self) {
        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        for id in ids {
            self.kill(id);
        }
    }

    fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let mut snapshots: Vec<InstanceSnapshot> = self
            .instances
            .values()
            .map(|instance| InstanceSnapshot {
                identity: instance.identity(),
                controller: instance.arbiter().current_controller(),
                attachments: instance.arbiter().attachments(),
                enabled: instance.enabled(),
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.identity.instance.0);
        snapshots
    }
}
