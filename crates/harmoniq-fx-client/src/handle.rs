//! Client-facing handle on a shared effect engine.
//!
//! A handle mirrors the engine's control and enable state locally so that
//! requests which cannot succeed are refused without a round trip. The
//! mirror is updated from engine notifications under the same lock that
//! serializes the handle's own mutations; user callbacks always run after
//! that lock has been released.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use crate::batch::ParameterBatch;
use crate::callback::EffectCallback;
use crate::channel::{EffectRequest, EngineChannel};
use crate::config::EffectConfig;
use crate::error::{status, EffectError, EffectResult};
use crate::event::{reply_status, status_word, EffectCommand, EngineEvent};
use crate::hub::EventSink;
use crate::ids::{AttachmentId, EngineIdentity, InstanceId, ParamId, ParamValue, Priority};

/// Observable lifecycle state of an [`EffectHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Uninitialized,
    Initializing,
    Controlling,
    NonControlling,
    /// Attached in probe mode; every mutation is a local no-op.
    Probe,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Initializing,
    Controlling,
    NonControlling,
    Probe,
    Detached { dead: bool },
}

enum Access {
    Probe,
    Controller(AttachmentId),
}

fn released(dead: bool) -> EffectError {
    if dead {
        EffectError::DeadObject
    } else {
        EffectError::invalid_operation("effect handle was released")
    }
}

struct Local {
    phase: Phase,
    identity: Option<EngineIdentity>,
    attachment: Option<AttachmentId>,
    priority: Priority,
    enabled: bool,
    /// Bumped on every loss of control.
    control_epoch: u64,
    /// Control changes seen while the attach request was in flight.
    pending_control: Option<bool>,
    batch: ParameterBatch,
}

impl Local {
    fn apply_control(&mut self, granted: bool) {
        match (self.phase, granted) {
            (Phase::Controlling, false) => {
                self.phase = Phase::NonControlling;
                self.control_epoch += 1;
            }
            (Phase::NonControlling, true) => self.phase = Phase::Controlling,
            (Phase::Initializing, _) => self.pending_control = Some(granted),
            _ => {}
        }
    }

    fn access(&self) -> EffectResult<Access> {
        match self.phase {
            Phase::Controlling => self
                .attachment
                .map(Access::Controller)
                .ok_or(EffectError::NotInitialized),
            Phase::Probe => Ok(Access::Probe),
            Phase::NonControlling => Err(EffectError::invalid_operation(
                "handle does not control the effect engine",
            )),
            Phase::Uninitialized | Phase::Initializing => Err(EffectError::NotInitialized),
            Phase::Detached { dead } => Err(released(dead)),
        }
    }

    fn ensure_attached(&self) -> EffectResult<()> {
        match self.phase {
            Phase::Controlling | Phase::NonControlling | Phase::Probe => Ok(()),
            Phase::Uninitialized | Phase::Initializing => Err(EffectError::NotInitialized),
            Phase::Detached { dead } => Err(released(dead)),
        }
    }
}

struct HandleShared {
    channel: Arc<dyn EngineChannel>,
    callback: Option<Arc<dyn EffectCallback>>,
    local: Mutex<Local>,
    /// Held for the whole of each delivery, callback included.
    delivery: ReentrantMutex<()>,
}

impl EventSink for HandleShared {
    fn deliver(&self, identity: &EngineIdentity, event: &EngineEvent) {
        let _delivering = self.delivery.lock();
        {
            let mut local = self.local.lock();
            match local.phase {
                Phase::Initializing | Phase::Controlling | Phase::NonControlling => {}
                _ => return,
            }
            if local.identity.is_some_and(|own| own.instance != identity.instance) {
                return;
            }
            match event {
                EngineEvent::ControlStatusChanged { granted } => local.apply_control(*granted),
                EngineEvent::EnableStatusChanged { enabled } => local.enabled = *enabled,
                event if event.is_dead_object() => {
                    warn!(instance = %identity.instance, "effect engine died, handle detached");
                    local.phase = Phase::Detached { dead: true };
                    local.batch.clear();
                }
                _ => {}
            }
        }
        if let Some(callback) = &self.callback {
            callback.on_event(event);
        }
    }
}

/// One client's attachment to a shared effect engine.
///
/// Dropping the handle detaches it.
pub struct EffectHandle {
    shared: Arc<HandleShared>,
}

impl EffectHandle {
    pub fn new(channel: Arc<dyn EngineChannel>, config: EffectConfig) -> Self {
        Self::build(channel, config, None)
    }

    pub fn with_callback(
        channel: Arc<dyn EngineChannel>,
        config: EffectConfig,
        callback: Arc<dyn EffectCallback>,
    ) -> Self {
        Self::build(channel, config, Some(callback))
    }

    fn build(
        channel: Arc<dyn EngineChannel>,
        config: EffectConfig,
        callback: Option<Arc<dyn EffectCallback>>,
    ) -> Self {
        let local = Local {
            phase: Phase::Uninitialized,
            identity: None,
            attachment: None,
            priority: Priority::NEUTRAL,
            enabled: false,
            control_epoch: 0,
            pending_control: None,
            batch: ParameterBatch::with_capacity(config.param_buffer_bytes),
        };
        Self {
            shared: Arc::new(HandleShared {
                channel,
                callback,
                local: Mutex::new(local),
                delivery: ReentrantMutex::new(()),
            }),
        }
    }

    /// Attach to (or create) the engine described by `request`.
    pub fn init(&self, request: &EffectRequest) -> EffectResult<()> {
        {
            let mut local = self.shared.local.lock();
            match local.phase {
                Phase::Uninitialized => {}
                Phase::Detached { dead } => return Err(released(dead)),
                _ => {
                    return Err(EffectError::invalid_operation(
                        "effect handle already initialized",
                    ))
                }
            }
            if !request.has_identifier() {
                return Err(EffectError::invalid_argument(
                    "effect type and implementation are both missing",
                ));
            }
            local.phase = Phase::Initializing;
            local.priority = request.priority;
            local.pending_control = None;
        }

        let sink: Arc<dyn EventSink> = self.shared.clone();
        let result = self
            .shared
            .channel
            .create_or_attach(request, Arc::downgrade(&sink));

        let mut local = self.shared.local.lock();
        let attachment = match result {
            Ok(attachment) => attachment,
            Err(err) => {
                if local.phase == Phase::Initializing {
                    local.phase = Phase::Uninitialized;
                }
                warn!(error = %err, "effect attach failed");
                return Err(err);
            }
        };

        if let Phase::Detached { dead } = local.phase {
            drop(local);
            if let Some(id) = attachment.id {
                self.shared.channel.detach(id);
            }
            return Err(released(dead));
        }

        if request.probe {
            if let Some(id) = attachment.id {
                local.phase = Phase::Uninitialized;
                drop(local);
                self.shared.channel.detach(id);
                warn!(%id, "engine attached a probe request, released it");
                return Err(EffectError::unavailable("probe request was attached"));
            }
            local.identity = Some(attachment.identity);
            local.enabled = attachment.enabled;
            local.phase = Phase::Probe;
            debug!(effect_type = %attachment.identity.effect_type, "effect probe succeeded");
            return Ok(());
        }
        let Some(id) = attachment.id else {
            local.phase = Phase::Uninitialized;
            return Err(EffectError::unavailable("engine returned no attachment"));
        };
        local.identity = Some(attachment.identity);
        local.enabled = attachment.enabled;
        let controlling = local.pending_control.take().unwrap_or(attachment.controlling);
        local.attachment = Some(id);
        local.phase = if controlling {
            Phase::Controlling
        } else {
            Phase::NonControlling
        };
        info!(
            instance = %attachment.identity.instance,
            attachment = %id,
            priority = request.priority.0,
            controlling,
            "attached to effect engine"
        );
        Ok(())
    }

    /// `Ok` once the handle is attached (or probing).
    pub fn init_check(&self) -> EffectResult<()> {
        self.shared.local.lock().ensure_attached()
    }

    pub fn state(&self) -> HandleState {
        match self.shared.local.lock().phase {
            Phase::Uninitialized => HandleState::Uninitialized,
            Phase::Initializing => HandleState::Initializing,
            Phase::Controlling => HandleState::Controlling,
            Phase::NonControlling => HandleState::NonControlling,
            Phase::Probe => HandleState::Probe,
            Phase::Detached { .. } => HandleState::Detached,
        }
    }

    pub fn has_control(&self) -> bool {
        self.shared.local.lock().phase == Phase::Controlling
    }

    /// Last known enable state of the engine.
    pub fn enabled(&self) -> bool {
        self.shared.local.lock().enabled
    }

    pub fn identity(&self) -> Option<EngineIdentity> {
        self.shared.local.lock().identity
    }

    /// System-wide id of the engine instance this handle is attached to.
    pub fn id(&self) -> Option<InstanceId> {
        self.identity().map(|identity| identity.instance)
    }

    pub fn priority(&self) -> Priority {
        self.shared.local.lock().priority
    }

    pub fn attachment(&self) -> Option<AttachmentId> {
        self.shared.local.lock().attachment
    }

    /// Number of deferred writes waiting for [`EffectHandle::commit_parameters`].
    pub fn staged_len(&self) -> usize {
        self.shared.local.lock().batch.len()
    }

    pub fn set_enabled(&self, enabled: bool) -> EffectResult<()> {
        let mut local = self.shared.local.lock();
        let attachment = match local.access()? {
            Access::Probe => return Ok(()),
            Access::Controller(id) => id,
        };
        if local.enabled == enabled {
            return Ok(());
        }
        self.shared.channel.set_enabled(attachment, enabled)?;
        local.enabled = enabled;
        Ok(())
    }

    pub fn set_parameter(&self, id: ParamId, value: impl Into<ParamValue>) -> EffectResult<()> {
        let value = value.into();
        let local = self.shared.local.lock();
        let attachment = match local.access()? {
            Access::Probe => return Ok(()),
            Access::Controller(attachment) => attachment,
        };
        if value.is_empty() {
            return Err(EffectError::invalid_argument("empty parameter value"));
        }
        self.shared.channel.set_parameters(attachment, &[(id, value)])
    }

    /// Stage a write for the next [`EffectHandle::commit_parameters`].
    pub fn set_parameter_deferred(
        &self,
        id: ParamId,
        value: impl Into<ParamValue>,
    ) -> EffectResult<()> {
        let mut local = self.shared.local.lock();
        match local.phase {
            Phase::Probe => return Ok(()),
            Phase::Controlling => {}
            Phase::NonControlling => return Err(EffectError::NotController),
            _ => local.ensure_attached()?,
        }
        let epoch = local.control_epoch;
        local.batch.stage(id, value.into(), epoch)
    }

    /// Send every staged write as one request. Staged writes are discarded
    /// if control was lost after the first of them was staged.
    pub fn commit_parameters(&self) -> EffectResult<()> {
        let mut local = self.shared.local.lock();
        match local.phase {
            Phase::Probe => return Ok(()),
            Phase::Controlling | Phase::NonControlling => {}
            _ => local.ensure_attached()?,
        }
        if local.batch.is_empty() {
            return Err(EffectError::NothingStaged);
        }
        let staged = local.batch.take();
        if local.phase != Phase::Controlling || staged.epoch != Some(local.control_epoch) {
            debug!(discarded = staged.entries.len(), "control lost before commit");
            return Err(EffectError::NotController);
        }
        let attachment = local.attachment.ok_or(EffectError::NotInitialized)?;
        match self.shared.channel.set_parameters(attachment, &staged.entries) {
            Err(EffectError::InvalidOperation(_)) => Err(EffectError::NotController),
            other => other,
        }
    }

    /// Read a parameter. Permitted whether or not this handle has control.
    pub fn get_parameter(&self, id: ParamId) -> EffectResult<ParamValue> {
        let attachment = {
            let local = self.shared.local.lock();
            local.ensure_attached()?;
            match local.attachment {
                Some(attachment) if local.phase != Phase::Probe => attachment,
                _ => return Ok(ParamValue::default()),
            }
        };
        self.shared.channel.get_parameter(attachment, id)
    }

    /// Pass a raw command through to the engine and return its reply.
    pub fn command(&self, code: u32, payload: &[u8]) -> EffectResult<Vec<u8>> {
        let mut local = self.shared.local.lock();
        let attachment = match local.access()? {
            Access::Probe => return Ok(Vec::new()),
            Access::Controller(id) => id,
        };
        let toggle = match EffectCommand::from(code) {
            EffectCommand::Enable => Some(true),
            EffectCommand::Disable => Some(false),
            _ => None,
        };
        if toggle == Some(local.enabled) {
            return Ok(status_word(status::OK));
        }
        let reply = self.shared.channel.send_command(attachment, code, payload)?;
        if let Some(enabled) = toggle {
            if reply_status(&reply) == Some(status::OK) {
                local.enabled = enabled;
            }
        }
        Ok(reply)
    }

    /// Release the attachment. The handle cannot be initialized again.
    ///
    /// A callback already running for this handle is waited for, and none
    /// starts once this returns. Called from the handle's own callback, the
    /// current delivery simply runs to completion. A callback must not block
    /// on a thread that is detaching its handle.
    pub fn detach(&self) {
        let attachment = {
            let _delivering = self.shared.delivery.lock();
            let mut local = self.shared.local.lock();
            let attachment = match local.phase {
                Phase::Detached { .. } => return,
                Phase::Controlling | Phase::NonControlling => local.attachment.take(),
                _ => None,
            };
            local.phase = Phase::Detached { dead: false };
            local.batch.clear();
            attachment
        };
        if let Some(attachment) = attachment {
            self.shared.channel.detach(attachment);
            debug!(%attachment, "detached from effect engine");
        }
    }
}

impl Drop for EffectHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for EffectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.shared.local.lock();
        f.debug_struct("EffectHandle")
            .field("phase", &local.phase)
            .field("identity", &local.identity)
            .field("attachment", &local.attachment)
            .field("priority", &local.priority)
            .field("enabled", &local.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::callback::callback_fn;
    use crate::channel::Attachment;
    use crate::ids::{EffectUuid, SessionId};

    type AttachHook = Box<dyn FnOnce(&Weak<dyn EventSink>) + Send>;

    /// Channel double that records requests and lets the test push events.
    struct ScriptedChannel {
        calls: Mutex<Vec<String>>,
        sink: Mutex<Option<Weak<dyn EventSink>>>,
        controlling: bool,
        attach_error: Mutex<Option<EffectError>>,
        /// Runs inside `create_or_attach`, before the reply is returned.
        during_attach: Mutex<Option<AttachHook>>,
        /// Hand out an attachment id even to probe requests.
        attach_probes: Mutex<bool>,
        set_error: Mutex<Option<EffectError>>,
        batches: Mutex<Vec<Vec<(ParamId, ParamValue)>>>,
    }

    impl ScriptedChannel {
        fn new(controlling: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                sink: Mutex::new(None),
                controlling,
                attach_error: Mutex::new(None),
                during_attach: Mutex::new(None),
                attach_probes: Mutex::new(false),
                set_error: Mutex::new(None),
                batches: Mutex::new(Vec::new()),
            })
        }

        fn identity() -> EngineIdentity {
            EngineIdentity {
                effect_type: EffectUuid(7),
                implementation: EffectUuid(8),
                instance: InstanceId(4242),
                session: SessionId::OUTPUT_MIX,
            }
        }

        fn emit(&self, event: EngineEvent) {
            let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
            if let Some(sink) = sink {
                sink.deliver(&Self::identity(), &event);
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl EngineChannel for ScriptedChannel {
        fn create_or_attach(
            &self,
            request: &EffectRequest,
            sink: Weak<dyn EventSink>,
        ) -> EffectResult<Attachment> {
            self.calls.lock().push("attach".into());
            if let Some(err) = self.attach_error.lock().take() {
                return Err(err);
            }
            let id = if request.probe && !*self.attach_probes.lock() {
                None
            } else {
                *self.sink.lock() = Some(sink.clone());
                Some(AttachmentId::next())
            };
            let hook = self.during_attach.lock().take();
            if let Some(hook) = hook {
                hook(&sink);
            }
            Ok(Attachment {
                identity: Self::identity(),
                id,
                controlling: self.controlling,
                enabled: false,
            })
        }

        fn detach(&self, _attachment: AttachmentId) {
            self.calls.lock().push("detach".into());
        }

        fn send_command(
            &self,
            _attachment: AttachmentId,
            code: u32,
            _payload: &[u8],
        ) -> EffectResult<Vec<u8>> {
            self.calls.lock().push(format!("command:{code}"));
            Ok(status_word(status::OK))
        }

        fn set_parameters(
            &self,
            _attachment: AttachmentId,
            batch: &[(ParamId, ParamValue)],
        ) -> EffectResult<()> {
            self.calls.lock().push("set_parameters".into());
            if let Some(err) = self.set_error.lock().take() {
                return Err(err);
            }
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }

        fn get_parameter(
            &self,
            _attachment: AttachmentId,
            id: ParamId,
        ) -> EffectResult<ParamValue> {
            self.calls.lock().push("get_parameter".into());
            Ok(ParamValue::from_i32(id.0 as i32 * 10))
        }

        fn set_enabled(&self, _attachment: AttachmentId, enabled: bool) -> EffectResult<()> {
            self.calls.lock().push(format!("set_enabled:{enabled}"));
            Ok(())
        }
    }

    fn request() -> EffectRequest {
        EffectRequest::for_type(EffectUuid(7))
    }

    fn handle(channel: &Arc<ScriptedChannel>) -> EffectHandle {
        EffectHandle::new(channel.clone(), EffectConfig::default())
    }

    fn recording_handle(
        channel: &Arc<ScriptedChannel>,
    ) -> (EffectHandle, Arc<Mutex<Vec<EngineEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handle = EffectHandle::with_callback(
            channel.clone(),
            EffectConfig::default(),
            callback_fn(move |event| sink.lock().push(event.clone())),
        );
        (handle, events)
    }

    #[test]
    fn operations_before_init_report_not_initialized() {
        let channel = ScriptedChannel::new(true);
        let handle = handle(&channel);
        assert_eq!(handle.state(), HandleState::Uninitialized);
        assert_eq!(handle.get_parameter(ParamId(1)), Err(EffectError::NotInitialized));
        assert_eq!(handle.set_enabled(true), Err(EffectError::NotInitialized));
        assert_eq!(handle.commit_parameters(), Err(EffectError::NotInitialized));
        assert_eq!(handle.init_check(), Err(EffectError::NotInitialized));
        assert!(channel.calls().is_empty());
    }

    #[test]
    fn missing_identifiers_are_rejected_locally() {
        let channel = ScriptedChannel::new(true);
        let handle = handle(&channel);
        assert!(matches!(
            handle.init(&EffectRequest::default()),
            Err(EffectError::InvalidArgument(_))
        ));
        assert_eq!(handle.state(), HandleState::Uninitialized);
        assert!(channel.calls().is_empty());
    }

    #[test]
    fn failed_attach_returns_to_uninitialized() {
        let channel = ScriptedChannel::new(true);
        *channel.attach_error.lock() = Some(EffectError::unavailable("no library"));
        let handle = handle(&channel);
        assert!(matches!(handle.init(&request()), Err(EffectError::ResourceUnavailable(_))));
        assert_eq!(handle.state(), HandleState::Uninitialized);

        handle.init(&request()).unwrap();
        assert_eq!(handle.state(), HandleState::Controlling);
        assert!(matches!(handle.init(&request()), Err(EffectError::InvalidOperation(_))));
    }

    #[test]
    fn non_controller_mutations_never_reach_the_engine() {
        let channel = ScriptedChannel::new(false);
        let handle = handle(&channel);
        handle.init(&request()).unwrap();
        assert_eq!(handle.state(), HandleState::NonControlling);

        assert!(matches!(handle.set_enabled(true), Err(EffectError::InvalidOperation(_))));
        assert!(matches!(
            handle.set_parameter(ParamId(1), 5),
            Err(EffectError::InvalidOperation(_))
        ));
        assert!(matches!(handle.command(3, &[]), Err(EffectError::InvalidOperation(_))));
        assert_eq!(
            handle.set_parameter_deferred(ParamId(1), 5),
            Err(EffectError::NotController)
        );
        assert_eq!(channel.calls(), vec!["attach"]);

        assert_eq!(handle.get_parameter(ParamId(3)).unwrap().as_i32(), Some(30));
    }

    #[test]
    fn control_events_move_between_states() {
        let channel = ScriptedChannel::new(false);
        let (handle, events) = recording_handle(&channel);
        handle.init(&request()).unwrap();

        channel.emit(EngineEvent::ControlStatusChanged { granted: true });
        assert!(handle.has_control());
        handle.set_enabled(true).unwrap();
        assert!(handle.enabled());

        channel.emit(EngineEvent::ControlStatusChanged { granted: false });
        assert_eq!(handle.state(), HandleState::NonControlling);
        assert_eq!(
            *events.lock(),
            vec![
                EngineEvent::ControlStatusChanged { granted: true },
                EngineEvent::ControlStatusChanged { granted: false },
            ]
        );
    }

    fn deliver_on_attach(channel: &ScriptedChannel, event: EngineEvent) {
        *channel.during_attach.lock() = Some(Box::new(move |sink: &Weak<dyn EventSink>| {
            if let Some(sink) = sink.upgrade() {
                sink.deliver(&ScriptedChannel::identity(), &event);
            }
        }));
    }

    #[test]
    fn control_change_during_attach_overrides_the_reply() {
        let revoked = ScriptedChannel::new(true);
        let (outranked, events) = recording_handle(&revoked);
        let revoke = EngineEvent::ControlStatusChanged { granted: false };
        deliver_on_attach(&revoked, revoke);
        outranked.init(&request()).unwrap();
        assert_eq!(outranked.state(), HandleState::NonControlling);
        assert!(matches!(
            outranked.set_enabled(true),
            Err(EffectError::InvalidOperation(_))
        ));
        assert_eq!(
            *events.lock(),
            vec![EngineEvent::ControlStatusChanged { granted: false }]
        );
        assert_eq!(revoked.calls(), vec!["attach"]);

        let granted = ScriptedChannel::new(false);
        let promoted = handle(&granted);
        let grant = EngineEvent::ControlStatusChanged { granted: true };
        deliver_on_attach(&granted, grant);
        promoted.init(&request()).unwrap();
        assert_eq!(promoted.state(), HandleState::Controlling);
        promoted.set_enabled(true).unwrap();
        assert_eq!(granted.calls(), vec!["attach", "set_enabled:true"]);
    }

    #[test]
    fn detach_during_attach_releases_the_new_attachment() {
        let channel = ScriptedChannel::new(true);
        let handle = Arc::new(handle(&channel));
        let inner = Arc::clone(&handle);
        *channel.during_attach.lock() = Some(Box::new(move |_sink: &Weak<dyn EventSink>| {
            assert_eq!(inner.state(), HandleState::Initializing);
            inner.detach();
        }));

        assert!(matches!(handle.init(&request()), Err(EffectError::InvalidOperation(_))));
        assert_eq!(handle.state(), HandleState::Detached);
        assert_eq!(handle.attachment(), None);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
        drop(handle);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
    }

    #[test]
    fn engine_death_during_attach_is_reported_as_dead_object() {
        let channel = ScriptedChannel::new(true);
        let (handle, events) = recording_handle(&channel);
        deliver_on_attach(&channel, EngineEvent::dead_object());

        assert_eq!(handle.init(&request()), Err(EffectError::DeadObject));
        assert_eq!(handle.state(), HandleState::Detached);
        assert_eq!(*events.lock(), vec![EngineEvent::dead_object()]);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
    }

    #[test]
    fn probe_replies_carrying_an_attachment_are_refused() {
        let channel = ScriptedChannel::new(true);
        *channel.attach_probes.lock() = true;
        let handle = handle(&channel);
        assert!(matches!(
            handle.init(&request().probe()),
            Err(EffectError::ResourceUnavailable(_))
        ));
        assert_eq!(handle.state(), HandleState::Uninitialized);
        assert_eq!(handle.identity(), None);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
    }

    #[test]
    fn detach_waits_for_a_callback_in_flight() {
        let channel = ScriptedChannel::new(true);
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let order = Arc::clone(&order);
            callback_fn(move |_event| {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                order.lock().push("callback");
            })
        };
        let handle = Arc::new(EffectHandle::with_callback(
            channel.clone(),
            EffectConfig::default(),
            callback,
        ));
        handle.init(&request()).unwrap();

        let emitter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.emit(EngineEvent::Error { code: -5 }))
        };
        started_rx.recv().unwrap();
        let detacher = {
            let handle = Arc::clone(&handle);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                handle.detach();
                order.lock().push("detached");
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(order.lock().is_empty());

        release_tx.send(()).unwrap();
        emitter.join().unwrap();
        detacher.join().unwrap();
        assert_eq!(*order.lock(), vec!["callback", "detached"]);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
    }

    #[test]
    fn callbacks_may_detach_their_own_handle() {
        let channel = ScriptedChannel::new(true);
        let slot: Arc<Mutex<Option<Weak<EffectHandle>>>> = Arc::new(Mutex::new(None));
        let callback = {
            let slot = Arc::clone(&slot);
            callback_fn(move |_event| {
                let handle = slot.lock().as_ref().and_then(Weak::upgrade);
                if let Some(handle) = handle {
                    handle.detach();
                }
            })
        };
        let handle = Arc::new(EffectHandle::with_callback(
            channel.clone(),
            EffectConfig::default(),
            callback,
        ));
        *slot.lock() = Some(Arc::downgrade(&handle));
        handle.init(&request()).unwrap();

        channel.emit(EngineEvent::Error { code: -5 });
        assert_eq!(handle.state(), HandleState::Detached);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
    }

    #[test]
    fn commit_sends_one_batch_in_staged_order() {
        let channel = ScriptedChannel::new(true);
        let handle = handle(&channel);
        handle.init(&request()).unwrap();
        assert_eq!(handle.commit_parameters(), Err(EffectError::NothingStaged));

        handle.set_parameter_deferred(ParamId(1), 10).unwrap();
        handle.set_parameter_deferred(ParamId(2), 20).unwrap();
        assert_eq!(handle.staged_len(), 2);
        handle.commit_parameters().unwrap();

        assert_eq!(
            *channel.batches.lock(),
            vec![vec![
                (ParamId(1), ParamValue::from_i32(10)),
                (ParamId(2), ParamValue::from_i32(20)),
            ]]
        );
        assert_eq!(handle.staged_len(), 0);
    }

    #[test]
    fn losing_control_discards_staged_writes() {
        let channel = ScriptedChannel::new(true);
        let handle = handle(&channel);
        handle.init(&request()).unwrap();
        handle.set_parameter_deferred(ParamId(1), 10).unwrap();

        channel.emit(EngineEvent::ControlStatusChanged { granted: false });
        channel.emit(EngineEvent::ControlStatusChanged { granted: true });
        assert!(handle.has_control());

        assert_eq!(handle.commit_parameters(), Err(EffectError::NotController));
        assert_eq!(handle.commit_parameters(), Err(EffectError::NothingStaged));
        assert!(channel.batches.lock().is_empty());
    }

    #[test]
    fn remote_control_refusal_is_reported_as_not_controller() {
        let channel = ScriptedChannel::new(true);
        let handle = handle(&channel);
        handle.init(&request()).unwrap();
        *channel.set_error.lock() = Some(EffectError::invalid_operation("not controller"));
        handle.set_parameter_deferred(ParamId(1), 10).unwrap();
        assert_eq!(handle.commit_parameters(), Err(EffectError::NotController));

        *channel.set_error.lock() = Some(EffectError::invalid_argument("bad value"));
        handle.set_parameter_deferred(ParamId(1), 10).unwrap();
        assert!(matches!(handle.commit_parameters(), Err(EffectError::InvalidArgument(_))));
    }

    #[test]
    fn staging_capacity_comes_from_config() {
        let channel = ScriptedChannel::new(true);
        let config = EffectConfig::default().with_param_buffer_bytes(12);
        let handle = EffectHandle::new(channel.clone(), config);
        handle.init(&request()).unwrap();
        handle.set_parameter_deferred(ParamId(1), 1).unwrap();
        assert!(matches!(
            handle.set_parameter_deferred(ParamId(2), 2),
            Err(EffectError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn enable_commands_short_circuit_when_already_in_state() {
        let channel = ScriptedChannel::new(true);
        let handle = handle(&channel);
        handle.init(&request()).unwrap();

        assert_eq!(handle.command(EffectCommand::Disable.code(), &[]).unwrap(), status_word(0));
        handle.command(EffectCommand::Enable.code(), &[]).unwrap();
        assert!(handle.enabled());
        handle.set_enabled(true).unwrap();
        assert_eq!(channel.calls(), vec!["attach", "command:3"]);
    }

    #[test]
    fn probe_mode_is_a_local_no_op() {
        let channel = ScriptedChannel::new(false);
        let handle = handle(&channel);
        handle.init(&request().probe()).unwrap();
        assert_eq!(handle.state(), HandleState::Probe);
        handle.init_check().unwrap();

        handle.set_enabled(true).unwrap();
        handle.set_parameter(ParamId(1), 1).unwrap();
        handle.set_parameter_deferred(ParamId(1), 1).unwrap();
        handle.commit_parameters().unwrap();
        assert_eq!(handle.command(3, &[]).unwrap(), Vec::<u8>::new());
        assert_eq!(handle.get_parameter(ParamId(1)).unwrap(), ParamValue::default());
        handle.detach();
        assert_eq!(channel.calls(), vec!["attach"]);
    }

    #[test]
    fn dead_engine_rejects_everything_after_notification() {
        let channel = ScriptedChannel::new(true);
        let (handle, events) = recording_handle(&channel);
        handle.init(&request()).unwrap();
        handle.set_parameter_deferred(ParamId(1), 1).unwrap();

        channel.emit(EngineEvent::dead_object());
        channel.emit(EngineEvent::EnableStatusChanged { enabled: true });

        assert_eq!(handle.state(), HandleState::Detached);
        assert_eq!(handle.set_enabled(true), Err(EffectError::DeadObject));
        assert_eq!(handle.get_parameter(ParamId(1)), Err(EffectError::DeadObject));
        assert_eq!(handle.commit_parameters(), Err(EffectError::DeadObject));
        assert_eq!(handle.command(0, &[]), Err(EffectError::DeadObject));
        assert_eq!(handle.init(&request()), Err(EffectError::DeadObject));
        assert_eq!(*events.lock(), vec![EngineEvent::dead_object()]);
    }

    #[test]
    fn detach_stops_callbacks_and_is_idempotent() {
        let channel = ScriptedChannel::new(true);
        let (handle, events) = recording_handle(&channel);
        handle.init(&request()).unwrap();
        handle.detach();
        handle.detach();

        channel.emit(EngineEvent::ControlStatusChanged { granted: false });
        assert!(events.lock().is_empty());
        assert!(matches!(handle.set_enabled(true), Err(EffectError::InvalidOperation(_))));
        assert!(matches!(handle.init(&request()), Err(EffectError::InvalidOperation(_))));
        drop(handle);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
    }

    #[test]
    fn dropping_an_attached_handle_detaches_it() {
        let channel = ScriptedChannel::new(true);
        let handle = handle(&channel);
        handle.init(&request()).unwrap();
        let attachment = handle.attachment();
        assert!(attachment.is_some());
        drop(handle);
        assert_eq!(channel.calls(), vec!["attach", "detach"]);
    }
}
