#![allow(dead_code)]

use std::sync::{Arc, Weak};

use harmoniq_fx_bridge::{LoopbackChannel, EQUALIZER};
use harmoniq_fx_client::{
    callback_fn, Attachment, AttachmentId, EffectConfig, EffectHandle, EffectRequest, EffectResult,
    EngineChannel, EngineEvent, EventSink, ParamId, ParamValue,
};
use parking_lot::Mutex;

pub type EventLog = Arc<Mutex<Vec<EngineEvent>>>;

/// A handle whose callback appends every event to the returned log.
pub fn recording_handle(channel: &Arc<LoopbackChannel>) -> (EffectHandle, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let handle = EffectHandle::with_callback(
        channel.clone(),
        EffectConfig::default(),
        callback_fn(move |event| sink.lock().push(event.clone())),
    );
    (handle, log)
}

pub fn attach_equalizer(
    channel: &Arc<LoopbackChannel>,
    priority: i32,
) -> anyhow::Result<(EffectHandle, EventLog)> {
    let (handle, log) = recording_handle(channel);
    handle.init(&EffectRequest::for_type(EQUALIZER).with_priority(priority))?;
    Ok((handle, log))
}

pub fn control(granted: bool) -> EngineEvent {
    EngineEvent::ControlStatusChanged { granted }
}

pub fn level(value: i32) -> ParamValue {
    ParamValue::from_i32(value)
}

/// Passes every call through and remembers each parameter batch sent.
pub struct RecordingChannel {
    inner: Arc<LoopbackChannel>,
    batches: Mutex<Vec<Vec<(ParamId, ParamValue)>>>,
}

impl RecordingChannel {
    pub fn new(inner: Arc<LoopbackChannel>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn batches(&self) -> Vec<Vec<(ParamId, ParamValue)>> {
        self.batches.lock().clone()
    }
}

impl EngineChannel for RecordingChannel {
    fn create_or_attach(
        &self,
        request: &EffectRequest,
        sink: Weak<dyn EventSink>,
    ) -> EffectResult<Attachment> {
        self.inner.create_or_attach(request, sink)
    }

    fn detach(&self, attachment: AttachmentId) {
        self.inner.detach(attachment)
    }

    fn send_command(
        &self,
        attachment: AttachmentId,
        code: u32,
        payload: &[u8],
    ) -> EffectResult<Vec<u8>> {
        self.inner.send_command(attachment, code, payload)
    }

    fn set_parameters(
        &self,
        attachment: AttachmentId,
        batch: &[(ParamId, ParamValue)],
    ) -> EffectResult<()> {
        self.batches.lock().push(batch.to_vec());
        self.inner.set_parameters(attachment, batch)
    }

    fn get_parameter(&self, attachment: AttachmentId, id: ParamId) -> EffectResult<ParamValue> {
        self.inner.get_parameter(attachment, id)
    }

    fn set_enabled(&self, attachment: AttachmentId, enabled: bool) -> EffectResult<()> {
        self.inner.set_enabled(attachment, enabled)
    }
}
