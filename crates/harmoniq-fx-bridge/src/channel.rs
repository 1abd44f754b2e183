use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use harmoniq_fx_client::{
    Attachment, AttachmentId, EffectError, EffectRequest, EffectResult, EngineChannel, EventSink,
    InstanceId, NotificationHub, ParamId, ParamValue,
};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::config::BridgeConfig;
use crate::ipc::{request_channel, BridgeRequest, InstanceSnapshot, Reply};
use crate::registry::EffectRegistry;
use crate::server::BridgeServer;

/// In-process [`EngineChannel`] backed by a [`BridgeServer`] thread.
///
/// Every call is a request/reply round trip; a server that is gone makes
/// every call fail with [`EffectError::DeadObject`].
#[derive(Debug)]
pub struct LoopbackChannel {
    requests: Sender<BridgeRequest>,
    hub: Arc<NotificationHub>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackChannel {
    pub fn start(config: BridgeConfig, registry: EffectRegistry) -> EffectResult<Arc<Self>> {
        let hub = NotificationHub::start()?;
        let (requests, rx) = request_channel();
        let server = BridgeServer::new(config, registry, Arc::clone(&hub)).run(rx)?;
        Ok(Arc::new(Self {
            requests,
            hub,
            server: Mutex::new(Some(server)),
        }))
    }

    /// Default limits and the stock effect registry.
    pub fn with_defaults() -> EffectResult<Arc<Self>> {
        Self::start(BridgeConfig::default(), EffectRegistry::stock())
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> BridgeRequest) -> EffectResult<T> {
        let (tx, rx) = bounded(1);
        self.requests
            .send(build(tx))
            .map_err(|_| EffectError::DeadObject)?;
        rx.recv().map_err(|_| EffectError::DeadObject)?
    }

    /// Run `frames` through the engine and notify opted-in attachments.
    /// Returns the number of notifications queued.
    pub fn process_frames(&self, instance: InstanceId, frames: u32) -> EffectResult<usize> {
        self.call(|reply| BridgeRequest::ProcessFrames {
            instance,
            frames,
            reply,
        })
    }

    pub fn report_error(&self, instance: InstanceId, code: i32) -> EffectResult<usize> {
        self.call(|reply| BridgeRequest::ReportError {
            instance,
            code,
            reply,
        })
    }

    /// Simulate the remote engine dying.
    pub fn kill_instance(&self, instance: InstanceId) -> EffectResult<bool> {
        self.call(|reply| BridgeRequest::KillInstance { instance, reply })
    }

    pub fn snapshot(&self) -> EffectResult<Vec<InstanceSnapshot>> {
        self.call(|reply| BridgeRequest::Snapshot { reply })
    }

    /// Wait for every notification caused by requests issued so far.
    pub fn sync(&self) {
        let _ = self.snapshot();
        self.hub.flush();
    }

    /// Stop the server. Every live instance dies and later calls fail with
    /// `DeadObject`.
    pub fn sever(&self) {
        let _ = self.requests.send(BridgeRequest::Shutdown);
        let server = self.server.lock().take();
        if let Some(server) = server {
            if server.join().is_err() {
                error!("bridge server thread panicked");
            }
        }
    }
}

impl EngineChannel for LoopbackChannel {
    fn create_or_attach(
        &self,
        request: &EffectRequest,
        sink: Weak<dyn EventSink>,
    ) -> EffectResult<Attachment> {
        let request = request.clone();
        self.call(|reply| BridgeRequest::Attach {
            request,
            sink,
            reply,
        })
    }

    fn detach(&self, attachment: AttachmentId) {
        if let Err(err) = self.call(|reply| BridgeRequest::Detach { attachment, reply }) {
            debug!(%attachment, error = %err, "detach after bridge shutdown");
        }
    }

    fn send_command(
        &self,
        attachment: AttachmentId,
        code: u32,
        payload: &[u8],
    ) -> EffectResult<Vec<u8>> {
        let payload = payload.to_vec();
        self.call(|reply| BridgeRequest::Command {
            attachment,
            code,
            payload,
            reply,
        })
    }

    fn set_parameters(
        &self,
        attachment: AttachmentId,
        batch: &[(ParamId, ParamValue)],
    ) -> EffectResult<()> {
        let batch = batch.to_vec();
        self.call(|reply| BridgeRequest::SetParameters {
            attachment,
            batch,
            reply,
        })
    }

    fn get_parameter(&self, attachment: AttachmentId, id: ParamId) -> EffectResult<ParamValue> {
        self.call(|reply| BridgeRequest::GetParameter {
            attachment,
            id,
            reply,
        })
    }

    fn set_enabled(&self, attachment: AttachmentId, enabled: bool) -> EffectResult<()> {
        self.call(|reply| BridgeRequest::SetEnabled {
            attachment,
            enabled,
            reply,
        })
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.sever();
    }
}
