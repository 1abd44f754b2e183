use std::sync::Weak;

use crossbeam_channel::{Receiver, Sender};
use harmoniq_fx_client::{
    Attachment, AttachmentId, EffectRequest, EffectResult, EngineIdentity, EventSink, InstanceId,
    ParamId, ParamValue, Priority,
};
use serde::{Deserialize, Serialize};

/// One-shot reply slot carried by every request.
pub type Reply<T> = Sender<EffectResult<T>>;

pub enum BridgeRequest {
    Attach {
        request: EffectRequest,
        sink: Weak<dyn EventSink>,
        reply: Reply<Attachment>,
    },
    Detach {
        attachment: AttachmentId,
        reply: Reply<()>,
    },
    Command {
        attachment: AttachmentId,
        code: u32,
        payload: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
    SetParameters {
        attachment: AttachmentId,
        batch: Vec<(ParamId, ParamValue)>,
        reply: Reply<()>,
    },
    GetParameter {
        attachment: AttachmentId,
        id: ParamId,
        reply: Reply<ParamValue>,
    },
    SetEnabled {
        attachment: AttachmentId,
        enabled: bool,
        reply: Reply<()>,
    },
    ProcessFrames {
        instance: InstanceId,
        frames: u32,
        reply: Reply<usize>,
    },
    ReportError {
        instance: InstanceId,
        code: i32,
        reply: Reply<usize>,
    },
    KillInstance {
        instance: InstanceId,
        reply: Reply<bool>,
    },
    Snapshot {
        reply: Reply<Vec<InstanceSnapshot>>,
    },
    Shutdown,
}

impl BridgeRequest {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeRequest::Attach { .. } => "attach",
            BridgeRequest::Detach { .. } => "detach",
            BridgeRequest::Command { .. } => "command",
            BridgeRequest::SetParameters { .. } => "set_parameters",
            BridgeRequest::GetParameter { .. } => "get_parameter",
            BridgeRequest::SetEnabled { .. } => "set_enabled",
            BridgeRequest::ProcessFrames { .. } => "process_frames",
            BridgeRequest::ReportError { .. } => "report_error",
            BridgeRequest::KillInstance { .. } => "kill_instance",
            BridgeRequest::Snapshot { .. } => "snapshot",
            BridgeRequest::Shutdown => "shutdown",
        }
    }
}

/// Point-in-time view of one live engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub identity: EngineIdentity,
    pub controller: Option<AttachmentId>,
    pub attachments: Vec<(AttachmentId, Priority)>,
    pub enabled: bool,
}

pub fn request_channel() -> (Sender<BridgeRequest>, Receiver<BridgeRequest>) {
    crossbeam_channel::unbounded()
}
