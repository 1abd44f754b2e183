use std::sync::Arc;

use crate::event::EngineEvent;

/// Receiver of engine notifications for one effect handle.
///
/// Handles only ever call [`EffectCallback::on_event`]. Its default
/// implementation fans out to the per-kind methods, so implementors may
/// override either the single entry point or the individual hooks.
pub trait EffectCallback: Send + Sync {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ControlStatusChanged { granted } => {
                self.on_control_status_changed(*granted)
            }
            EngineEvent::EnableStatusChanged { enabled } => {
                self.on_enable_status_changed(*enabled)
            }
            EngineEvent::ParameterChanged { payload } => self.on_parameter_changed(payload),
            EngineEvent::Error { code } => self.on_error(*code),
            EngineEvent::FramesProcessed { frames } => self.on_frames_processed(*frames),
        }
    }

    fn on_control_status_changed(&self, _granted: bool) {}
    fn on_enable_status_changed(&self, _enabled: bool) {}
    fn on_parameter_changed(&self, _payload: &[u8]) {}
    fn on_error(&self, _code: i32) {}
    fn on_frames_processed(&self, _frames: u32) {}
}

struct FnCallback<F>(F);

impl<F> EffectCallback for FnCallback<F>
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        (self.0)(event)
    }
}

/// Adapt a closure to the callback interface.
pub fn callback_fn<F>(f: F) -> Arc<dyn EffectCallback>
where
    F: Fn(&EngineEvent) + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}
