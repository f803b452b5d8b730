//! Progress reporting for pipeline runs.

use crate::pipeline::PipelineState;

/// Emitted each time the orchestrator enters a new state.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub state: PipelineState,
    /// 1-based position of `state` in the fixed pipeline order.
    pub step: u64,
    pub total_steps: u64,
    /// Stage name while transforming, error text on failure.
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(state: PipelineState, message: Option<&str>) -> Self {
        Self {
            state,
            step: state.step(),
            total_steps: PipelineState::TOTAL_STEPS,
            message: message.map(str::to_owned),
        }
    }
}

/// Implement this to drive a progress bar or any other status display.
pub trait ProgressHandler: Send {
    fn on_progress(&self, event: ProgressEvent);
}

pub fn emit_progress(handler: Option<&dyn ProgressHandler>, state: PipelineState, message: Option<&str>) {
    if let Some(handler) = handler {
        handler.on_progress(ProgressEvent::new(state, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transforming_events_carry_their_position() {
        let event = ProgressEvent::new(PipelineState::Transforming(4), Some("convert-png"));
        assert_eq!((event.step, event.total_steps), (6, PipelineState::TOTAL_STEPS));
        assert_eq!(event.message.as_deref(), Some("convert-png"));
        assert_eq!(ProgressEvent::new(PipelineState::Failed, None).step, 0);
    }
}
