// Execution Events
// Progress reporting and event types for a pipeline run

use crate::parser::models::KindTag;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started
    PipelineStarted { job_name: String, total_steps: usize },

    /// Run finished, successfully or not
    PipelineCompleted {
        job_name: String,
        success: bool,
        steps_executed: usize,
        duration: Duration,
    },

    /// A recipe or plugin step is about to be dispatched
    StepStarted {
        step_name: String,
        kind: KindTag,
        type_id: String,
    },

    /// A recipe or plugin step returned
    StepCompleted {
        step_name: String,
        outputs: usize,
        duration: Duration,
    },

    /// A loop step was visited
    LoopVisited {
        step_name: String,
        counter: i64,
        loopcount: usize,
        finished: bool,
    },

    /// A sub-pipeline was imported under a prefix
    SubPipelineInlined {
        step_name: String,
        path: String,
        steps: Vec<String>,
    },

    /// A step failed and the run is aborting
    StepFailed { step_name: String, error: String },
}

impl ExecutionEvent {
    pub fn pipeline_started(job_name: impl Into<String>, total_steps: usize) -> Self {
        Self::PipelineStarted {
            job_name: job_name.into(),
            total_steps,
        }
    }

    pub fn pipeline_completed(
        job_name: impl Into<String>,
        success: bool,
        steps_executed: usize,
        duration: Duration,
    ) -> Self {
        Self::PipelineCompleted {
            job_name: job_name.into(),
            success,
            steps_executed,
            duration,
        }
    }

    pub fn step_started(step_name: impl Into<String>, kind: KindTag, type_id: impl Into<String>) -> Self {
        Self::StepStarted {
            step_name: step_name.into(),
            kind,
            type_id: type_id.into(),
        }
    }

    pub fn step_completed(step_name: impl Into<String>, outputs: usize, duration: Duration) -> Self {
        Self::StepCompleted {
            step_name: step_name.into(),
            outputs,
            duration,
        }
    }

    pub fn loop_visited(
        step_name: impl Into<String>,
        counter: i64,
        loopcount: usize,
        finished: bool,
    ) -> Self {
        Self::LoopVisited {
            step_name: step_name.into(),
            counter,
            loopcount,
            finished,
        }
    }

    pub fn sub_pipeline_inlined(
        step_name: impl Into<String>,
        path: impl Into<String>,
        steps: Vec<String>,
    ) -> Self {
        Self::SubPipelineInlined {
            step_name: step_name.into(),
            path: path.into(),
            steps,
        }
    }

    pub fn step_failed(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::StepFailed {
            step_name: step_name.into(),
            error: error.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::pipeline_started("job", 3));
        tx.send_event(ExecutionEvent::step_started("prep", KindTag::Recipe, "prep"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::PipelineStarted { total_steps: 3, .. }));

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ExecutionEvent::StepStarted { kind: KindTag::Recipe, .. }));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = progress_channel();
        drop(rx);
        // Must not panic
        tx.send_event(ExecutionEvent::step_failed("prep", "boom"));

        let none: Option<ProgressSender> = None;
        none.send_event(ExecutionEvent::pipeline_started("job", 0));
    }

    #[test]
    fn test_loop_visited_construction() {
        let event = ExecutionEvent::loop_visited("iterate", -1, 2, true);
        if let ExecutionEvent::LoopVisited {
            step_name,
            counter,
            loopcount,
            finished,
        } = event
        {
            assert_eq!(step_name, "iterate");
            assert_eq!(counter, -1);
            assert_eq!(loopcount, 2);
            assert!(finished);
        } else {
            panic!("wrong event type");
        }
    }
}
