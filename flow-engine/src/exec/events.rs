// Execution events
// Ordered progress notifications emitted by the scheduler; ordering reflects
// actual wall-clock begin/end, not graph order

use tokio::sync::mpsc;

use crate::defs::Marker;

/// Progress events observed by listeners during a run
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Node entered Running
    NodeStarted { name: String },
    /// Node finished executing
    NodeFinished {
        name: String,
        status: i32,
        changed: bool,
    },
    /// Node was up to date; prior outputs loaded, implementation not invoked
    NodeSkipped { name: String },
    /// Node outputs restored from the artifact cache
    NodeRestored { name: String },
    /// A predecessor failed; node will never run
    NodeBlocked { name: String },
    /// Diagnostic marker from a task implementation
    NodeMarker { name: String, marker: Marker },
    /// The whole run finished
    RunFinished { failed: usize },
}

pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Fire-and-forget event emission; a missing or closed listener never
/// affects execution
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
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

    #[test]
    fn test_events_delivered_in_send_order() {
        let (tx, mut rx) = progress_channel();
        let sender = Some(tx);

        sender.send_event(ExecutionEvent::NodeStarted {
            name: "a".to_string(),
        });
        sender.send_event(ExecutionEvent::NodeFinished {
            name: "a".to_string(),
            status: 0,
            changed: true,
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::NodeStarted { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ExecutionEvent::NodeFinished { .. }
        ));
    }

    #[test]
    fn test_missing_listener_is_harmless() {
        let sender: Option<ProgressSender> = None;
        sender.send_event(ExecutionEvent::RunFinished { failed: 0 });
    }

    #[test]
    fn test_closed_listener_is_harmless() {
        let (tx, rx) = progress_channel();
        drop(rx);
        Some(tx).send_event(ExecutionEvent::RunFinished { failed: 0 });
    }
}
