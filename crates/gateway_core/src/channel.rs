use tokio::sync::mpsc;
use tracing::warn;

use crate::event::AgentEvent;

/// Default bounded capacity for an adapter's event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 100;

/// Producer half of an adapter's event channel.
///
/// Single-writer by construction: only the adapter's decoder/actor task ever
/// holds one. Sends never block the decoder — when the channel is full the
/// event is dropped and a warning is logged; consumers needing lossless
/// streams must drain fast.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<AgentEvent>,
    adapter_name: &'static str,
}

impl EventSender {
    /// Sends `event`, dropping it with a `tracing::warn!` if the channel is
    /// currently full rather than waiting for the consumer to drain.
    pub fn send(&self, event: AgentEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    adapter = self.adapter_name,
                    session_id = %event.session_id,
                    "event channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Consumer has gone away (or `Close` already ran); nothing to do.
            }
        }
    }
}

/// Consumer half of an adapter's event channel. Closed when the adapter's
/// `Close` drops the matching [`EventSender`].
pub struct EventReceiver {
    rx: mpsc::Receiver<AgentEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<AgentEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Builds a bounded event channel pair for `adapter_name` at the default capacity.
pub fn event_channel(adapter_name: &'static str) -> (EventSender, EventReceiver) {
    event_channel_with_capacity(adapter_name, DEFAULT_EVENT_CHANNEL_CAPACITY)
}

pub fn event_channel_with_capacity(
    adapter_name: &'static str,
    capacity: usize,
) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx, adapter_name }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AgentEventKind;
    use crate::session::{OperationId, SessionId};

    fn sample_event() -> AgentEvent {
        AgentEvent::new(
            SessionId::from_upstream("s1"),
            OperationId::new(),
            AgentEventKind::MessageChunk { text: "hi".into() },
        )
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let (tx, mut rx) = event_channel_with_capacity("test", 1);
        tx.send(sample_event());
        tx.send(sample_event()); // dropped, does not block
        assert!(rx.recv().await.is_some());
        // Second send was dropped: nothing else pending once channel is closed.
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_does_not_panic() {
        let (tx, rx) = event_channel_with_capacity("test", 1);
        drop(rx);
        tx.send(sample_event());
    }
}
