use tokio::sync::mpsc;

use taskline_types::StreamEvent;

/// Producer side of one task's event stream.
///
/// Bounded, so a slow client applies backpressure to the dispatcher instead
/// of buffering without limit.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false once the consumer is gone.
    pub async fn publish(&self, event: StreamEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
