// Queue-backed notifier.
//
// The engine pushes events onto an unbounded tokio channel and moves on.
// Whoever holds the receiver (mailer, push service, in-app inbox) does the
// actual delivery at its own pace.

use crate::core::moderation::{NotificationEvent, PostNotifier};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub struct QueueNotifier {
    sender: mpsc::UnboundedSender<NotificationEvent>,
}

impl QueueNotifier {
    /// Create a notifier together with the receiving end of its queue.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl PostNotifier for QueueNotifier {
    async fn notify(&self, event: NotificationEvent) {
        // Delivery problems are the consumer's business; a closed queue just drops the event.
        if self.sender.send(event).is_err() {
            tracing::warn!(
                recipient_id = event.recipient_id,
                post_id = event.post_id,
                "Notification queue closed, dropping event"
            );
        }
    }
}
