// Notification port - where "this post became visible" events go.

use super::moderation_models::NotificationEvent;
use async_trait::async_trait;

/// Delivers notification events to users.
///
/// Fire-and-forget: the engine does not wait for delivery and does not
/// care if it fails. Implementations log their own failures.
#[async_trait]
pub trait PostNotifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}
