// Storage port for the moderation engine.
//
// The engine never talks to a database directly; infra implements this trait.

use super::moderation_models::{
    ModerationChangeSet, Post, PostModerationRecord, Topic, UserModerationDetail,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// A concurrent writer got in the way; the write may succeed if retried.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

/// Trait for reading and writing forum records.
#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn get_post(&self, post_id: u64) -> Result<Option<Post>, StoreError>;

    async fn get_topic(&self, topic_id: u64) -> Result<Option<Topic>, StoreError>;

    /// Get the stored moderation detail for a user, if any.
    async fn get_user_detail(
        &self,
        user_id: u64,
    ) -> Result<Option<UserModerationDetail>, StoreError>;

    /// Insert or replace a post.
    async fn update_post(&self, post: Post) -> Result<(), StoreError>;

    /// Insert or replace a topic.
    async fn update_topic(&self, topic: Topic) -> Result<(), StoreError>;

    /// Insert or replace a user's moderation detail.
    async fn update_user_detail(&self, detail: UserModerationDetail) -> Result<(), StoreError>;

    /// All posts in `topic_id` written by `user_id`, ordered by id.
    async fn list_posts_by_author_in_topic(
        &self,
        user_id: u64,
        topic_id: u64,
    ) -> Result<Vec<Post>, StoreError>;

    /// Ids of the users following a topic.
    async fn list_topic_followers(&self, topic_id: u64) -> Result<Vec<u64>, StoreError>;

    /// Apply every write of a moderation action as one atomic unit.
    ///
    /// Returns `StoreError::Conflict` when the unit could not be applied
    /// because of a concurrent writer; in that case nothing was applied.
    async fn commit_moderation(&self, changes: &ModerationChangeSet) -> Result<(), StoreError>;

    /// Audit records for a post, oldest first.
    async fn list_moderation_records(
        &self,
        post_id: u64,
    ) -> Result<Vec<PostModerationRecord>, StoreError>;
}
