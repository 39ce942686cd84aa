// Moderation engine - core business logic for moderating forum posts.
//
// Moderating a post can touch more than the post itself:
// - the topic mirrors the state of its first post
// - blocking a first post blocks the author's other posts in that topic
// - approving a post approves its pending author
// - content that becomes visible notifies interested users
//
// Everything is computed first, committed as one unit, and only then are
// notifications sent. NO storage code here - just pure domain logic.

use super::moderation_models::{
    ModerationChangeSet, ModerationConfig, ModerationOutcome, ModerationState, NotificationEvent,
    Post, PostModerationRecord, Topic, UnknownModerationState, UserModerationDetail,
};
use super::moderation_store::{ModerationStore, StoreError};
use super::notifier::PostNotifier;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("Invalid moderation state: {0}")]
    InvalidState(String),

    #[error("Moderation could not be committed after {attempts} attempts")]
    StoreConflict { attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<UnknownModerationState> for ModerationError {
    fn from(err: UnknownModerationState) -> Self {
        ModerationError::InvalidState(err.0)
    }
}

// ============================================================================
// CORE SERVICE
// ============================================================================

/// Applies moderation decisions to posts and propagates them.
pub struct ModerationEngine<S: ModerationStore, N: PostNotifier> {
    store: S,
    notifier: N,
    config: RwLock<ModerationConfig>,
    // Topic ID -> lock serializing moderation within that topic
    topic_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl<S: ModerationStore, N: PostNotifier> ModerationEngine<S, N> {
    pub fn new(store: S, notifier: N, config: ModerationConfig) -> Self {
        Self {
            store,
            notifier,
            config: RwLock::new(config),
            topic_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Snapshot of the current config.
    pub async fn config(&self) -> ModerationConfig {
        self.config.read().await.clone()
    }

    /// Replace the config. Calls already running keep the config they started with.
    pub async fn set_config(&self, config: ModerationConfig) {
        *self.config.write().await = config;
    }

    pub async fn set_content_visible_while_pending(&self, visible: bool) {
        self.config.write().await.content_visible_while_pending = visible;
    }

    /// Moderate a post, with the target state given as a string
    /// (`"pending"`, `"approved"` or `"blocked"`).
    pub async fn apply_moderation_str(
        &self,
        post_id: u64,
        target_state: &str,
        moderator_id: u64,
    ) -> Result<ModerationOutcome, ModerationError> {
        let target_state: ModerationState = target_state.parse()?;
        self.apply_moderation(post_id, target_state, moderator_id)
            .await
    }

    /// Moderate a post.
    ///
    /// # Arguments
    /// * `post_id` - The post being moderated
    /// * `target_state` - The state to move it to
    /// * `moderator_id` - Who is moderating (authorization is the caller's job)
    ///
    /// # Returns
    /// A `ModerationOutcome` describing every change made and every
    /// notification sent. On error nothing has been changed.
    pub async fn apply_moderation(
        &self,
        post_id: u64,
        target_state: ModerationState,
        moderator_id: u64,
    ) -> Result<ModerationOutcome, ModerationError> {
        let config = self.config().await;

        // A post never moves between topics, so the topic id read before
        // locking is the one we lock on.
        let topic_id = self.load_post(post_id).await?.topic_id;
        let topic_lock = self.topic_lock(topic_id);
        let guard = topic_lock.lock().await;

        let post = self.load_post(post_id).await?;
        let topic = self.load_topic(post.topic_id).await?;
        let previous_state = post.moderation_state;

        let changes = self
            .plan_changes(&post, &topic, target_state, moderator_id)
            .await?;

        // Resolve recipients before committing so a failed lookup leaves nothing applied.
        let became_visible = target_state == ModerationState::Approved
            && !previous_state.is_visible(config.content_visible_while_pending);
        let notifications = if became_visible {
            self.notification_events(&post, &topic).await?
        } else {
            Vec::new()
        };

        self.commit_with_retry(&changes, &config).await?;
        drop(guard);

        tracing::info!(
            post_id,
            topic_id = topic.id,
            moderator_id,
            previous_state = %previous_state,
            moderation_state = %target_state,
            "Post moderated"
        );

        for event in &notifications {
            self.notifier.notify(*event).await;
        }

        if !notifications.is_empty() {
            tracing::debug!(
                post_id,
                recipients = notifications.len(),
                "Dispatched visibility notifications"
            );
        }

        let ModerationChangeSet {
            post_states,
            topic_state,
            user_detail,
            record,
            ..
        } = changes;

        Ok(ModerationOutcome {
            record,
            topic_updated: topic_state.is_some(),
            cascaded_post_ids: post_states.iter().skip(1).map(|(id, _)| *id).collect(),
            user_approved: user_detail.is_some(),
            notifications,
        })
    }

    /// Audit records for a post, oldest first.
    pub async fn moderation_history(
        &self,
        post_id: u64,
    ) -> Result<Vec<PostModerationRecord>, ModerationError> {
        Ok(self.store.list_moderation_records(post_id).await?)
    }

    /// Work out every write a moderation action needs, without writing anything.
    async fn plan_changes(
        &self,
        post: &Post,
        topic: &Topic,
        target_state: ModerationState,
        moderator_id: u64,
    ) -> Result<ModerationChangeSet, ModerationError> {
        let now = Utc::now();
        let mut post_states = vec![(post.id, target_state)];
        let mut topic_state = None;
        let mut block_author_posts = None;

        if topic.first_post_id == post.id {
            topic_state = Some((topic.id, target_state));

            if target_state == ModerationState::Blocked {
                block_author_posts = Some((topic.id, post.user_id));
                let siblings = self
                    .store
                    .list_posts_by_author_in_topic(post.user_id, topic.id)
                    .await?;
                post_states.extend(
                    siblings
                        .into_iter()
                        .filter(|p| p.id != post.id && p.moderation_state != ModerationState::Blocked)
                        .map(|p| (p.id, ModerationState::Blocked)),
                );

                if post_states.len() > 1 {
                    tracing::debug!(
                        post_id = post.id,
                        topic_id = topic.id,
                        cascaded = post_states.len() - 1,
                        "Blocking the author's other posts in the topic"
                    );
                }
            }
        }

        // Approval only ever promotes a pending user.
        let mut user_detail = None;
        if target_state == ModerationState::Approved {
            let detail = self
                .store
                .get_user_detail(post.user_id)
                .await?
                .unwrap_or_else(|| UserModerationDetail::pending(post.user_id));

            if detail.moderation_state == ModerationState::Pending {
                user_detail = Some(UserModerationDetail {
                    user_id: post.user_id,
                    moderation_state: ModerationState::Approved,
                    moderation_state_changed_at: Some(now),
                });
            }
        }

        let record = PostModerationRecord {
            post_id: post.id,
            topic_id: topic.id,
            post_user_id: post.user_id,
            post_content: post.content.clone(),
            moderator_id,
            previous_state: post.moderation_state,
            moderation_state: target_state,
            created_at: now,
        };

        Ok(ModerationChangeSet {
            post_states,
            topic_state,
            block_author_posts,
            user_detail,
            record,
        })
    }

    /// Commit a change set, retrying on write conflicts.
    async fn commit_with_retry(
        &self,
        changes: &ModerationChangeSet,
        config: &ModerationConfig,
    ) -> Result<(), ModerationError> {
        let max_attempts = config.max_commit_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.store.commit_moderation(changes).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(reason)) if attempt < max_attempts => {
                    tracing::warn!(
                        post_id = changes.record.post_id,
                        attempt,
                        "Moderation commit conflicted, retrying: {}",
                        reason
                    );
                    tokio::time::sleep(Duration::from_millis(config.commit_retry_backoff_ms))
                        .await;
                    attempt += 1;
                }
                Err(StoreError::Conflict(reason)) => {
                    tracing::error!(
                        post_id = changes.record.post_id,
                        attempts = attempt,
                        "Giving up on moderation commit: {}",
                        reason
                    );
                    return Err(ModerationError::StoreConflict { attempts: attempt });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Who should hear that `post` just became visible.
    async fn notification_events(
        &self,
        post: &Post,
        topic: &Topic,
    ) -> Result<Vec<NotificationEvent>, ModerationError> {
        let mut recipients = BTreeSet::new();

        if topic.first_post_id == post.id {
            for follower in self.store.list_topic_followers(topic.id).await? {
                if follower != post.user_id {
                    recipients.insert(follower);
                }
            }
        } else if topic.user_id != post.user_id {
            recipients.insert(topic.user_id);
        }

        Ok(recipients
            .into_iter()
            .map(|recipient_id| NotificationEvent {
                recipient_id,
                post_id: post.id,
                topic_id: topic.id,
            })
            .collect())
    }

    fn topic_lock(&self, topic_id: u64) -> Arc<Mutex<()>> {
        self.topic_locks
            .entry(topic_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    async fn load_post(&self, post_id: u64) -> Result<Post, ModerationError> {
        self.store
            .get_post(post_id)
            .await?
            .ok_or(ModerationError::NotFound {
                entity: "post",
                id: post_id,
            })
    }

    async fn load_topic(&self, topic_id: u64) -> Result<Topic, ModerationError> {
        self.store
            .get_topic(topic_id)
            .await?
            .ok_or(ModerationError::NotFound {
                entity: "topic",
                id: topic_id,
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================
