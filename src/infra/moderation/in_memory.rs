// This is the infra layer - it implements the traits defined in core.
// This file provides an IN-MEMORY implementation of ModerationStore.
//
// Posts, topics, user details and audit records sit in one table set behind
// a single RwLock, so a moderation commit is applied under one write lock
// and readers never see half of it. Topic follows are independent of
// moderation and live in a DashMap.

use crate::core::moderation::{
    ModerationChangeSet, ModerationState, ModerationStore, Post, PostModerationRecord,
    StoreError, Topic, UserModerationDetail,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct ForumTables {
    posts: HashMap<u64, Post>,
    topics: HashMap<u64, Topic>,
    details: HashMap<u64, UserModerationDetail>,
    // Post ID -> audit records, oldest first
    records: HashMap<u64, Vec<PostModerationRecord>>,
}

/// In-memory implementation of ModerationStore.
pub struct InMemoryModerationStore {
    tables: RwLock<ForumTables>,
    // Topic ID -> Set of follower User IDs
    follows: DashMap<u64, DashSet<u64>>,
    // Number of upcoming commits to reject with a conflict
    pending_conflicts: AtomicU32,
}

impl InMemoryModerationStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(ForumTables::default()),
            follows: DashMap::new(),
            pending_conflicts: AtomicU32::new(0),
        }
    }

    pub fn follow_topic(&self, user_id: u64, topic_id: u64) {
        self.follows
            .entry(topic_id)
            .or_insert_with(DashSet::new)
            .insert(user_id);
    }

    pub fn unfollow_topic(&self, user_id: u64, topic_id: u64) {
        if let Some(followers) = self.follows.get(&topic_id) {
            followers.remove(&user_id);
        }
    }

    /// Make the next `count` commits fail with `StoreError::Conflict`,
    /// the way a busy database would.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ModerationStore for InMemoryModerationStore {
    async fn get_post(&self, post_id: u64) -> Result<Option<Post>, StoreError> {
        Ok(self.tables.read().await.posts.get(&post_id).cloned())
    }

    async fn get_topic(&self, topic_id: u64) -> Result<Option<Topic>, StoreError> {
        Ok(self.tables.read().await.topics.get(&topic_id).cloned())
    }

    async fn get_user_detail(
        &self,
        user_id: u64,
    ) -> Result<Option<UserModerationDetail>, StoreError> {
        Ok(self.tables.read().await.details.get(&user_id).cloned())
    }

    async fn update_post(&self, post: Post) -> Result<(), StoreError> {
        self.tables.write().await.posts.insert(post.id, post);
        Ok(())
    }

    async fn update_topic(&self, topic: Topic) -> Result<(), StoreError> {
        self.tables.write().await.topics.insert(topic.id, topic);
        Ok(())
    }

    async fn update_user_detail(&self, detail: UserModerationDetail) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .details
            .insert(detail.user_id, detail);
        Ok(())
    }

    async fn list_posts_by_author_in_topic(
        &self,
        user_id: u64,
        topic_id: u64,
    ) -> Result<Vec<Post>, StoreError> {
        let tables = self.tables.read().await;
        let mut posts: Vec<Post> = tables
            .posts
            .values()
            .filter(|post| post.user_id == user_id && post.topic_id == topic_id)
            .cloned()
            .collect();
        posts.sort_by_key(|post| post.id);
        Ok(posts)
    }

    async fn list_topic_followers(&self, topic_id: u64) -> Result<Vec<u64>, StoreError> {
        let mut followers: Vec<u64> = self
            .follows
            .get(&topic_id)
            .map(|set| set.iter().map(|id| *id).collect())
            .unwrap_or_default();
        followers.sort_unstable();
        Ok(followers)
    }

    async fn commit_moderation(&self, changes: &ModerationChangeSet) -> Result<(), StoreError> {
        if self.take_conflict() {
            return Err(StoreError::Conflict(format!(
                "moderation of post {} raced another writer",
                changes.record.post_id
            )));
        }

        let mut tables = self.tables.write().await;

        // Check everything first so a bad change set leaves no trace.
        for (post_id, _) in &changes.post_states {
            if !tables.posts.contains_key(post_id) {
                return Err(StoreError::InvalidData(format!("post {} does not exist", post_id)));
            }
        }
        if let Some((topic_id, _)) = changes.topic_state {
            if !tables.topics.contains_key(&topic_id) {
                return Err(StoreError::InvalidData(format!(
                    "topic {} does not exist",
                    topic_id
                )));
            }
        }

        for (post_id, state) in &changes.post_states {
            if let Some(post) = tables.posts.get_mut(post_id) {
                post.moderation_state = *state;
            }
        }
        if let Some((topic_id, user_id)) = changes.block_author_posts {
            for post in tables.posts.values_mut() {
                if post.topic_id == topic_id && post.user_id == user_id {
                    post.moderation_state = ModerationState::Blocked;
                }
            }
        }
        if let Some((topic_id, state)) = changes.topic_state {
            if let Some(topic) = tables.topics.get_mut(&topic_id) {
                topic.moderation_state = state;
            }
        }
        if let Some(detail) = &changes.user_detail {
            tables.details.insert(detail.user_id, detail.clone());
        }
        tables
            .records
            .entry(changes.record.post_id)
            .or_default()
            .push(changes.record.clone());

        Ok(())
    }

    async fn list_moderation_records(
        &self,
        post_id: u64,
    ) -> Result<Vec<PostModerationRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .records
            .get(&post_id)
            .cloned()
            .unwrap_or_default())
    }
}

// Default trait implementation for convenient initialization
impl Default for InMemoryModerationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(post_id: u64, state: ModerationState) -> PostModerationRecord {
        PostModerationRecord {
            post_id,
            topic_id: 1,
            post_user_id: 7,
            post_content: "hi".to_string(),
            moderator_id: 99,
            previous_state: ModerationState::Pending,
            moderation_state: state,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_posts_by_author_in_topic() {
        let store = InMemoryModerationStore::new();
        store.update_post(Post::new(3, 7, 1, "c")).await.unwrap();
        store.update_post(Post::new(1, 7, 1, "a")).await.unwrap();
        store.update_post(Post::new(2, 8, 1, "b")).await.unwrap();
        store.update_post(Post::new(4, 7, 2, "d")).await.unwrap();

        let posts = store.list_posts_by_author_in_topic(7, 1).await.unwrap();
        let ids: Vec<u64> = posts.iter().map(|p| p.id).collect();

        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_follow_and_unfollow() {
        let store = InMemoryModerationStore::new();
        store.follow_topic(5, 1);
        store.follow_topic(3, 1);
        store.follow_topic(5, 1);
        store.follow_topic(9, 2);

        assert_eq!(store.list_topic_followers(1).await.unwrap(), vec![3, 5]);

        store.unfollow_topic(5, 1);
        assert_eq!(store.list_topic_followers(1).await.unwrap(), vec![3]);
        assert!(store.list_topic_followers(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_only_touches_moderation_state() {
        let store = InMemoryModerationStore::new();
        let post = Post::new(1, 7, 1, "original");
        let updated_at = post.updated_at;
        store.update_post(post).await.unwrap();

        let changes = ModerationChangeSet {
            post_states: vec![(1, ModerationState::Blocked)],
            topic_state: None,
            block_author_posts: None,
            user_detail: None,
            record: record(1, ModerationState::Blocked),
        };
        store.commit_moderation(&changes).await.unwrap();

        let post = store.get_post(1).await.unwrap().unwrap();
        assert_eq!(post.moderation_state, ModerationState::Blocked);
        assert_eq!(post.updated_at, updated_at);
        assert_eq!(post.content, "original");
        assert_eq!(store.list_moderation_records(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_with_unknown_post_applies_nothing() {
        let store = InMemoryModerationStore::new();
        store.update_post(Post::new(1, 7, 1, "a")).await.unwrap();

        let changes = ModerationChangeSet {
            post_states: vec![(1, ModerationState::Blocked), (2, ModerationState::Blocked)],
            topic_state: None,
            block_author_posts: None,
            user_detail: Some(UserModerationDetail::pending(7)),
            record: record(1, ModerationState::Blocked),
        };
        let result = store.commit_moderation(&changes).await;

        assert!(matches!(result, Err(StoreError::InvalidData(_))));
        let post = store.get_post(1).await.unwrap().unwrap();
        assert_eq!(post.moderation_state, ModerationState::Pending);
        assert!(store.get_user_detail(7).await.unwrap().is_none());
        assert!(store.list_moderation_records(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_blocks_author_posts_not_listed() {
        let store = InMemoryModerationStore::new();
        store.update_post(Post::new(1, 7, 1, "first")).await.unwrap();
        store.update_post(Post::new(2, 7, 1, "written after planning")).await.unwrap();
        store.update_post(Post::new(3, 8, 1, "other author")).await.unwrap();
        store.update_post(Post::new(4, 7, 2, "other topic")).await.unwrap();

        let changes = ModerationChangeSet {
            post_states: vec![(1, ModerationState::Blocked)],
            topic_state: None,
            block_author_posts: Some((1, 7)),
            user_detail: None,
            record: record(1, ModerationState::Blocked),
        };
        store.commit_moderation(&changes).await.unwrap();

        let state = |post: Option<Post>| post.unwrap().moderation_state;
        assert_eq!(state(store.get_post(2).await.unwrap()), ModerationState::Blocked);
        assert_eq!(state(store.get_post(3).await.unwrap()), ModerationState::Pending);
        assert_eq!(state(store.get_post(4).await.unwrap()), ModerationState::Pending);
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let store = InMemoryModerationStore::new();
        store.update_post(Post::new(1, 7, 1, "a")).await.unwrap();
        store.inject_conflicts(1);

        let changes = ModerationChangeSet {
            post_states: vec![(1, ModerationState::Approved)],
            topic_state: None,
            block_author_posts: None,
            user_detail: None,
            record: record(1, ModerationState::Approved),
        };

        assert!(matches!(
            store.commit_moderation(&changes).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            store.get_post(1).await.unwrap().unwrap().moderation_state,
            ModerationState::Pending
        );
        store.commit_moderation(&changes).await.unwrap();
        assert_eq!(
            store.get_post(1).await.unwrap().unwrap().moderation_state,
            ModerationState::Approved
        );
    }
}
