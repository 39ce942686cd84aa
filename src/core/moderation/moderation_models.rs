// Moderation domain models - posts, topics and the per-user moderation detail.
//
// These are pure domain types with no storage dependencies.
// The infra layer maps them to rows or in-memory tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Moderation state of a post, a topic or a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationState {
    /// Not looked at by a moderator yet
    Pending,
    /// Accepted by a moderator
    Approved,
    /// Rejected by a moderator
    Blocked,
}

impl ModerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationState::Pending => "pending",
            ModerationState::Approved => "approved",
            ModerationState::Blocked => "blocked",
        }
    }

    /// Whether content in this state can be seen by everyone.
    ///
    /// When `content_visible_while_pending` is set nothing is ever hidden.
    pub fn is_visible(&self, content_visible_while_pending: bool) -> bool {
        content_visible_while_pending || *self == ModerationState::Approved
    }
}

impl std::fmt::Display for ModerationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a string is not one of the three moderation states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown moderation state: {0}")]
pub struct UnknownModerationState(pub String);

impl FromStr for ModerationState {
    type Err = UnknownModerationState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ModerationState::Pending),
            "approved" => Ok(ModerationState::Approved),
            "blocked" => Ok(ModerationState::Blocked),
            _ => Err(UnknownModerationState(s.to_string())),
        }
    }
}

/// A single post in a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    /// Author of the post
    pub user_id: u64,
    pub topic_id: u64,
    pub content: String,
    pub moderation_state: ModerationState,
    pub created_at: DateTime<Utc>,
    /// Last content edit. Moderation never touches this.
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Create a new pending post.
    pub fn new(id: u64, user_id: u64, topic_id: u64, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            topic_id,
            content: content.into(),
            moderation_state: ModerationState::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A topic; its moderation state mirrors the state of its first post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: u64,
    /// Author of the topic (and of its first post)
    pub user_id: u64,
    pub first_post_id: u64,
    pub moderation_state: ModerationState,
}

/// Per-user moderation detail.
///
/// Users without a stored detail are considered pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserModerationDetail {
    pub user_id: u64,
    pub moderation_state: ModerationState,
    pub moderation_state_changed_at: Option<DateTime<Utc>>,
}

impl UserModerationDetail {
    pub fn pending(user_id: u64) -> Self {
        Self {
            user_id,
            moderation_state: ModerationState::Pending,
            moderation_state_changed_at: None,
        }
    }
}

/// "Tell `recipient_id` that `post_id` became visible."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub recipient_id: u64,
    pub post_id: u64,
    pub topic_id: u64,
}

/// Audit trail entry written for every moderation action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostModerationRecord {
    pub post_id: u64,
    pub topic_id: u64,
    pub post_user_id: u64,
    /// Content of the post at the time it was moderated
    pub post_content: String,
    pub moderator_id: u64,
    pub previous_state: ModerationState,
    pub moderation_state: ModerationState,
    pub created_at: DateTime<Utc>,
}

/// Every write produced by one moderation action.
///
/// Stores must apply a change set atomically: either all of it is visible
/// to readers or none of it is. Post changes carry only the new state so
/// that nothing else on the post (notably `updated_at`) can be rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationChangeSet {
    /// (post id, new state), the moderated post first
    pub post_states: Vec<(u64, ModerationState)>,
    /// (topic id, new state) when the first post was moderated
    pub topic_state: Option<(u64, ModerationState)>,
    /// (topic id, author id) whose posts must all end up blocked.
    ///
    /// Stores apply this as a sweep inside the commit, so posts the author
    /// wrote after `post_states` was planned are blocked too.
    pub block_author_posts: Option<(u64, u64)>,
    pub user_detail: Option<UserModerationDetail>,
    pub record: PostModerationRecord,
}

/// What a moderation action did, returned to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationOutcome {
    pub record: PostModerationRecord,
    pub topic_updated: bool,
    /// Other posts by the same author that were blocked along with the first post
    pub cascaded_post_ids: Vec<u64>,
    pub user_approved: bool,
    pub notifications: Vec<NotificationEvent>,
}

/// Configuration for the moderation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// When true, pending and blocked content is visible to everyone,
    /// so approving it never makes anything newly visible.
    pub content_visible_while_pending: bool,
    /// How many times a conflicting commit is attempted before giving up
    pub max_commit_attempts: u32,
    /// Pause between commit attempts (milliseconds)
    pub commit_retry_backoff_ms: u64,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            content_visible_while_pending: true,
            max_commit_attempts: 3,
            commit_retry_backoff_ms: 10,
        }
    }
}

impl ModerationConfig {
    /// Build the config from environment variables (a `.env` file is loaded if present).
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let content_visible_while_pending = lookup("CONTENT_VISIBLE_WHILE_PENDING")
            .and_then(|v| parse_bool(&v))
            .unwrap_or(defaults.content_visible_while_pending);
        let max_commit_attempts = lookup("MODERATION_MAX_COMMIT_ATTEMPTS")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|attempts| *attempts > 0)
            .unwrap_or(defaults.max_commit_attempts);
        let commit_retry_backoff_ms = lookup("MODERATION_COMMIT_RETRY_BACKOFF_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(defaults.commit_retry_backoff_ms);

        Self {
            content_visible_while_pending,
            max_commit_attempts,
            commit_retry_backoff_ms,
        }
    }

    /// Load the config from a JSON file. Fields missing from the file keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: ModerationConfig = serde_json::from_reader(file)?;
        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_moderation_state() {
        assert_eq!(
            "approved".parse::<ModerationState>().unwrap(),
            ModerationState::Approved
        );
        assert_eq!(
            " Blocked ".parse::<ModerationState>().unwrap(),
            ModerationState::Blocked
        );
        assert!("deleted".parse::<ModerationState>().is_err());
    }

    #[test]
    fn test_visibility_policy() {
        assert!(ModerationState::Pending.is_visible(true));
        assert!(ModerationState::Blocked.is_visible(true));
        assert!(!ModerationState::Pending.is_visible(false));
        assert!(!ModerationState::Blocked.is_visible(false));
        assert!(ModerationState::Approved.is_visible(false));
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CONTENT_VISIBLE_WHILE_PENDING", "false"),
            ("MODERATION_MAX_COMMIT_ATTEMPTS", "5"),
            ("MODERATION_COMMIT_RETRY_BACKOFF_MS", "not a number"),
        ]
        .into_iter()
        .collect();

        let config = ModerationConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert!(!config.content_visible_while_pending);
        assert_eq!(config.max_commit_attempts, 5);
        assert_eq!(config.commit_retry_backoff_ms, 10);
    }

    #[test]
    fn test_zero_commit_attempts_falls_back_to_default() {
        let config = ModerationConfig::from_lookup(|key| {
            (key == "MODERATION_MAX_COMMIT_ATTEMPTS").then(|| "0".to_string())
        });
        assert_eq!(config.max_commit_attempts, 3);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "content_visible_while_pending": false }}"#).unwrap();

        let config = ModerationConfig::from_file(file.path()).unwrap();

        assert!(!config.content_visible_while_pending);
        assert_eq!(config.max_commit_attempts, 3);
    }
}
