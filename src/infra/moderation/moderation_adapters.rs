// Implementations for the moderation ports.

pub mod in_memory;
pub mod queue_notifier;
pub mod sqlite_store;

// Re-export for convenience
pub use in_memory::InMemoryModerationStore;
pub use queue_notifier::QueueNotifier;
pub use sqlite_store::SqliteModerationStore;
