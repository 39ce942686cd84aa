// Forum moderation engine.
//
// **Architecture Overview:**
// - `core/` = Business logic (storage-agnostic)
// - `infra/` = Implementations of core traits (databases, queues)
//
// The enclosing application is the composition root: it picks a store and
// a notifier, loads a `ModerationConfig` and builds a `ModerationEngine`.

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with several mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
pub mod core;
#[path = "infra/infra_layer.rs"]
pub mod infra;

pub use crate::core::moderation::{
    ModerationConfig, ModerationEngine, ModerationError, ModerationOutcome, ModerationState,
    ModerationStore, NotificationEvent, PostNotifier, StoreError,
};

/// Install a `tracing` subscriber that prints to stdout.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().try_init();
}
