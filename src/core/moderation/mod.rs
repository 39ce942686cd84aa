// Core moderation module - moderation state propagation for forum posts.
// Storage and delivery live behind the traits in moderation_store and notifier.

pub mod moderation_models;
pub mod moderation_service;
pub mod moderation_store;
pub mod notifier;

pub use moderation_models::*;
pub use moderation_service::*;
pub use moderation_store::*;
pub use notifier::*;
