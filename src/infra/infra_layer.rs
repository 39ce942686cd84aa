// The infra module contains implementations of core traits.
// Each feature implementation goes in its own submodule.

#[path = "moderation/moderation_adapters.rs"]
pub mod moderation;
