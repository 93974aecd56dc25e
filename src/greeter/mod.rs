//! # Greeter
//!
//! The part of the agent that reacts to the `.greeter` config tree:
//!
//! - [`state::ConfigRecord`]: configured name plus derived greeting
//! - [`applier::ConfigApplier`]: merges a committed transaction into the record
//! - [`publisher::DerivedStatePublisher`]: computes the greeting from the
//!   system uptime and publishes the record as agent state

pub mod applier;
pub mod publisher;
pub mod state;

pub use applier::{ApplyOutcome, ApplySummary, ConfigApplier};
pub use publisher::{DerivedStatePublisher, PublishOutcome};
pub use state::ConfigRecord;
