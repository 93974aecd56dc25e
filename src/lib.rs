//! # ndk-greeter: SR Linux NDK Greeter Agent
//!
//! An agent that registers with the SR Linux NDK manager, listens to its
//! `.greeter` config subtree and publishes a greeting derived from the
//! system's last boot time as agent state.
//!
//! ## Processing Pipeline
//!
//! ```text
//! config stream → aggregator → applier → uptime query → telemetry publish
//! ```
//!
//! ### Stage 1: Subscription
//!
//! The [`notification`] module registers a notification stream, subscribes it
//! to config changes and re-establishes it according to the [`retry`] policy
//! whenever it ends.
//!
//! ### Stage 2: Commit Aggregation
//!
//! Config events are buffered until the commit end marker so that one commit
//! is always handled as one transaction.
//!
//! ### Stage 3: Apply
//!
//! [`greeter::ConfigApplier`] merges the transaction into the in-memory
//! [`greeter::ConfigRecord`]. Deletions reset the record.
//!
//! ### Stage 4: Publish
//!
//! [`greeter::DerivedStatePublisher`] reads the last boot time through a
//! [`query::QueryClient`], renders the greeting and writes the record to the
//! telemetry tree through [`ndk::TelemetryService`].
//!
//! ## Runtime
//!
//! [`agent::Agent`] ties the stages together: registration, the transaction
//! loop and an orderly stop once the [`shutdown`] signal is raised. The NDK
//! services sit behind traits in [`ndk`]; [`ndk::loopback`] provides an
//! in-memory manager for development and tests.

pub mod agent;
pub mod config;
pub mod error;
pub mod greeter;
pub mod harness;
pub mod logging;
pub mod ndk;
pub mod notification;
pub mod query;
pub mod retry;
pub mod shutdown;
pub mod timestamp;

// Re-exports
pub use agent::Agent;
pub use config::AgentConfig;
pub use error::*;
