//! # Config Notifications
//!
//! ```text
//! ┌──────────────┐  responses  ┌────────────┐ transactions ┌──────────┐
//! │ ConfigStream │────────────▶│ Aggregator │─────────────▶│  Agent   │
//! └──────────────┘             └────────────┘    (mpsc)    └──────────┘
//! ```
//!
//! [`stream::ConfigStream`] owns the subscription and re-establishes it with
//! the configured [`crate::retry::RetryPolicy`]. Each received response is
//! fed to the [`aggregator::ConfigAggregator`], which buffers config events
//! until the commit end marker and then emits them as one
//! [`aggregator::Transaction`] over the channel to the agent's main loop.

pub mod aggregator;
pub mod stream;

pub use aggregator::{ConfigAggregator, Transaction};
pub use stream::{ConfigStream, StreamError};
