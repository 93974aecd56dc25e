use thiserror::Error;

use crate::config::ConfigError;
use crate::greeter::applier::ApplyError;
use crate::greeter::publisher::PublishError;
use crate::ndk::NdkError;
use crate::notification::stream::StreamError;
use crate::query::QueryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("NDK error: {0}")]
    Ndk(#[from] NdkError),
    // notification stream
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("Query error: {0}")]
    Query(#[from] QueryError),
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
