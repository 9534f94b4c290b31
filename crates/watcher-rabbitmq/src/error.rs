use casbin_watcher::WatcherError;
use thiserror::Error;

/// Errors that can occur when using the RabbitMQ watcher.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting to the broker failed. Surfaces unreachable brokers and
    /// rejected credentials at construction time.
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    /// Declaring the destination queue or exchange failed.
    #[error("failed to declare destination: {0}")]
    Declare(#[source] lapin::Error),

    /// Publishing a change notification failed.
    #[error("failed to publish change notification: {0}")]
    Publish(#[source] lapin::Error),

    /// Closing the publish channel or connection failed.
    #[error("failed to close watcher: {0}")]
    Close(#[source] lapin::Error),
}

impl WatcherError for Error {}
