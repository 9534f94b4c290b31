use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use casbin_watcher::UpdateCallback;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::protocol::AMQPErrorKind;
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::DestinationTopology;

const CONSUMER_TAG: &str = "casbin-watcher";

pub(crate) type CallbackSlot = Arc<Mutex<Option<UpdateCallback>>>;

pub(crate) struct SubscriberConfig {
    pub uri: String,
    pub destination: String,
    pub topology: DestinationTopology,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

pub(crate) fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

/// How the subscribe loop reacts to an error from the client library.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Disposition {
    /// Transient network failure. Reconnect and resume.
    Reconnect,

    /// The broker closed the connection (AMQP hard error). Intentional
    /// shutdown or fatal policy rejection, so delivery stops.
    ClosedByBroker,

    /// Channel-level protocol error, e.g. a declare conflict. Indicates a
    /// configuration defect, so delivery stops.
    ChannelError,
}

pub(crate) fn classify(error: &lapin::Error) -> Disposition {
    match error {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            Disposition::Reconnect
        }
        lapin::Error::ProtocolError(amqp_error) => match amqp_error.kind() {
            AMQPErrorKind::Hard(_) => Disposition::ClosedByBroker,
            AMQPErrorKind::Soft(_) => Disposition::ChannelError,
        },
        _ => Disposition::ChannelError,
    }
}

/// Exponential reconnect backoff with jitter, capped at a maximum delay.
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    const fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        // Roughly double each time, with 0-10% jitter.
        self.current = std::cmp::min(
            self.current.mul_f64(fastrand::f64().mul_add(0.1, 2.0)),
            self.max,
        );
        delay
    }
}

enum LoopExit {
    Stopped,
    ConnectionLost,
}

/// Runs the subscribe loop until stopped or a terminal error occurs.
///
/// Transient connection failures are retried forever with backoff; a
/// broker-initiated close or a channel error ends delivery with only a log
/// line, matching the publish-and-forget contract of the watcher.
pub(crate) async fn run(
    config: SubscriberConfig,
    callback: CallbackSlot,
    mut stop_receiver: watch::Receiver<()>,
) {
    let mut backoff = Backoff::new(config.retry_base_delay, config.retry_max_delay);

    loop {
        let exit = consume(&config, &callback, &mut stop_receiver, &mut backoff).await;
        if !resumes_after(&exit, &config.destination) {
            break;
        }

        let delay = backoff.next_delay();
        debug!(?delay, "waiting before reconnect");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = stop_receiver.changed() => {
                info!(destination = %config.destination, "subscribe loop stopped");
                break;
            }
        }
    }
}

/// Decides whether the subscribe loop reconnects after an exit: transient
/// failures resume, while a stop signal, a broker-initiated close, or a
/// channel error ends delivery.
fn resumes_after(exit: &Result<LoopExit, lapin::Error>, destination: &str) -> bool {
    match exit {
        Ok(LoopExit::Stopped) => {
            info!(destination, "subscribe loop stopped");
            false
        }
        Ok(LoopExit::ConnectionLost) => {
            warn!(destination, "delivery stream ended; reconnecting");
            true
        }
        Err(error) => match classify(error) {
            Disposition::Reconnect => {
                warn!(destination, %error, "transient connection failure; reconnecting");
                true
            }
            Disposition::ClosedByBroker => {
                error!(destination, %error, "connection closed by broker; stopping delivery");
                false
            }
            Disposition::ChannelError => {
                error!(destination, %error, "channel error; stopping delivery");
                false
            }
        },
    }
}

async fn consume(
    config: &SubscriberConfig,
    callback: &CallbackSlot,
    stop_receiver: &mut watch::Receiver<()>,
    backoff: &mut Backoff,
) -> Result<LoopExit, lapin::Error> {
    let connection = Connection::connect(&config.uri, connection_properties()).await?;
    let channel = connection.create_channel().await?;

    crate::declare_destination(&channel, &config.destination, config.topology).await?;
    let queue = match config.topology {
        DestinationTopology::DirectQueue => config.destination.clone(),
        DestinationTopology::FanoutExchange => {
            // A server-named exclusive queue per subscriber, so every
            // instance receives its own copy of each notification.
            let queue = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        exclusive: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue.name().as_str(),
                    &config.destination,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            queue.name().as_str().to_owned()
        }
    };

    let mut consumer = channel
        .basic_consume(
            &queue,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    backoff.reset();
    info!(destination = %config.destination, queue = %queue, "consuming change notifications");

    loop {
        tokio::select! {
            _ = stop_receiver.changed() => {
                let _ = channel.close(200, "watcher closed").await;
                let _ = connection.close(200, "watcher closed").await;
                return Ok(LoopExit::Stopped);
            }
            delivery = consumer.next() => {
                let Some(delivery) = delivery else {
                    return Ok(LoopExit::ConnectionLost);
                };
                let delivery = delivery?;

                let payload = Bytes::from(delivery.data.clone());
                {
                    let guard = callback.lock().await;
                    if let Some(callback) = guard.as_ref() {
                        callback(payload);
                    }
                }
                // The slot lock is released before the ack so callback
                // registration never waits on broker I/O.
                delivery.ack(BasicAckOptions::default()).await?;
            }
        }
    }
}
