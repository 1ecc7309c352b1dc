//! Forwarding flow: publish queue → connection manager
//!
//! The forwarder is the only caller of `ConnectionManager::publish`. Its lifecycle is
//! a statum state machine:
//!
//! ```text
//! Waiting ──dequeue──► Publishing(Sample) ──ok──► Waiting
//!    ▲                        │
//!    │                  error, requeue
//!    │                        ▼
//!    └──connected again── Stalled(StallReason)
//! ```
//!
//! Every state exits when the queue is closed.

use super::queue::{PublishQueue, QueueError};
use super::status::Telemetry;
use crate::mqtt::{ConnectionError, ConnectionManager, ConnectionState};
use crate::sensor::Sample;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Why publishing is paused
#[derive(Debug, Clone, PartialEq)]
pub enum StallReason {
    /// The connection left `Connected`; wait until it is back
    NotConnected,
    /// The session refused the request while connected; retry after a delay
    PublishFailed(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum ForwardingState {
    Waiting,
    Publishing(Sample),
    Stalled(StallReason),
}

#[machine]
pub struct Forwarder<S: ForwardingState> {
    queue: Arc<PublishQueue>,
    connection: ConnectionManager,
    state_rx: watch::Receiver<ConnectionState>,
    topic: String,
    retry_delay: Duration,
    telemetry: Arc<Telemetry>,
}

/// Result of one publish attempt
pub enum PublishOutcome {
    Sent(Forwarder<Waiting>),
    Stalled(Forwarder<Stalled>),
    Closed,
}

impl<S: ForwardingState> Forwarder<S> {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Forwarder<Waiting> {
    pub(crate) fn create(
        queue: Arc<PublishQueue>,
        connection: ConnectionManager,
        topic: String,
        retry_delay: Duration,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let state_rx = connection.subscribe();
        Self::new(queue, connection, state_rx, topic, retry_delay, telemetry)
    }

    /// Waits for the next sample; `None` once the queue is closed
    pub async fn next_sample(self) -> Option<Forwarder<Publishing>> {
        match self.queue.dequeue().await {
            Ok(sample) => Some(self.transition_with(sample)),
            Err(QueueError::QueueClosed) => {
                debug!("Queue closed while waiting for samples");
                None
            }
        }
    }
}

impl Forwarder<Publishing> {
    /// Publishes the held sample, requeueing it at the head on failure
    pub async fn publish(self) -> PublishOutcome {
        let Some(sample) = self.get_state_data().copied() else {
            warn!("Publishing state without a sample, skipping");
            return PublishOutcome::Sent(self.transition());
        };

        let error = match self.connection.publish(&self.topic, &sample).await {
            Ok(()) => {
                self.telemetry.record_forwarded();
                return PublishOutcome::Sent(self.transition());
            }
            Err(error) => error,
        };

        let reason = match error {
            ConnectionError::NotConnected => StallReason::NotConnected,
            other => StallReason::PublishFailed(other.to_string()),
        };

        match self.queue.requeue(sample) {
            Ok(true) => {
                self.telemetry.record_requeued();
                debug!("Requeued {} ({:?})", sample, reason);
            }
            Ok(false) => debug!("Queue full, {} dropped instead of requeued", sample),
            Err(QueueError::QueueClosed) => {
                debug!("Queue closed during publish of {}", sample);
                return PublishOutcome::Closed;
            }
        }

        PublishOutcome::Stalled(self.transition_with(reason))
    }
}

impl Forwarder<Stalled> {
    /// Waits until publishing can resume; `None` once the queue is closed
    pub async fn recover(mut self) -> Option<Forwarder<Waiting>> {
        let reason = self
            .get_state_data()
            .cloned()
            .unwrap_or(StallReason::NotConnected);
        let queue = self.queue.clone();

        match reason {
            StallReason::PublishFailed(error) => {
                warn!(
                    "Publish failed ({}), retrying in {:?}",
                    error, self.retry_delay
                );
                tokio::select! {
                    _ = queue.closed() => return None,
                    _ = sleep(self.retry_delay) => {}
                }
            }
            StallReason::NotConnected => {
                let current = self.state_rx.borrow().clone();
                info!("Forwarding paused, broker is {}", current);
                let state_rx = &mut self.state_rx;
                let reconnected = async move {
                    state_rx.wait_for(|s| s.is_connected()).await.map(|_| ())
                };
                // A `Failed` connection ends the run, which closes the queue
                tokio::select! {
                    _ = queue.closed() => return None,
                    result = reconnected => {
                        if result.is_err() {
                            warn!("Connection state channel closed, stopping forwarder");
                            return None;
                        }
                    }
                }
                info!("Broker connected again, resuming forwarding");
            }
        }

        Some(self.transition())
    }
}

/// Runs the forwarding flow until the queue is closed
pub async fn run_forwarder(forwarder: Forwarder<Waiting>) {
    info!("Forwarding flow started for topic '{}'", forwarder.topic());
    let mut waiting = forwarder;

    loop {
        let Some(publishing) = waiting.next_sample().await else {
            break;
        };

        waiting = match publishing.publish().await {
            PublishOutcome::Sent(next) => next,
            PublishOutcome::Stalled(stalled) => match stalled.recover().await {
                Some(next) => next,
                None => break,
            },
            PublishOutcome::Closed => break,
        };
    }

    info!("Forwarding flow stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::mqtt::{BackoffSettings, ConnectionSettings, SimulatedBroker};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn setup(broker: &SimulatedBroker) -> (Arc<PublishQueue>, ConnectionManager, Arc<Telemetry>) {
        let settings = ConnectionSettings {
            disconnect_grace_ms: 200,
            reconnect: BackoffSettings {
                base_ms: 10,
                max_ms: 20,
                max_attempts: None,
            },
            ..Default::default()
        };
        (
            Arc::new(PublishQueue::new(8)),
            ConnectionManager::new(Arc::new(broker.clone()), settings),
            Arc::new(Telemetry::default()),
        )
    }

    fn config() -> BrokerConfig {
        BrokerConfig::new("tcp://sim", "fwd", "user", "pass", "lux")
    }

    #[tokio::test]
    async fn not_connected_requeues_instead_of_losing() {
        let broker = SimulatedBroker::new();
        let (queue, connection, telemetry) = setup(&broker);
        queue.enqueue(Sample::now(1.0)).unwrap();

        let forwarder = Forwarder::create(
            queue.clone(),
            connection.clone(),
            "lux".into(),
            Duration::from_millis(10),
            telemetry.clone(),
        );
        let task = tokio::spawn(run_forwarder(forwarder));

        timeout(WAIT, async {
            while telemetry.requeued() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The sample is back in the queue, nothing reached the broker
        assert_eq!(queue.len(), 1);
        assert!(broker.messages().is_empty());

        // Once connected the stalled forwarder delivers it
        connection.connect(&config()).await.unwrap();
        timeout(WAIT, async {
            while broker.messages().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.messages()[0].payload_str(), "1.0");
        assert_eq!(telemetry.forwarded(), 1);

        queue.close();
        timeout(WAIT, task).await.unwrap().unwrap();
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn closing_the_queue_stops_a_stalled_forwarder() {
        let broker = SimulatedBroker::new();
        let (queue, connection, telemetry) = setup(&broker);
        queue.enqueue(Sample::now(1.0)).unwrap();

        let forwarder = Forwarder::create(
            queue.clone(),
            connection,
            "lux".into(),
            Duration::from_millis(10),
            telemetry.clone(),
        );
        let task = tokio::spawn(run_forwarder(forwarder));

        timeout(WAIT, async {
            while telemetry.requeued() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        queue.close();
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forwards_in_fifo_order() {
        let broker = SimulatedBroker::new();
        let (queue, connection, telemetry) = setup(&broker);
        connection.connect(&config()).await.unwrap();

        for value in [1.0, 2.0, 3.0] {
            queue.enqueue(Sample::now(value)).unwrap();
        }

        let forwarder = Forwarder::create(
            queue.clone(),
            connection.clone(),
            "lux".into(),
            Duration::from_millis(10),
            telemetry,
        );
        let task = tokio::spawn(run_forwarder(forwarder));

        timeout(WAIT, async {
            while broker.messages().len() < 3 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let payloads: Vec<String> = broker
            .messages()
            .iter()
            .map(|m| m.payload_str().into_owned())
            .collect();
        assert_eq!(payloads, vec!["1.0", "2.0", "3.0"]);

        queue.close();
        timeout(WAIT, task).await.unwrap().unwrap();
        connection.disconnect().await;
    }
}
