//! Bridge Controller - the user-facing on/off toggle
//!
//! Wires the three flows of one bridge run together:
//!
//! ```text
//! ReadingSource ──sampling──► PublishQueue ──forwarding──► ConnectionManager ──► broker
//!        │                                                        ▲
//!        └──► brightness watch                      supervisor ───┘ (reconnects)
//! ```
//!
//! Each `start` opens a fresh source and a fresh queue. The sampling flow runs inside
//! the run supervisor task, which also owns the forwarding task and tears everything
//! down in order: close the queue, wait for the forwarder, disconnect. A lost sensor
//! or a connection that gives up reconnecting ends the run the same way.

use super::forwarder::{run_forwarder, Forwarder, Waiting};
use super::queue::{PublishQueue, DEFAULT_CAPACITY};
use super::status::{BridgeStatus, Telemetry};
use crate::config::BrokerConfig;
use crate::mqtt::{ConnectionError, ConnectionManager, ConnectionState};
use crate::sensor::{ReadingSource, Sample, SourceError, SourceProvider};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunables for the bridge flows
///
/// # Examples
///
/// ```rust
/// use luxbridge::bridge::BridgeSettings;
///
/// // Keep a longer history while the broker is unreachable
/// let settings = BridgeSettings {
///     queue_capacity: 512,
///     ..Default::default()
/// };
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeSettings {
    /// Capacity of the publish queue; the oldest sample is evicted beyond it
    pub queue_capacity: usize,

    /// How long `stop` waits for the forwarding flow before aborting it
    pub stop_timeout_ms: u64,

    /// Pause before retrying a publish the session rejected while connected
    pub publish_retry_delay_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_CAPACITY,
            stop_timeout_ms: 3_000,
            publish_retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

struct BridgeRun {
    cancel: CancellationToken,
    queue: Arc<PublishQueue>,
    supervisor: JoinHandle<()>,
}

/// Everything the run supervisor task owns
struct RunContext {
    source: Box<dyn ReadingSource>,
    cancel: CancellationToken,
    queue: Arc<PublishQueue>,
    forwarder: Forwarder<Waiting>,
    connection: ConnectionManager,
    telemetry: Arc<Telemetry>,
    stop_timeout: Duration,
}

/// Sensor-to-broker bridge with a start/stop toggle
pub struct Bridge {
    connection: ConnectionManager,
    sources: Arc<dyn SourceProvider>,
    settings: BridgeSettings,
    run: AsyncMutex<Option<BridgeRun>>,
    /// Queue of the current or last run, read by `status` without the run lock
    active_queue: Mutex<Option<Arc<PublishQueue>>>,
    telemetry: Arc<Telemetry>,
}

impl Bridge {
    pub fn new(
        connection: ConnectionManager,
        sources: Arc<dyn SourceProvider>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            connection,
            sources,
            settings,
            run: AsyncMutex::new(None),
            active_queue: Mutex::new(None),
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    /// Switches the bridge on
    ///
    /// Connects with `config`, opens a fresh reading source and queue, then launches
    /// the sampling and forwarding flows. Fails with [`BridgeError::AlreadyRunning`]
    /// while a run is active; a configuration or connect error leaves the bridge off.
    pub async fn start(&self, config: &BrokerConfig) -> Result<(), BridgeError> {
        let mut run = self.run.lock().await;

        if run
            .as_ref()
            .is_some_and(|active| !active.supervisor.is_finished())
        {
            warn!("Start requested while the bridge is running");
            return Err(BridgeError::AlreadyRunning);
        }

        // A run that tore itself down still has to be collected
        if let Some(finished) = run.take() {
            self.retire(finished).await;
        }

        info!(
            "Starting bridge: {} → '{}' via {}",
            self.sources.describe(),
            config.topic,
            config.server_uri
        );

        if let Err(e) = self.connection.connect(config).await {
            error!("Bridge start failed: {}", e);
            self.telemetry.record_failure(e.to_string());
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let source = match self.sources.open(cancel.clone()) {
            Ok(source) => source,
            Err(e) => {
                error!("Failed to open {}: {}", self.sources.describe(), e);
                self.telemetry.record_failure(e.to_string());
                self.connection.disconnect().await;
                return Err(e.into());
            }
        };

        let queue = Arc::new(PublishQueue::new(self.settings.queue_capacity));
        *self.lock_active_queue() = Some(queue.clone());

        let forwarder = Forwarder::create(
            queue.clone(),
            self.connection.clone(),
            config.topic.clone(),
            Duration::from_millis(self.settings.publish_retry_delay_ms),
            self.telemetry.clone(),
        );

        let context = RunContext {
            source,
            cancel: cancel.clone(),
            queue: queue.clone(),
            forwarder,
            connection: self.connection.clone(),
            telemetry: self.telemetry.clone(),
            stop_timeout: Duration::from_millis(self.settings.stop_timeout_ms),
        };
        let supervisor = tokio::spawn(run_bridge(context));

        self.telemetry.clear_failure();
        *run = Some(BridgeRun {
            cancel,
            queue,
            supervisor,
        });

        info!("Bridge started");
        Ok(())
    }

    /// Switches the bridge off; a no-op when it is already off
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let Some(active) = run.take() else {
            debug!("Stop requested while the bridge is stopped");
            return;
        };

        info!("Stopping bridge");
        active.cancel.cancel();
        active.queue.close();
        self.retire(active).await;

        // Covers a supervisor that had to be aborted before it disconnected
        self.connection.disconnect().await;
        info!("Bridge stopped");
    }

    /// Waits for a run's supervisor and folds its counters into the totals
    async fn retire(&self, run: BridgeRun) {
        let BridgeRun {
            queue,
            mut supervisor,
            ..
        } = run;

        let grace = Duration::from_millis(
            self.settings.stop_timeout_ms + 2 * self.connection.settings().disconnect_grace_ms,
        );
        match timeout(grace, &mut supervisor).await {
            Ok(Ok(())) => debug!("Bridge run supervisor finished"),
            Ok(Err(e)) => error!("Bridge run supervisor failed: {}", e),
            Err(_) => {
                warn!("Bridge run did not finish within {:?}, aborting", grace);
                supervisor.abort();
            }
        }

        self.telemetry.retire_overflows(queue.overflow_events());
        let mut active_queue = self.lock_active_queue();
        if active_queue
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &queue))
        {
            *active_queue = None;
        }
    }

    fn lock_active_queue(&self) -> std::sync::MutexGuard<'_, Option<Arc<PublishQueue>>> {
        self.active_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether samples are currently flowing
    ///
    /// Turns false as soon as a run starts tearing down, including a teardown caused
    /// by the sensor going away.
    pub fn is_running(&self) -> bool {
        self.lock_active_queue()
            .as_ref()
            .is_some_and(|queue| !queue.is_closed())
    }

    pub fn status(&self) -> BridgeStatus {
        let (running, live_overflows) = match self.lock_active_queue().as_ref() {
            Some(queue) => (!queue.is_closed(), queue.overflow_events()),
            None => (false, 0),
        };
        let metrics = self.connection.metrics();

        let mut status = BridgeStatus {
            running,
            connection_state: self.connection.state(),
            transport_drops: metrics.transport_drops,
            reconnect_attempts: metrics.reconnect_attempts,
            ..Default::default()
        };
        self.telemetry.fill(&mut status, live_overflows);
        status
    }

    pub fn status_line(&self) -> String {
        self.status().status_line()
    }

    /// Latest brightness reading, updated by the sampling flow
    pub fn subscribe_brightness(&self) -> watch::Receiver<Option<Sample>> {
        self.telemetry.subscribe_brightness()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }
}

/// Run supervisor: sampling flow inline, forwarding flow as a child task
async fn run_bridge(context: RunContext) {
    let RunContext {
        mut source,
        cancel,
        queue,
        forwarder,
        connection,
        telemetry,
        stop_timeout,
    } = context;

    // Resolves once the reconnect budget is spent; `None` if the manager is gone
    let mut state_rx = connection.subscribe();
    let connection_failed = async move {
        let state = state_rx
            .wait_for(|state| matches!(state, ConnectionState::Failed(_)))
            .await
            .ok()?;
        match &*state {
            ConnectionState::Failed(reason) => Some(reason.clone()),
            other => Some(other.to_string()),
        }
    };
    tokio::pin!(connection_failed);
    let mut watching_connection = true;

    let mut forwarding = tokio::spawn(run_forwarder(forwarder));
    info!("Sampling flow started");

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            failed = &mut connection_failed, if watching_connection => {
                watching_connection = false;
                match failed {
                    Some(reason) => {
                        error!("Broker connection failed, stopping bridge: {}", reason);
                        telemetry.record_failure(format!("broker connection failed: {}", reason));
                        break;
                    }
                    None => continue,
                }
            }
            result = source.next_sample() => result,
        };

        match result {
            Ok(sample) => {
                telemetry.observe_sample(sample);
                debug!("Sampled {}", sample);
                if queue.enqueue(sample).is_err() {
                    debug!("Queue closed, sampling flow exits");
                    break;
                }
            }
            Err(SourceError::Cancelled) => break,
            Err(SourceError::SourceUnavailable(reason)) => {
                error!("Sensor unavailable, stopping bridge: {}", reason);
                telemetry.record_failure(format!("sensor unavailable: {}", reason));
                break;
            }
        }
    }

    info!("Sampling flow stopped");
    cancel.cancel();
    queue.close();

    match timeout(stop_timeout, &mut forwarding).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Forwarding task failed: {}", e),
        Err(_) => {
            warn!(
                "Forwarding flow did not stop within {:?}, aborting",
                stop_timeout
            );
            forwarding.abort();
        }
    }

    connection.disconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{BackoffSettings, ConnectionSettings, SimulatedBroker};
    use crate::sensor::SensorFeed;

    fn bridge(broker: &SimulatedBroker, feed: &SensorFeed) -> Bridge {
        let settings = ConnectionSettings {
            disconnect_grace_ms: 200,
            reconnect: BackoffSettings {
                base_ms: 10,
                max_ms: 20,
                max_attempts: None,
            },
            ..Default::default()
        };
        Bridge::new(
            ConnectionManager::new(Arc::new(broker.clone()), settings),
            Arc::new(feed.clone()),
            BridgeSettings {
                stop_timeout_ms: 500,
                ..Default::default()
            },
        )
    }

    fn config() -> BrokerConfig {
        BrokerConfig::new("tcp://sim", "ctl", "user", "pass", "lux")
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let broker = SimulatedBroker::new();
        let feed = SensorFeed::new();
        let bridge = bridge(&broker, &feed);

        bridge.start(&config()).await.unwrap();
        assert!(matches!(
            bridge.start(&config()).await,
            Err(BridgeError::AlreadyRunning)
        ));
        assert_eq!(broker.sessions_opened(), 1);

        bridge.stop().await;
        bridge.stop().await;
        assert!(!bridge.is_running());
        assert_eq!(bridge.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_is_reported_in_status() {
        let broker = SimulatedBroker::new();
        broker.refuse_with(Some("bad credentials".into()));
        let feed = SensorFeed::new();
        let bridge = bridge(&broker, &feed);

        let result = bridge.start(&config()).await;
        assert!(matches!(
            result,
            Err(BridgeError::Connection(ConnectionError::ConnectFailure(_)))
        ));

        let status = bridge.status();
        assert!(!status.running);
        assert!(status.last_failure.is_some());
        assert!(matches!(status.connection_state, ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn restart_after_stop_opens_a_new_session() {
        let broker = SimulatedBroker::new();
        let feed = SensorFeed::new();
        let bridge = bridge(&broker, &feed);

        bridge.start(&config()).await.unwrap();
        bridge.stop().await;
        bridge.start(&config()).await.unwrap();
        assert!(bridge.is_running());
        assert_eq!(broker.sessions_opened(), 2);

        bridge.stop().await;
        assert_eq!(broker.live_sessions(), 0);
    }
}
