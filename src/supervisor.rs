//! Connection supervision
//!
//! [`initialize`] dials the broker (retrying dial failures at a fixed delay),
//! opens a session, applies QoS and declares queues. The resulting
//! [`BrokerLink`] is published through a watch channel so readers always see
//! a complete connection/session/queues triple.
//!
//! [`MqHandle::monitor_connection`] waits for the connection to drop, marks the
//! broker unreachable and reconnects. When consumers are registered the new
//! link is handed to the coordinator, which rebuilds them and reports the
//! broker reachable again once they are live.

use crate::broker::{Broker, BrokerLink, QueueDeclarer};
use crate::error::{MqError, MqResult, sanitize_error_message};
use crate::handoff::{HandoffReceiver, HandoffSender, handoff};
use crate::health::HealthSink;
use crate::observability::broker_span;
use crate::observability::metrics::metrics;
use crate::qos::QosPolicy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

/// Delay between connection attempts unless configured otherwise
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// When a reconnect waits for the coordinator before reporting healthy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryHandoff {
    /// Hand off only while consumers are registered; otherwise the broker
    /// is reported reachable as soon as the link is back
    #[default]
    WhenConsuming,
    /// Always hand off, waiting for a listener if none is registered yet
    Always,
}

/// Whether a successful reconnect must be handed to the coordinator (pure function)
pub fn handoff_required(policy: RecoveryHandoff, consuming: bool) -> bool {
    match policy {
        RecoveryHandoff::WhenConsuming => consuming,
        RecoveryHandoff::Always => true,
    }
}

/// Connection options for [`initialize`]
#[derive(Clone)]
pub struct MqOptions {
    pub uri: String,
    /// Prefetch policy, `None` applies [`QosPolicy::default`]
    pub qos: Option<QosPolicy>,
    pub reconnect_delay: Duration,
    pub handoff: RecoveryHandoff,
}

impl MqOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            qos: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            handoff: RecoveryHandoff::default(),
        }
    }

    pub fn with_qos(mut self, qos: QosPolicy) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_handoff(mut self, handoff: RecoveryHandoff) -> Self {
        self.handoff = handoff;
        self
    }

    /// The policy actually applied to every session
    pub fn effective_qos(&self) -> QosPolicy {
        QosPolicy::or_default(self.qos)
    }
}

impl std::fmt::Debug for MqOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqOptions")
            .field("uri", &sanitize_error_message(&self.uri))
            .field("qos", &self.qos)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("handoff", &self.handoff)
            .finish()
    }
}

/// Everything needed to build a fresh [`BrokerLink`]
struct Connector<B: Broker> {
    broker: B,
    uri: String,
    qos: QosPolicy,
    declarer: Box<dyn QueueDeclarer<B>>,
    reconnect_delay: Duration,
}

impl<B: Broker> Connector<B> {
    /// One pass through dial, session, QoS and declaration
    async fn connect_once(&self) -> MqResult<BrokerLink<B>> {
        metrics().connection_attempt();
        let connection = self.broker.dial(&self.uri).await.map_err(|e| {
            metrics().connection_failed();
            MqError::DialFailed(e)
        })?;

        let session = self
            .broker
            .open_session(&connection)
            .await
            .map_err(MqError::SessionFailed)?;

        self.broker
            .apply_qos(&session, &self.qos)
            .await
            .map_err(MqError::QosFailed)?;

        let queues = self
            .declarer
            .declare_queues(&session)
            .await
            .map_err(MqError::DeclareFailed)?;

        metrics().connection_established();
        Ok(BrokerLink {
            connection,
            session,
            queues,
        })
    }

    /// Retry dial failures every `reconnect_delay`. Any later step failing is
    /// returned at once since retrying cannot fix it.
    async fn establish(&self, shutdown: &mut watch::Receiver<bool>) -> MqResult<BrokerLink<B>> {
        let mut attempt = 1u32;
        loop {
            match self.connect_once().await {
                Ok(link) => return Ok(link),
                Err(e) if e.is_transient() => {
                    warn!(
                        "Broker dial attempt {} failed, retrying in {:?}: {}",
                        attempt,
                        self.reconnect_delay,
                        e.sanitized()
                    );
                    if !interruptible_sleep(self.reconnect_delay, shutdown).await {
                        return Err(MqError::Shutdown);
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) struct Shared<B: Broker> {
    connector: Connector<B>,
    handoff: RecoveryHandoff,
    link_tx: watch::Sender<Arc<BrokerLink<B>>>,
    health: Option<Arc<dyn HealthSink>>,
    // Published after the sink write so waiters never resume ahead of it
    reachable: watch::Sender<bool>,
    consuming: AtomicBool,
    recovery_tx: HandoffSender<()>,
    recovery_signals: AtomicU64,
    pub(crate) recovery_rx: Mutex<Option<HandoffReceiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Handle to a supervised broker connection. Cheap to clone.
pub struct MqHandle<B: Broker> {
    pub(crate) shared: Arc<Shared<B>>,
}

impl<B: Broker> Clone for MqHandle<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Connect to the broker and prepare the first link.
///
/// Dial failures are retried every `options.reconnect_delay` until the broker
/// answers. Session, QoS and declaration failures abort. Dropping the returned
/// future cancels the attempt.
pub async fn initialize<B, D>(
    broker: B,
    options: MqOptions,
    declarer: D,
    health: Option<Arc<dyn HealthSink>>,
) -> MqResult<MqHandle<B>>
where
    B: Broker,
    D: QueueDeclarer<B>,
{
    let qos = options.effective_qos();
    let connector = Connector {
        broker,
        uri: options.uri,
        qos,
        declarer: Box::new(declarer),
        reconnect_delay: options.reconnect_delay,
    };

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    info!(
        prefetch_count = qos.prefetch_count,
        global = qos.global,
        "Connecting to broker at {}",
        sanitize_error_message(&connector.uri)
    );
    let link = connector.establish(&mut shutdown_rx).await?;
    info!(queues = ?link.queue_names(), "Broker link established");

    let (link_tx, _) = watch::channel(Arc::new(link));
    let (reachable, _) = watch::channel(false);
    let (recovery_tx, recovery_rx) = handoff();

    let handle = MqHandle {
        shared: Arc::new(Shared {
            connector,
            handoff: options.handoff,
            link_tx,
            health,
            reachable,
            consuming: AtomicBool::new(false),
            recovery_tx,
            recovery_signals: AtomicU64::new(0),
            recovery_rx: Mutex::new(Some(recovery_rx)),
            shutdown_tx,
        }),
    };
    handle.set_health(true);
    Ok(handle)
}

impl<B: Broker> MqHandle<B> {
    /// The link currently installed
    pub fn current_link(&self) -> Arc<BrokerLink<B>> {
        self.shared.link_tx.borrow().clone()
    }

    /// Subscribe to link replacements
    pub fn link_updates(&self) -> watch::Receiver<Arc<BrokerLink<B>>> {
        self.shared.link_tx.subscribe()
    }

    pub fn broker(&self) -> &B {
        &self.shared.connector.broker
    }

    pub fn qos(&self) -> QosPolicy {
        self.shared.connector.qos
    }

    /// Broker reachability as the event loop sees it
    pub fn health_status(&self) -> bool {
        match &self.shared.health {
            Some(sink) => sink.status(),
            None => *self.shared.reachable.borrow(),
        }
    }

    /// Every health transition, including ones no rebuild produced
    pub(crate) fn reachability(&self) -> watch::Receiver<bool> {
        self.shared.reachable.subscribe()
    }

    pub(crate) fn set_health(&self, reachable: bool) {
        if let Some(sink) = &self.shared.health {
            sink.set_status(reachable);
        }
        self.shared.reachable.send_replace(reachable);
        metrics().set_broker_reachable(reachable);
    }

    /// Whether a coordinator has registered consumers on this connection
    pub fn is_consuming(&self) -> bool {
        self.shared.consuming.load(Ordering::SeqCst)
    }

    pub(crate) fn set_consuming(&self, consuming: bool) {
        self.shared.consuming.store(consuming, Ordering::SeqCst);
    }

    /// Reconnected links handed to the consumer coordinator on this handle
    pub fn recovery_signals_sent(&self) -> u64 {
        self.shared.recovery_signals.load(Ordering::SeqCst)
    }

    /// Ask the monitor and the coordinator tasks to stop
    pub fn shutdown(&self) {
        info!("Shutdown requested for broker supervision");
        self.shared.shutdown_tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shared.shutdown_tx.borrow()
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shared.shutdown_tx.subscribe()
    }

    /// Watch the connection until it closes cleanly or shutdown is requested,
    /// reconnecting after every unexpected loss.
    pub async fn monitor_connection(&self) {
        let mut shutdown = self.shutdown_receiver();

        loop {
            let link = self.current_link();
            let closed = tokio::select! {
                reason = self.shared.connector.broker.closed(&link.connection) => reason,
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Connection monitor stopping on shutdown");
                    return;
                }
            };
            drop(link);

            let Some(reason) = closed else {
                info!("Broker connection closed cleanly, monitor stopping");
                return;
            };

            warn!(
                "Broker connection lost: {}",
                sanitize_error_message(&reason.to_string())
            );
            metrics().connection_lost();
            self.set_health(false);

            if !self.reconnect(&mut shutdown).await {
                info!("Connection monitor stopping on shutdown");
                return;
            }
        }
    }

    /// Run [`Self::monitor_connection`] on its own task
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(
            async move { handle.monitor_connection().await }
                .instrument(broker_span!(handoff = ?self.shared.handoff)),
        )
    }

    /// Reconnect loop. Returns `false` if shutdown interrupted it.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.shared.connector.reconnect_delay;
        let mut attempt = 1u32;

        loop {
            if !interruptible_sleep(delay, shutdown).await {
                return false;
            }

            let result = tokio::select! {
                result = self.shared.connector.connect_once() => result,
                _ = wait_for_shutdown(shutdown) => return false,
            };

            match result {
                Ok(link) => {
                    self.shared.link_tx.send_replace(Arc::new(link));
                    metrics().reconnected();
                    info!("Reconnected to broker after {} attempt(s)", attempt);
                    return self.complete_recovery(shutdown).await;
                }
                Err(e) => {
                    error!("Reconnect attempt {} failed: {}", attempt, e.sanitized());
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Either hand the new link to the coordinator or report healthy directly
    async fn complete_recovery(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        if !handoff_required(self.shared.handoff, self.is_consuming()) {
            self.set_health(true);
            return true;
        }

        debug!("Handing reconnected link to consumer coordinator");
        tokio::select! {
            sent = self.shared.recovery_tx.send(()) => {
                match sent {
                    Ok(()) => {
                        self.shared.recovery_signals.fetch_add(1, Ordering::SeqCst);
                        metrics().recovery_signal_sent();
                    }
                    Err(_) => {
                        warn!("Consumer coordinator is gone, reporting broker reachable");
                        self.set_health(true);
                    }
                }
                true
            }
            _ = wait_for_shutdown(shutdown) => false,
        }
    }
}

/// Sleep for `duration` unless shutdown arrives first. Returns `false` on shutdown.
pub(crate) async fn interruptible_sleep(
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

/// Resolve once shutdown is requested. Pends forever if the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
