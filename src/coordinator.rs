//! Consumer coordination
//!
//! [`MqHandle::listen`] builds the application's consumers once, then runs two
//! tasks:
//!
//! - the rebuild task waits for the supervisor's recovery signal, recreates
//!   the consumers on the new link, publishes them, marks the broker reachable
//!   and acknowledges the rebuild to the event task;
//! - the event task drives the application's handler over the current
//!   consumers, pausing while the broker is unreachable and resuming on the
//!   rebuild ack or on any other transition back to reachable.

use crate::broker::{BoxError, Broker, BrokerLink};
use crate::error::{MqError, MqResult, sanitize_error_message};
use crate::handoff::HandoffReceiver;
use crate::observability::consumer_span;
use crate::observability::metrics::metrics;
use crate::supervisor::{MqHandle, wait_for_shutdown};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error, info};

/// Logical consumer name to consumer handle
pub type ConsumerSet<C> = HashMap<String, C>;

/// Application hook that registers consumers on a link.
/// Called once by [`MqHandle::listen`] and again after every reconnect.
#[async_trait]
pub trait ConsumerFactory<B: Broker, C: Send + 'static>: Send + Sync + 'static {
    async fn create_consumers(&self, link: &BrokerLink<B>) -> Result<ConsumerSet<C>, BoxError>;
}

/// Application hook that drains deliveries from the current consumers.
///
/// Called repeatedly while the broker is reachable. Each call should return
/// after a bounded amount of work so the coordinator can swap in rebuilt
/// consumers between calls.
#[async_trait]
pub trait EventHandler<C: Send + 'static>: Send + 'static {
    async fn handle_events(&mut self, consumers: &mut ConsumerSet<C>);
}

/// The two callbacks [`MqHandle::listen`] requires
pub struct ListenOptions<B: Broker, C: Send + 'static> {
    create_consumers: Option<Box<dyn ConsumerFactory<B, C>>>,
    handle_events: Option<Box<dyn EventHandler<C>>>,
}

impl<B: Broker, C: Send + 'static> Default for ListenOptions<B, C> {
    fn default() -> Self {
        Self {
            create_consumers: None,
            handle_events: None,
        }
    }
}

impl<B: Broker, C: Send + 'static> ListenOptions<B, C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_consumers(mut self, factory: impl ConsumerFactory<B, C>) -> Self {
        self.create_consumers = Some(Box::new(factory));
        self
    }

    pub fn handle_events(mut self, handler: impl EventHandler<C>) -> Self {
        self.handle_events = Some(Box::new(handler));
        self
    }
}

/// Join handle over the rebuild and event tasks started by `listen`
#[derive(Debug)]
pub struct ListenHandle {
    rebuild: JoinHandle<()>,
    events: JoinHandle<()>,
}

impl ListenHandle {
    /// Wait for both tasks. They finish after [`MqHandle::shutdown`].
    pub async fn join(self) -> Result<(), JoinError> {
        self.rebuild.await?;
        self.events.await
    }

    /// Cancel both tasks. Terminal for the handle: the recovery receiver is
    /// dropped with the rebuild task, so a later `listen` on the same
    /// [`MqHandle`] fails with [`MqError::AlreadyListening`] and reconnects
    /// report the broker reachable without a rebuild.
    pub fn abort(&self) {
        self.rebuild.abort();
        self.events.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.rebuild.is_finished() && self.events.is_finished()
    }
}

/// Rebuilt consumers waiting for the event task
type ConsumerSlot<C> = Arc<Mutex<Option<ConsumerSet<C>>>>;

/// Clears the consuming flag when the rebuild task is dropped, aborted or not
struct ConsumingGuard<B: Broker>(MqHandle<B>);

impl<B: Broker> Drop for ConsumingGuard<B> {
    fn drop(&mut self) {
        self.0.set_consuming(false);
    }
}

impl<B: Broker> MqHandle<B> {
    /// Register consumers and start handling events.
    ///
    /// Fails without starting anything if a callback is missing, if consumers
    /// are already listening on this handle, or if the first consumer set
    /// cannot be created.
    pub async fn listen<C: Send + 'static>(
        &self,
        options: ListenOptions<B, C>,
    ) -> MqResult<ListenHandle> {
        let factory = options
            .create_consumers
            .ok_or(MqError::MissingListenOption("create_consumers"))?;
        let handler = options
            .handle_events
            .ok_or(MqError::MissingListenOption("handle_events"))?;

        let mut receiver_guard = self.shared.recovery_rx.lock().await;
        let recovery_rx = receiver_guard.take().ok_or(MqError::AlreadyListening)?;

        self.set_consuming(true);
        let link = self.current_link();
        let consumers = match factory.create_consumers(&link).await {
            Ok(consumers) => consumers,
            Err(e) => {
                self.set_consuming(false);
                *receiver_guard = Some(recovery_rx);
                return Err(MqError::ConsumerSetupFailed(e));
            }
        };
        drop(link);
        drop(receiver_guard);

        info!(consumers = consumers.len(), "Consumers registered, listening");

        let slot: ConsumerSlot<C> = Arc::new(Mutex::new(None));
        let ack = Arc::new(Notify::new());

        let rebuild = tokio::spawn(
            rebuild_loop(
                self.clone(),
                ConsumingGuard(self.clone()),
                factory,
                recovery_rx,
                slot.clone(),
                ack.clone(),
            )
            .instrument(consumer_span!(task = "rebuild")),
        );
        let events = tokio::spawn(
            event_loop(self.clone(), handler, consumers, slot, ack)
                .instrument(consumer_span!(task = "events")),
        );

        Ok(ListenHandle { rebuild, events })
    }
}

/// Rebuild consumers each time the supervisor hands over a new link
async fn rebuild_loop<B: Broker, C: Send + 'static>(
    handle: MqHandle<B>,
    _consuming: ConsumingGuard<B>,
    factory: Box<dyn ConsumerFactory<B, C>>,
    mut recovery_rx: HandoffReceiver<()>,
    slot: ConsumerSlot<C>,
    ack: Arc<Notify>,
) {
    let mut shutdown = handle.shutdown_receiver();
    let mut consecutive_failures = 0u32;

    loop {
        let signal = tokio::select! {
            signal = recovery_rx.recv() => signal,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };
        if signal.is_none() {
            break;
        }

        debug!("Recovery signal received, rebuilding consumers");
        let link = handle.current_link();
        let result = tokio::select! {
            result = factory.create_consumers(&link) => result,
            _ = wait_for_shutdown(&mut shutdown) => break,
        };

        match result {
            Ok(consumers) => {
                let count = consumers.len();
                *slot.lock().await = Some(consumers);
                handle.set_health(true);
                ack.notify_one();
                consecutive_failures = 0;
                metrics().consumers_rebuilt();
                info!(consumers = count, "Consumers rebuilt on new link");
            }
            Err(e) => {
                // Stays unhealthy; the next reconnect triggers another attempt
                consecutive_failures = consecutive_failures.saturating_add(1);
                metrics().consumer_rebuild_failed();
                error!(
                    consecutive_failures,
                    "Failed to rebuild consumers, event handling stays paused: {}",
                    sanitize_error_message(&e.to_string())
                );
            }
        }
    }

    info!("Consumer rebuild task stopped");
}

/// Drive the event handler, pausing while the broker is unreachable
async fn event_loop<B: Broker, C: Send + 'static>(
    handle: MqHandle<B>,
    mut handler: Box<dyn EventHandler<C>>,
    mut current: ConsumerSet<C>,
    slot: ConsumerSlot<C>,
    ack: Arc<Notify>,
) {
    let mut shutdown = handle.shutdown_receiver();
    let mut reachable = handle.reachability();

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Health before the slot: the rebuild task publishes the set first
        if !handle.health_status() {
            metrics().event_loop_paused();
            info!("Broker unreachable, event handling paused until consumers are rebuilt");
            tokio::select! {
                _ = ack.notified() => {}
                _ = reachable.wait_for(|up| *up) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
            continue;
        }

        let rebuilt = slot.lock().await.take();
        if let Some(rebuilt) = rebuilt {
            debug!(consumers = rebuilt.len(), "Switching to rebuilt consumers");
            current = rebuilt;
        }

        let started = Instant::now();
        tokio::select! {
            _ = handler.handle_events(&mut current) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
        metrics().events_handled(started.elapsed());
        tokio::task::yield_now().await;
    }

    info!("Event handling stopped");
}
