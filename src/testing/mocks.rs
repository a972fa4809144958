//! Mock implementations for testing
//!
//! An in-memory [`Broker`] whose connections can be dropped on demand, plus
//! recording implementations of the health sink, queue declarer, consumer
//! factory and event handler. Together they let the supervision and recovery
//! paths run without a RabbitMQ instance.

use crate::broker::{BoxError, Broker, BrokerError, BrokerLink, QueueDeclarer, QueueSet};
use crate::coordinator::{ConsumerFactory, ConsumerSet, EventHandler};
use crate::health::HealthSink;
use crate::qos::QosPolicy;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared, ordered log of what the mocks observed
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Index of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }

    /// Index of the last entry equal to `entry`
    pub fn last_position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().rposition(|e| e == entry)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
enum MockLinkState {
    Open,
    Closed,
    Dropped(String),
}

#[derive(Debug)]
pub struct MockConnection {
    pub id: u32,
    state_rx: watch::Receiver<MockLinkState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockSession {
    pub connection_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockQueue {
    pub name: String,
    pub connection_id: u32,
}

#[derive(Debug, Default)]
struct MockBrokerState {
    failing_dials: AtomicU32,
    reject_sessions: AtomicBool,
    reject_qos: AtomicBool,
    dial_attempts: AtomicU32,
    connections_opened: AtomicU32,
    applied_qos: Mutex<Vec<QosPolicy>>,
    live: Mutex<Option<watch::Sender<MockLinkState>>>,
}

/// In-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<MockBrokerState>,
    journal: Journal,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Refuse the next `count` dials. `u32::MAX` keeps the broker down until reset with 0.
    pub fn fail_next_dials(&self, count: u32) {
        self.state.failing_dials.store(count, Ordering::SeqCst);
    }

    pub fn reject_sessions(&self, reject: bool) {
        self.state.reject_sessions.store(reject, Ordering::SeqCst);
    }

    pub fn reject_qos(&self, reject: bool) {
        self.state.reject_qos.store(reject, Ordering::SeqCst);
    }

    /// Simulate an unexpected loss of the live connection
    pub fn drop_connection(&self, reason: &str) {
        if let Some(tx) = lock(&self.state.live).as_ref() {
            tx.send_replace(MockLinkState::Dropped(reason.to_string()));
        }
    }

    /// Close the live connection deliberately
    pub fn close_connection(&self) {
        if let Some(tx) = lock(&self.state.live).as_ref() {
            tx.send_replace(MockLinkState::Closed);
        }
    }

    pub fn dial_attempts(&self) -> u32 {
        self.state.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> u32 {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Every policy applied so far, one per session
    pub fn applied_qos(&self) -> Vec<QosPolicy> {
        lock(&self.state.applied_qos).clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Connection = MockConnection;
    type Session = MockSession;
    type Queue = MockQueue;

    async fn dial(&self, _uri: &str) -> Result<MockConnection, BrokerError> {
        self.state.dial_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .state
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if refused {
            self.journal.record("dial:refused");
            return Err(BrokerError::ConnectionFailed("connection refused".into()));
        }

        let id = self.state.connections_opened.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, state_rx) = watch::channel(MockLinkState::Open);
        *lock(&self.state.live) = Some(tx);
        self.journal.record(format!("dial:{}", id));
        Ok(MockConnection { id, state_rx })
    }

    async fn open_session(&self, connection: &MockConnection) -> Result<MockSession, BrokerError> {
        if self.state.reject_sessions.load(Ordering::SeqCst) {
            return Err(BrokerError::SessionFailed("channel_max reached".into()));
        }
        Ok(MockSession {
            connection_id: connection.id,
        })
    }

    async fn apply_qos(&self, session: &MockSession, qos: &QosPolicy) -> Result<(), BrokerError> {
        if self.state.reject_qos.load(Ordering::SeqCst) {
            return Err(BrokerError::QosRejected("PRECONDITION_FAILED".to_string()));
        }
        lock(&self.state.applied_qos).push(*qos);
        self.journal.record(format!("qos:{}", session.connection_id));
        Ok(())
    }

    async fn closed(&self, connection: &MockConnection) -> Option<BrokerError> {
        let mut state_rx = connection.state_rx.clone();
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                MockLinkState::Open => {}
                MockLinkState::Closed => return None,
                MockLinkState::Dropped(reason) => return Some(BrokerError::Closed(reason)),
            }
            if state_rx.changed().await.is_err() {
                return Some(BrokerError::Closed("mock broker dropped".to_string()));
            }
        }
    }
}

/// Health sink that keeps every value it was given
#[derive(Debug, Default)]
pub struct MockHealth {
    history: Mutex<Vec<bool>>,
    journal: Option<Journal>,
}

impl MockHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            history: Mutex::default(),
            journal: Some(journal),
        }
    }

    pub fn history(&self) -> Vec<bool> {
        lock(&self.history).clone()
    }
}

impl HealthSink for MockHealth {
    fn status(&self) -> bool {
        lock(&self.history).last().copied().unwrap_or(false)
    }

    fn set_status(&self, reachable: bool) {
        lock(&self.history).push(reachable);
        if let Some(journal) = &self.journal {
            journal.record(format!("health:{}", reachable));
        }
    }
}

/// Declares a fixed list of queues on every session
#[derive(Debug, Clone, Default)]
pub struct MockQueueDeclarer {
    names: Vec<String>,
    fail: Arc<AtomicBool>,
}

impl MockQueueDeclarer {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            fail: Arc::default(),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueDeclarer<MockBroker> for MockQueueDeclarer {
    async fn declare_queues(
        &self,
        session: &MockSession,
    ) -> Result<QueueSet<MockQueue>, BoxError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("ACCESS_REFUSED - queue declaration denied".into());
        }
        Ok(self
            .names
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    MockQueue {
                        name: name.clone(),
                        connection_id: session.connection_id,
                    },
                )
            })
            .collect())
    }
}

/// Consumer created by [`MockConsumerFactory`]
#[derive(Debug, Clone, PartialEq)]
pub struct MockConsumer {
    pub queue: String,
    pub connection_id: u32,
    pub generation: u32,
}

/// Creates one consumer per declared queue, tagging each set with a generation
#[derive(Debug, Clone, Default)]
pub struct MockConsumerFactory {
    failing: Arc<AtomicU32>,
    generation: Arc<AtomicU32>,
    journal: Option<Journal>,
}

impl MockConsumerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.failing.store(count, Ordering::SeqCst);
    }

    /// Number of consumer sets created successfully
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerFactory<MockBroker, MockConsumer> for MockConsumerFactory {
    async fn create_consumers(
        &self,
        link: &BrokerLink<MockBroker>,
    ) -> Result<ConsumerSet<MockConsumer>, BoxError> {
        let failed = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            if let Some(journal) = &self.journal {
                journal.record("consumers:failed");
            }
            return Err("basic.consume refused".into());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(journal) = &self.journal {
            journal.record(format!("consumers:{}", generation));
        }

        Ok(link
            .queue_names()
            .into_iter()
            .map(|queue| {
                (
                    queue.to_string(),
                    MockConsumer {
                        queue: queue.to_string(),
                        connection_id: link.connection.id,
                        generation,
                    },
                )
            })
            .collect())
    }
}

/// One call to [`RecordingHandler::handle_events`]
#[derive(Debug, Clone, PartialEq)]
pub struct HandledBatch {
    pub generations: Vec<u32>,
    pub connection_ids: Vec<u32>,
    pub healthy: bool,
}

/// Event handler that records which consumers it was given
#[derive(Clone)]
pub struct RecordingHandler {
    health: Arc<dyn HealthSink>,
    batches: Arc<Mutex<Vec<HandledBatch>>>,
}

impl RecordingHandler {
    pub fn new(health: Arc<dyn HealthSink>) -> Self {
        Self {
            health,
            batches: Arc::default(),
        }
    }

    pub fn batches(&self) -> Vec<HandledBatch> {
        lock(&self.batches).clone()
    }

    pub fn calls(&self) -> usize {
        lock(&self.batches).len()
    }

    /// Highest consumer generation seen so far
    pub fn latest_generation(&self) -> Option<u32> {
        lock(&self.batches)
            .iter()
            .flat_map(|b| b.generations.iter().copied())
            .max()
    }
}

#[async_trait]
impl EventHandler<MockConsumer> for RecordingHandler {
    async fn handle_events(&mut self, consumers: &mut ConsumerSet<MockConsumer>) {
        let mut generations: Vec<u32> = consumers.values().map(|c| c.generation).collect();
        generations.sort_unstable();
        generations.dedup();
        let mut connection_ids: Vec<u32> = consumers.values().map(|c| c.connection_id).collect();
        connection_ids.sort_unstable();
        connection_ids.dedup();

        lock(&self.batches).push(HandledBatch {
            generations,
            connection_ids,
            healthy: self.health.status(),
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
