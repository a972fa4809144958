//! Broker abstraction used by the supervisor
//!
//! The supervision logic never talks AMQP directly. It goes through the
//! [`Broker`] trait, which exposes exactly the four operations it needs, so the
//! reconnect and hand-off machinery can run against [`amqp::AmqpBroker`] in
//! production and against an in-memory broker in tests.

use crate::qos::QosPolicy;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod amqp;

/// Boxed error returned by application-supplied callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Logical queue name to declared queue handle
pub type QueueSet<Q> = HashMap<String, Q>;

/// Failures reported by a broker backend
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] BoxError),
    #[error("Session failed")]
    SessionFailed(#[source] BoxError),
    #[error("QoS rejected: {0}")]
    QosRejected(String),
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Connection-level operations the supervisor needs from a broker client
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Session: Send + Sync + 'static;
    type Queue: Send + Sync + 'static;

    /// Open a connection to `uri`
    async fn dial(&self, uri: &str) -> Result<Self::Connection, BrokerError>;

    /// Open a session (AMQP channel) on `connection`
    async fn open_session(
        &self,
        connection: &Self::Connection,
    ) -> Result<Self::Session, BrokerError>;

    /// Apply prefetch limits to `session`
    async fn apply_qos(&self, session: &Self::Session, qos: &QosPolicy)
    -> Result<(), BrokerError>;

    /// Resolve once `connection` closes. `Some` carries the failure for an
    /// unexpected loss, `None` means the connection was closed deliberately.
    async fn closed(&self, connection: &Self::Connection) -> Option<BrokerError>;
}

/// Application hook that declares the queues it needs on a fresh session.
/// Called at startup and again after every reconnect.
#[async_trait]
pub trait QueueDeclarer<B: Broker>: Send + Sync + 'static {
    async fn declare_queues(&self, session: &B::Session) -> Result<QueueSet<B::Queue>, BoxError>;
}

/// Connection, session and declared queues, installed and replaced as a unit
pub struct BrokerLink<B: Broker> {
    pub connection: B::Connection,
    pub session: B::Session,
    pub queues: QueueSet<B::Queue>,
}

impl<B: Broker> BrokerLink<B> {
    pub fn queue(&self, name: &str) -> Option<&B::Queue> {
        self.queues.get(name)
    }

    /// Declared queue names in sorted order
    pub fn queue_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<B: Broker> std::fmt::Debug for BrokerLink<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink")
            .field("queues", &self.queue_names())
            .finish_non_exhaustive()
    }
}
