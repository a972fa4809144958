//! AMQP 0-9-1 backend built on lapin
//!
//! lapin reports connection failures through a callback. Each connection
//! forwards that callback into a watch channel so the supervisor can await
//! closure like any other future.

use super::{Broker, BrokerError};
use crate::qos::QosPolicy;
use async_trait::async_trait;
use lapin::options::BasicQosOptions;
use lapin::{Channel, Connection, ConnectionProperties, Queue};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

/// Lifecycle of a single AMQP connection as seen by the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Open,
    /// Closed on request
    Closed,
    /// Lost with an error
    Failed(String),
}

/// lapin connection plus its closure notifier
pub struct AmqpConnection {
    inner: Connection,
    state_tx: Arc<watch::Sender<LinkState>>,
}

impl AmqpConnection {
    pub fn inner(&self) -> &Connection {
        &self.inner
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    /// Close the connection deliberately. The supervisor treats this as a
    /// clean shutdown and stops monitoring instead of reconnecting.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.state_tx.send_replace(LinkState::Closed);
        self.inner
            .close(200, "closed by application")
            .await
            .map_err(|e| BrokerError::ConnectionFailed(Box::new(e)))
    }
}

/// lapin-backed [`Broker`]
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker {
    connection_name: Option<String>,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the broker's management UI
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

/// Check that `uri` is an AMQP URI before handing it to lapin
pub fn validate_amqp_uri(uri: &str) -> Result<Url, BrokerError> {
    let url = Url::parse(uri)
        .map_err(|_| BrokerError::InvalidUri(crate::error::sanitize_error_message(uri)))?;

    match url.scheme() {
        "amqp" | "amqps" if url.host_str().is_some() => Ok(url),
        _ => Err(BrokerError::InvalidUri(
            crate::error::sanitize_error_message(uri),
        )),
    }
}

/// Translate a policy into lapin's `basic.qos` arguments (pure function).
/// lapin carries the prefetch count as u16 and has no prefetch size field.
pub fn qos_arguments(qos: &QosPolicy) -> Result<(u16, BasicQosOptions), BrokerError> {
    if qos.prefetch_size != 0 {
        return Err(BrokerError::QosRejected(format!(
            "prefetch_size {} is not supported, only 0 (unlimited) is accepted",
            qos.prefetch_size
        )));
    }

    let count = u16::try_from(qos.prefetch_count).map_err(|_| {
        BrokerError::QosRejected(format!(
            "prefetch_count {} exceeds the maximum of {}",
            qos.prefetch_count,
            u16::MAX
        ))
    })?;

    Ok((count, BasicQosOptions { global: qos.global }))
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;
    type Session = Channel;
    type Queue = Queue;

    async fn dial(&self, uri: &str) -> Result<AmqpConnection, BrokerError> {
        validate_amqp_uri(uri)?;

        let inner = Connection::connect(uri, self.properties())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(Box::new(e)))?;

        let (state_tx, _) = watch::channel(LinkState::Open);
        let state_tx = Arc::new(state_tx);
        let notifier = state_tx.clone();
        inner.on_error(move |err| {
            notifier.send_replace(LinkState::Failed(err.to_string()));
        });

        Ok(AmqpConnection { inner, state_tx })
    }

    async fn open_session(&self, connection: &AmqpConnection) -> Result<Channel, BrokerError> {
        connection
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::SessionFailed(Box::new(e)))
    }

    async fn apply_qos(&self, session: &Channel, qos: &QosPolicy) -> Result<(), BrokerError> {
        let (count, options) = qos_arguments(qos)?;
        debug!(prefetch_count = count, global = options.global, "Applying QoS");
        session
            .basic_qos(count, options)
            .await
            .map_err(|e| BrokerError::QosRejected(e.to_string()))
    }

    async fn closed(&self, connection: &AmqpConnection) -> Option<BrokerError> {
        let mut state_rx = connection.state_tx.subscribe();
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                LinkState::Open => {}
                LinkState::Closed => return None,
                LinkState::Failed(reason) => return Some(BrokerError::Closed(reason)),
            }
            if state_rx.changed().await.is_err() {
                return Some(BrokerError::Closed("close notifier dropped".to_string()));
            }
        }
    }
}
