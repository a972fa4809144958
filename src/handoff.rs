//! Unbuffered rendezvous between two tasks
//!
//! `send` completes only after the receiving side has taken the value, so the
//! sender cannot run ahead of the receiver. Tokio has no zero-capacity channel;
//! each value travels with a oneshot that the receiver completes on receipt.

use tokio::sync::{mpsc, oneshot};

/// Error returned when the other side of a handoff has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handoff peer dropped")]
pub struct HandoffClosed;

/// Create a connected sender/receiver pair
pub fn handoff<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (HandoffSender { tx }, HandoffReceiver { rx })
}

#[derive(Debug)]
pub struct HandoffSender<T> {
    tx: mpsc::Sender<(T, oneshot::Sender<()>)>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> HandoffSender<T> {
    /// Deliver `value`, waiting until the receiver has picked it up
    pub async fn send(&self, value: T) -> Result<(), HandoffClosed> {
        let (taken_tx, taken_rx) = oneshot::channel();
        self.tx
            .send((value, taken_tx))
            .await
            .map_err(|_| HandoffClosed)?;
        taken_rx.await.map_err(|_| HandoffClosed)
    }
}

#[derive(Debug)]
pub struct HandoffReceiver<T> {
    rx: mpsc::Receiver<(T, oneshot::Sender<()>)>,
}

impl<T> HandoffReceiver<T> {
    /// Wait for the next value. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        let (value, taken) = self.rx.recv().await?;
        let _ = taken.send(());
        Some(value)
    }
}
