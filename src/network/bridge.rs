//! Core Process Bridge
//!
//! The only way a session talks to the outside world: it sends requests to
//! the local match process and receives its state indications and the
//! payloads it relays from the opposing peer.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::protocol::{CoreState, FromCore, ToCore};

/// Bridge failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The core process side is gone.
    #[error("core process channel closed")]
    Closed,
}

/// Connection to the local match process.
#[async_trait]
pub trait CoreBridge: Send {
    /// Send a request to the core.
    async fn send(&mut self, msg: ToCore) -> Result<(), BridgeError>;

    /// Next message from the core, or `None` once its stream has ended.
    ///
    /// Must be cancel safe: dropping the future loses no message.
    async fn receive(&mut self) -> Option<FromCore>;

    /// Ask the core to terminate and stop delivering messages.
    fn cancel(&mut self);
}

/// In-process bridge over tokio channels.
pub struct ChannelBridge {
    tx: mpsc::Sender<ToCore>,
    rx: mpsc::Receiver<FromCore>,
}

/// Core-process end of a [`ChannelBridge`].
pub struct CoreEndpoint {
    /// Requests from the session.
    pub requests: mpsc::Receiver<ToCore>,
    /// Messages to the session. Dropping it ends the session's stream.
    pub events: CoreEvents,
}

/// What the core reports to its session.
#[derive(Debug, Clone)]
pub struct CoreEvents(mpsc::Sender<FromCore>);

impl CoreEvents {
    /// Report a lifecycle state.
    pub async fn indicate(&self, state: CoreState) -> Result<(), BridgeError> {
        self.0
            .send(FromCore::StateIndication(state))
            .await
            .map_err(|_| BridgeError::Closed)
    }

    /// Deliver a payload relayed from the opposing peer.
    pub async fn deliver(&self, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.0
            .send(FromCore::Smuggled(payload))
            .await
            .map_err(|_| BridgeError::Closed)
    }
}

/// Create a connected bridge and core endpoint.
pub fn channel_bridge(capacity: usize) -> (ChannelBridge, CoreEndpoint) {
    let (to_core_tx, to_core_rx) = mpsc::channel(capacity);
    let (from_core_tx, from_core_rx) = mpsc::channel(capacity);
    (
        ChannelBridge {
            tx: to_core_tx,
            rx: from_core_rx,
        },
        CoreEndpoint {
            requests: to_core_rx,
            events: CoreEvents(from_core_tx),
        },
    )
}

#[async_trait]
impl CoreBridge for ChannelBridge {
    async fn send(&mut self, msg: ToCore) -> Result<(), BridgeError> {
        self.tx.send(msg).await.map_err(|_| BridgeError::Closed)
    }

    async fn receive(&mut self) -> Option<FromCore> {
        self.rx.recv().await
    }

    fn cancel(&mut self) {
        if self.tx.try_send(ToCore::Stop).is_err() {
            debug!("core already gone or backed up when stopping");
        }
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (mut bridge, mut core) = channel_bridge(4);

        bridge.send(ToCore::Smuggle(vec![1, 2, 3])).await.unwrap();
        assert_eq!(core.requests.recv().await, Some(ToCore::Smuggle(vec![1, 2, 3])));

        core.events.indicate(CoreState::Connecting).await.unwrap();
        core.events.deliver(vec![9]).await.unwrap();
        assert_eq!(
            bridge.receive().await,
            Some(FromCore::StateIndication(CoreState::Connecting))
        );
        assert_eq!(bridge.receive().await, Some(FromCore::Smuggled(vec![9])));
    }

    #[tokio::test]
    async fn test_dropping_core_ends_stream() {
        let (mut bridge, core) = channel_bridge(4);
        drop(core);
        assert_eq!(bridge.receive().await, None);
        assert_eq!(bridge.send(ToCore::Stop).await, Err(BridgeError::Closed));
    }

    #[tokio::test]
    async fn test_cancel_sends_stop_and_closes() {
        let (mut bridge, mut core) = channel_bridge(4);
        bridge.cancel();
        assert_eq!(core.requests.recv().await, Some(ToCore::Stop));
        assert_eq!(
            core.events.indicate(CoreState::Running).await,
            Err(BridgeError::Closed)
        );
        assert_eq!(bridge.receive().await, None);
    }
}
