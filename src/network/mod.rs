//! Network layer.
//!
//! Wire messages for the peer-to-peer lobby protocol and the bridge to the
//! local core process that relays them.

pub mod bridge;
pub mod loopback;
pub mod protocol;

pub use bridge::{channel_bridge, BridgeError, ChannelBridge, CoreBridge, CoreEndpoint, CoreEvents};
pub use loopback::{spawn_loopback, RelayOptions, RelayReport, RelaySide, TamperFn};
pub use protocol::{
    CoreState, FromCore, LobbyMessage, MessageKind, NegotiatedStart, StartRequest, ToCore,
    MAX_MESSAGE_SIZE,
};
