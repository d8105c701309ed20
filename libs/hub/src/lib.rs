//! Orchestrator for the bridge engine.
//!
//! The [`Hub`] owns canonical session and message identity, fans operations
//! out to every configured bridge, suppresses echo back to the platform an
//! operator typed on, and pushes widget-facing events to registered sinks.

mod broadcast;
mod bus;
mod hub;
mod requests;

pub use broadcast::{SessionBroadcaster, SinkId, WidgetSink};
pub use bus::{EventBus, EventHandler, HandlerId, WILDCARD};
pub use hub::{BridgeDispatch, Hub, HubConfig};
pub use requests::{
    ConnectRequest, ConnectResponse, OperatorMessageRecord, SendMessageRequest,
};
