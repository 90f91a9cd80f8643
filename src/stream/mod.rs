//! Resilient transcript streaming
//!
//! One reconnecting duplex connection per session, hidden behind the
//! `StreamConnectionManager`: tagged-union message dispatch, heartbeat
//! liveness, exponential-backoff reconnect, and id'd listener multiplexing.

pub mod manager;
pub mod messages;
pub mod transport;

pub use manager::{
    reconnect_delay, ListenerId, StreamConfig, StreamConnectionManager, StreamError,
};
pub use messages::{ControlFrame, StreamEvent, StreamMessage};
pub use transport::{
    StreamConnector, StreamTransport, TransportEvent, WsStreamConnector, NORMAL_CLOSE_CODE,
};
