//! Real-time streaming: typed envelopes and the connection broker

pub mod broker;
pub mod message;

pub use broker::{ChannelKind, ConnectionState, ConnectionStream, StreamBroker, Subscription};
pub use message::StreamMessage;
