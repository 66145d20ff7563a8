//! APF tunnel protocol engine and CIRA transport.
//!
//! Decodes and encodes the APF binary wire format, answers the connection
//! level handshake (service requests, protocol version, user auth, global
//! requests, keep-alives), and multiplexes HTTP exchanges over virtual
//! channels with sliding-window flow control on a single persistent
//! connection.

pub mod channel;
pub mod config;
pub mod connection;
pub mod framing;
pub mod guid;
pub mod handler;
pub mod messages;
pub mod processor;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use channel::{
    Channel, ChannelError, ChannelManager, ChannelMode, ChannelState, ChannelStore, CiraChannel,
    FlowWindow, ReceiveWindow,
};
pub use config::{ConfigError, TunnelConfig, MAX_CIRA_CHANNELS};
pub use connection::Connection;
pub use framing::{ApfCodec, CodecError};
pub use guid::{guid_from_wire, guid_to_wire};
pub use handler::{AuthResponse, Handler, HandlerError, NoopHandler, ProtocolVersionInfo};
pub use messages::{DecodeError, MessageType};
pub use processor::{ProcessOutcome, Processor};
pub use session::Session;
pub use transport::{CiraTransport, TransportError};
pub use tunnel::{Tunnel, TunnelError};
