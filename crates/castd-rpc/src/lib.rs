//! Bus protocol definitions and client for castd.
//!
//! This crate provides the message types, transport codec, and client-side
//! connection for the castd control bus: a name-addressed JSON message
//! transport carrying method calls to encoder workers and pub/sub
//! notifications back from them.
//!
//! # Architecture
//!
//! - [`protocol`]: message envelope types (Request, Response, Notification),
//!   match rules, and the well-known encoder interface constants
//! - [`transport`]: length-prefixed codec for message framing
//! - [`client`]: the [`BusConnection`] used by controllers
//! - [`error`]: unified error type and `Result` alias
//!
//! # Example
//!
//! ```no_run
//! use castd_rpc::{BusConnection, MatchRule, bus_socket_path};
//! use castd_rpc::protocol::METHOD_START;
//!
//! # async fn example() -> castd_rpc::Result<()> {
//! let conn = BusConnection::open(bus_socket_path()).await?;
//! let mut states = conn
//!     .subscribe(MatchRule::properties_changed("worker.1"))
//!     .await?;
//! conn.call("worker.1", METHOD_START, None).await?;
//! if let Some(n) = states.recv().await {
//!     println!("worker reported: {:?}", n.params);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export main client types
pub use client::{BusConnection, Subscription, bus_socket_path};

// Re-export error types
pub use error::{Error, Result};

// Re-export protocol types
pub use protocol::{
    BUS_SENDER, ENCODER_INTERFACE, ENCODER_PATH, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    JSONRPC_VERSION, MEMBER_PRESENCE_CHANGED, MEMBER_PROPERTIES_CHANGED, METHOD_ADD_MATCH,
    METHOD_CONFIGURE, METHOD_NOT_FOUND, METHOD_PAUSE, METHOD_START, METHOD_STOP, MatchRule,
    Message, NO_PEER, Notification, PARSE_ERROR, PROP_STATE, PresenceChanged, PropertiesChanged,
    Request, RequestId, Response, RpcError,
};

// Re-export transport types
pub use transport::{BusCodec, CodecError};

// Re-export commonly used data types from castd-types
pub use castd_types::{ConfigEntry, ConfigureParams, DisplayRect, EncoderState, SessionParams};
