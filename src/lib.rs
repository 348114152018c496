//! SimCommander client library
//!
//! Async client for a simulator automation server reached through a host
//! process. The client manages two connection layers (the host link and the
//! server session on top of it), correlates requests with responses, and
//! routes unsolicited data and log frames to registered handlers.
//!
//! - `client` - the [`SimClient`] facade
//! - `correlation` - token-keyed table of pending requests
//! - `subscriptions` - registry of standing data requests
//! - `dispatch` - routing of inbound frames
//! - `ipc` - framing, links and connectors
//! - `protocol` - commands and frames on the wire
//! - `models` - shared data types
//!
//! ```ignore
//! use simcommander::{ClientConfig, SimClient};
//!
//! let client = SimClient::new(ClientConfig::from_env()?);
//! if client.ping_server().await.is_none() {
//!     eprintln!("server not running");
//! }
//! client.connect_server().await?;
//! ```

pub mod client;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod models;
pub mod protocol;
pub mod subscriptions;

pub use client::SimClient;
pub use config::{default_socket_path, ClientConfig, Endpoint, ServerLogLevel};
pub use dispatch::DispatchStatsSnapshot;
pub use error::ClientError;
pub use models::{
    CalcResultType, ClientEvent, ClientEventType, ClientStatus, ConnectionState, DataRequest,
    DataRequestRecord, DataValue, ListOutcome, ListResult, LogFacility, LogLevel, LogRecord,
    LogSource, LookupItemType, RegisteredEvent, RequestType, UpdatePeriod, ValueType,
    VariableRequest, VariableValue, Version, CLIENT_VERSION,
};
pub use protocol::{Command, CommandId, Frame, KEY_EVENT_VALUES};
