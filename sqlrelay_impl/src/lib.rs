//! Do not use this crate directly.
//!
//! This is the implementation crate for `sqlrelay` and `sqlrelay_server`.
//!
//! If you need the client driver, use `sqlrelay`.
//!
//! If you need the proxy server, use `sqlrelay_server`.

#![deny(missing_debug_implementations)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

mod conn;
mod fingerprint;
mod relay_error;
mod row;
mod rows;
pub mod protocol;
pub mod url;
mod value;

pub use crate::conn::{
    placeholder, validate_backend_url, ConnectParams, ConnectParamsBuilder, IntoConnectParams,
    IntoConnectParamsBuilder,
};
pub use crate::fingerprint::{connection_hash, sql_fingerprint};
pub use crate::relay_error::{ErrorKind, RelayError, RelayResult};
pub use crate::row::Row;
pub use crate::rows::Rows;
pub use crate::value::{RelayValue, TypeId};

pub use crate::protocol::parts::{
    xa_flags, CallMethod, CallReply, CallRequest, CallStep, CallValue, ClientInfo, ConnectRequest,
    EndpointAddr, ExecutionResult, FieldMetadata, LobKind, ResourceKind, ResourceRef,
    ResultSetMetadata, ServerError, SessionInfo, SessionOptions, Severity, Topology, XatOptions,
    Xid,
};

/// Default number of result-set rows that are delivered with a single block.
///
/// The value used at runtime can be changed per session.
pub const DEFAULT_ROWS_PER_BLOCK: u32 = 100;

/// Default number of bytes of a large object that are transferred in a single
/// READ LOB or WRITE LOB block.
///
/// The value used at runtime can be changed per session, but is always capped
/// by the server's configured maximum.
pub const DEFAULT_LOB_BLOCK_SIZE: u32 = 1_048_576;

/// Hard upper bound for a single LOB block on the wire.
pub const MAX_LOB_BLOCK_SIZE: u32 = 16_000_000;

/// Datasource name that is used when the connection URL does not name one.
pub const DEFAULT_DATASOURCE: &str = "default";
