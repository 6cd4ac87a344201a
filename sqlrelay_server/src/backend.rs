//! The seam towards concrete database drivers.
//!
//! The proxy never links a real driver; everything it needs from the
//! back-end is expressed through these traits, and a provider implementation
//! is registered at server start. The in-memory [`mock`] provider backs the
//! test suite.

pub mod mock;

use async_trait::async_trait;
use sqlrelay_impl::{LobKind, RelayResult, RelayValue, ResultSetMetadata, Xid};
use std::collections::HashMap;

/// Outcome of a statement execution on the back-end.
#[derive(Debug)]
pub enum BackendExecution {
    /// Update counts, one per executed statement.
    Updated(Vec<i64>),
    /// An open server-side cursor.
    Query {
        cursor_id: u64,
        metadata: ResultSetMetadata,
    },
}

/// Factory for physical back-end connections.
#[async_trait]
pub trait BackendProvider: Send + Sync + std::fmt::Debug {
    /// Opens a physical connection to the database behind `url`.
    async fn open(
        &self,
        url: &str,
        user: &str,
        password: &str,
        properties: &HashMap<String, String>,
    ) -> RelayResult<Box<dyn BackendConnection>>;

    /// Opens a connection that is enlisted for distributed transactions.
    ///
    /// The returned connection must answer `xa_resource()` with `Some`.
    async fn open_xa(
        &self,
        url: &str,
        user: &str,
        password: &str,
        properties: &HashMap<String, String>,
    ) -> RelayResult<Box<dyn BackendConnection>>;
}

/// One physical connection to a back-end database.
///
/// Not thread-safe by contract; the owning session serializes access.
#[async_trait]
pub trait BackendConnection: Send + std::fmt::Debug {
    /// Cheap liveness probe, used for pool validation.
    async fn ping(&mut self) -> RelayResult<()>;

    async fn execute(&mut self, sql: &str, params: &[RelayValue])
        -> RelayResult<BackendExecution>;

    async fn prepare(&mut self, sql: &str) -> RelayResult<PreparedHandle>;

    async fn execute_prepared(
        &mut self,
        stmt_id: u64,
        params: &[RelayValue],
    ) -> RelayResult<BackendExecution>;

    async fn drop_statement(&mut self, stmt_id: u64) -> RelayResult<()>;

    /// Fetches up to `n` rows; the bool is true when the cursor is exhausted.
    ///
    /// Columns typed `Blob`/`Clob` in the metadata carry their back-end LOB
    /// locator as a `BigInt` value; the dispatcher wraps locators into
    /// session handles before rows reach the wire.
    async fn fetch(&mut self, cursor_id: u64, n: u32) -> RelayResult<(Vec<Vec<RelayValue>>, bool)>;

    async fn close_cursor(&mut self, cursor_id: u64) -> RelayResult<()>;

    /// A handle through which a statement running on this connection can be
    /// interrupted from another task, in the manner of an out-of-band cancel
    /// request. `None` when the back-end has no such facility.
    fn cancel_handle(&self) -> Option<Box<dyn BackendCancel>> {
        None
    }

    async fn commit(&mut self) -> RelayResult<()>;
    async fn rollback(&mut self) -> RelayResult<()>;
    async fn set_auto_commit(&mut self, auto_commit: bool) -> RelayResult<()>;
    async fn set_transaction_isolation(&mut self, level: i32) -> RelayResult<()>;
    async fn transaction_isolation(&mut self) -> RelayResult<i32>;
    async fn set_read_only(&mut self, read_only: bool) -> RelayResult<()>;

    async fn set_savepoint(&mut self, name: &str) -> RelayResult<()>;
    async fn release_savepoint(&mut self, name: &str) -> RelayResult<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> RelayResult<()>;

    /// Creates an empty LOB and returns its locator.
    async fn create_lob(&mut self, kind: LobKind) -> RelayResult<u64>;
    async fn write_lob(&mut self, locator: u64, position: u64, data: &[u8]) -> RelayResult<()>;
    /// Reads up to `length` bytes; the bool is true at end of LOB.
    async fn read_lob(
        &mut self,
        locator: u64,
        offset: u64,
        length: u32,
    ) -> RelayResult<(Vec<u8>, bool)>;
    /// The total length, where the back-end knows it.
    async fn lob_length(&mut self, locator: u64) -> RelayResult<Option<u64>>;
    async fn free_lob(&mut self, locator: u64) -> RelayResult<()>;

    /// Whether open LOB locators become unusable when a cursor advances.
    /// Decides the row-by-row streaming mode; probed once per datasource.
    fn lobs_invalidated_on_advance(&self) -> bool {
        false
    }

    /// The XA face of this connection, for connections opened via `open_xa`.
    fn xa_resource(&mut self) -> Option<&mut dyn XaResource> {
        None
    }

    async fn close(&mut self) -> RelayResult<()>;
}

/// A prepared statement on the back-end.
#[derive(Clone, Copy, Debug)]
pub struct PreparedHandle {
    pub stmt_id: u64,
    pub param_count: u16,
}

/// Best-effort, out-of-band cancellation of a running statement.
#[async_trait]
pub trait BackendCancel: Send + Sync + std::fmt::Debug {
    async fn cancel(&self) -> RelayResult<()>;
}

/// The XA verbs of an enlisted back-end connection.
#[async_trait]
pub trait XaResource: Send + std::fmt::Debug {
    async fn start(&mut self, xid: &Xid, flags: u32) -> RelayResult<()>;
    async fn end(&mut self, xid: &Xid, flags: u32) -> RelayResult<()>;
    /// Returns the prepare vote (`XA_OK` = 0, `XA_RDONLY` = 3).
    async fn prepare(&mut self, xid: &Xid) -> RelayResult<i32>;
    async fn commit(&mut self, xid: &Xid, one_phase: bool) -> RelayResult<()>;
    async fn rollback(&mut self, xid: &Xid) -> RelayResult<()>;
    async fn forget(&mut self, xid: &Xid) -> RelayResult<()>;
    async fn recover(&mut self, flags: u32) -> RelayResult<Vec<Xid>>;
}
