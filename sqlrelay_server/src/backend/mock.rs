//! An in-memory back-end used by the test suite.
//!
//! The mock interprets a miniature command language instead of SQL:
//!
//! ```text
//! select <n> rows [wait <ms>] [with lobs]
//! update <n> [wait <ms>]
//! raise <code> <sqlstate>
//! ```
//!
//! `with lobs` adds a BLOB column whose locators point at per-connection
//! in-memory byte buffers. `wait` keeps the statement running, which the
//! pool-exhaustion and segregation tests rely on.

use crate::backend::{
    BackendCancel, BackendConnection, BackendExecution, BackendProvider, PreparedHandle,
    XaResource,
};
use async_trait::async_trait;
use sqlrelay_impl::{
    FieldMetadata, LobKind, RelayError, RelayResult, RelayValue, ResultSetMetadata, ServerError,
    TypeId, Xid,
};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
};

/// State shared by every connection a [`MockProvider`] opens.
#[derive(Debug, Default)]
pub struct MockState {
    /// Every executed command, in back-end arrival order.
    journal: Mutex<Vec<String>>,
    /// Prepared or active XA branches, shared across connections.
    xa_branches: Mutex<HashMap<Xid, XaBranchState>>,
    opened: AtomicU32,
    closed: AtomicU32,
    fail_pings: AtomicBool,
    lobs_invalidated_on_advance: AtomicBool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum XaBranchState {
    Active,
    Ended,
    Prepared,
}

impl MockState {
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    pub fn opened(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Lets every subsequent validation probe fail.
    pub fn set_fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Makes connections report that cursor moves invalidate LOB locators,
    /// which switches result sets with LOB columns to row-by-row streaming.
    pub fn set_lobs_invalidated_on_advance(&self, invalidated: bool) {
        self.lobs_invalidated_on_advance
            .store(invalidated, Ordering::SeqCst);
    }
}

/// The [`BackendProvider`](crate::backend::BackendProvider) used in tests.
#[derive(Clone, Debug, Default)]
pub struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }

    fn open_connection(&self, is_xa: bool) -> Box<dyn BackendConnection> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(MockConnection {
            state: Arc::clone(&self.state),
            is_xa,
            auto_commit: true,
            isolation: 2,
            read_only: false,
            closed: false,
            next_id: AtomicU64::new(1),
            cursors: HashMap::new(),
            statements: HashMap::new(),
            lobs: HashMap::new(),
            savepoints: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[async_trait]
impl BackendProvider for MockProvider {
    async fn open(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
        _properties: &HashMap<String, String>,
    ) -> RelayResult<Box<dyn BackendConnection>> {
        debug!("MockProvider::open() for {url}");
        Ok(self.open_connection(false))
    }

    async fn open_xa(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
        _properties: &HashMap<String, String>,
    ) -> RelayResult<Box<dyn BackendConnection>> {
        debug!("MockProvider::open_xa() for {url}");
        Ok(self.open_connection(true))
    }
}

#[derive(Debug)]
struct MockCursor {
    produced: i64,
    total: i64,
    with_lobs: bool,
}

#[derive(Debug)]
struct MockConnection {
    state: Arc<MockState>,
    is_xa: bool,
    auto_commit: bool,
    isolation: i32,
    read_only: bool,
    closed: bool,
    next_id: AtomicU64,
    cursors: HashMap<u64, MockCursor>,
    statements: HashMap<u64, String>,
    lobs: HashMap<u64, Vec<u8>>,
    savepoints: Vec<String>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug)]
enum Command {
    Select { rows: i64, with_lobs: bool },
    Update { rows: i64 },
    Raise { code: i32, sqlstate: String },
}

fn syntax_error(sql: &str) -> RelayError {
    RelayError::Backend {
        source: ServerError::backend(942, b"42000", format!("Cannot interpret \"{sql}\"")),
    }
}

/// Parses the mock command language; returns the command and the wait time.
fn parse_command(sql: &str) -> RelayResult<(Command, u64)> {
    let tokens: Vec<&str> = sql.split_whitespace().collect();
    let mut wait_ms = 0_u64;
    let mut with_lobs = false;
    let mut i = 0;
    let mut command = None;
    while i < tokens.len() {
        match tokens[i] {
            "select" => {
                let rows: i64 = tokens
                    .get(i + 1)
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| syntax_error(sql))?;
                if tokens.get(i + 2) != Some(&"rows") {
                    return Err(syntax_error(sql));
                }
                command = Some(Command::Select { rows, with_lobs });
                i += 3;
            }
            "update" => {
                let rows: i64 = tokens
                    .get(i + 1)
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| syntax_error(sql))?;
                command = Some(Command::Update { rows });
                i += 2;
            }
            "raise" => {
                let code: i32 = tokens
                    .get(i + 1)
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| syntax_error(sql))?;
                let sqlstate = (*tokens.get(i + 2).ok_or_else(|| syntax_error(sql))?).to_string();
                command = Some(Command::Raise { code, sqlstate });
                i += 3;
            }
            "wait" => {
                wait_ms = tokens
                    .get(i + 1)
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| syntax_error(sql))?;
                i += 2;
            }
            "with" => {
                if tokens.get(i + 1) != Some(&"lobs") {
                    return Err(syntax_error(sql));
                }
                with_lobs = true;
                if let Some(Command::Select {
                    with_lobs: ref mut wl,
                    ..
                }) = command
                {
                    *wl = true;
                }
                i += 2;
            }
            _ => return Err(syntax_error(sql)),
        }
    }
    command.map(|c| (c, wait_ms)).ok_or_else(|| syntax_error(sql))
}

impl MockConnection {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check_open(&self) -> RelayResult<()> {
        if self.closed {
            Err(RelayError::Backend {
                source: ServerError::backend(-1, b"08003", "Connection is closed".to_string()),
            })
        } else {
            Ok(())
        }
    }

    async fn interruptible_wait(&self, wait_ms: u64) -> RelayResult<()> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(wait_ms);
        while tokio::time::Instant::now() < deadline {
            if self.cancelled.load(Ordering::SeqCst) {
                self.cancelled.store(false, Ordering::SeqCst);
                return Err(RelayError::Cancelled);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        Ok(())
    }

    fn metadata(with_lobs: bool) -> ResultSetMetadata {
        let mut fields = vec![
            FieldMetadata::new("ID".to_string(), TypeId::Int, false),
            FieldMetadata::new("NAME".to_string(), TypeId::Varchar, true),
        ];
        if with_lobs {
            fields.push(FieldMetadata::new("DATA".to_string(), TypeId::Blob, true));
        }
        ResultSetMetadata::new(fields)
    }

    fn run_command(&mut self, sql: &str, command: Command) -> RelayResult<BackendExecution> {
        if let Ok(mut journal) = self.state.journal.lock() {
            journal.push(sql.to_string());
        }
        match command {
            Command::Select { rows, with_lobs } => {
                let cursor_id = self.next_id();
                self.cursors.insert(
                    cursor_id,
                    MockCursor {
                        produced: 0,
                        total: rows,
                        with_lobs,
                    },
                );
                Ok(BackendExecution::Query {
                    cursor_id,
                    metadata: Self::metadata(with_lobs),
                })
            }
            Command::Update { rows } => Ok(BackendExecution::Updated(vec![rows])),
            Command::Raise { code, sqlstate } => Err(RelayError::Backend {
                source: ServerError::backend(
                    code,
                    sqlstate.as_bytes(),
                    format!("Raised error {code}"),
                ),
            }),
        }
    }
}

#[async_trait]
impl BackendConnection for MockConnection {
    async fn ping(&mut self) -> RelayResult<()> {
        self.check_open()?;
        if self.state.fail_pings.load(Ordering::SeqCst) {
            Err(RelayError::Backend {
                source: ServerError::backend(-1, b"08006", "Ping failed".to_string()),
            })
        } else {
            Ok(())
        }
    }

    async fn execute(
        &mut self,
        sql: &str,
        _params: &[RelayValue],
    ) -> RelayResult<BackendExecution> {
        self.check_open()?;
        let (command, wait_ms) = parse_command(sql)?;
        if wait_ms > 0 {
            self.interruptible_wait(wait_ms).await?;
        }
        self.run_command(sql, command)
    }

    async fn prepare(&mut self, sql: &str) -> RelayResult<PreparedHandle> {
        self.check_open()?;
        parse_command(sql)?; // reject bad statements at prepare time
        let stmt_id = self.next_id();
        self.statements.insert(stmt_id, sql.to_string());
        #[allow(clippy::cast_possible_truncation)]
        Ok(PreparedHandle {
            stmt_id,
            param_count: sql.matches('?').count() as u16,
        })
    }

    async fn execute_prepared(
        &mut self,
        stmt_id: u64,
        params: &[RelayValue],
    ) -> RelayResult<BackendExecution> {
        self.check_open()?;
        let sql = self
            .statements
            .get(&stmt_id)
            .cloned()
            .ok_or(RelayError::Usage("Unknown prepared statement"))?;
        self.execute(&sql, params).await
    }

    async fn drop_statement(&mut self, stmt_id: u64) -> RelayResult<()> {
        self.statements.remove(&stmt_id);
        Ok(())
    }

    async fn fetch(&mut self, cursor_id: u64, n: u32) -> RelayResult<(Vec<Vec<RelayValue>>, bool)> {
        self.check_open()?;
        let cursor = self
            .cursors
            .get_mut(&cursor_id)
            .ok_or(RelayError::Usage("Unknown cursor"))?;
        let mut rows = Vec::new();
        let mut new_lobs = Vec::new();
        while cursor.produced < cursor.total && rows.len() < n as usize {
            let i = cursor.produced;
            #[allow(clippy::cast_possible_truncation)]
            let id_value = RelayValue::Int(i as i32);
            let mut row = vec![id_value, RelayValue::Varchar(format!("row-{i}"))];
            if cursor.with_lobs {
                new_lobs.push(i);
                row.push(RelayValue::BigInt(0)); // locator patched below
            }
            rows.push(row);
            cursor.produced += 1;
        }
        let exhausted = cursor.produced >= cursor.total;
        let with_lobs = cursor.with_lobs;
        if with_lobs {
            // allocate the row LOBs after the borrow of the cursor ends
            for (row, i) in rows.iter_mut().zip(new_lobs) {
                let locator = self.next_id();
                self.lobs
                    .insert(locator, format!("lob-content-{i}").into_bytes());
                if let Some(last) = row.last_mut() {
                    #[allow(clippy::cast_possible_wrap)]
                    let value = RelayValue::BigInt(locator as i64);
                    *last = value;
                }
            }
        }
        if exhausted {
            self.cursors.remove(&cursor_id);
        }
        Ok((rows, exhausted))
    }

    async fn close_cursor(&mut self, cursor_id: u64) -> RelayResult<()> {
        self.cursors.remove(&cursor_id);
        Ok(())
    }

    fn cancel_handle(&self) -> Option<Box<dyn BackendCancel>> {
        Some(Box::new(MockCancel {
            cancelled: Arc::clone(&self.cancelled),
        }))
    }

    async fn commit(&mut self) -> RelayResult<()> {
        self.check_open()?;
        if let Ok(mut journal) = self.state.journal.lock() {
            journal.push("commit".to_string());
        }
        Ok(())
    }

    async fn rollback(&mut self) -> RelayResult<()> {
        self.check_open()?;
        if let Ok(mut journal) = self.state.journal.lock() {
            journal.push("rollback".to_string());
        }
        Ok(())
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> RelayResult<()> {
        self.auto_commit = auto_commit;
        Ok(())
    }

    async fn set_transaction_isolation(&mut self, level: i32) -> RelayResult<()> {
        self.isolation = level;
        Ok(())
    }

    async fn transaction_isolation(&mut self) -> RelayResult<i32> {
        Ok(self.isolation)
    }

    async fn set_read_only(&mut self, read_only: bool) -> RelayResult<()> {
        self.read_only = read_only;
        Ok(())
    }

    async fn set_savepoint(&mut self, name: &str) -> RelayResult<()> {
        self.savepoints.push(name.to_string());
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> RelayResult<()> {
        self.savepoints.retain(|s| s != name);
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> RelayResult<()> {
        if self.savepoints.contains(&name.to_string()) {
            Ok(())
        } else {
            Err(RelayError::Usage("Unknown savepoint"))
        }
    }

    async fn create_lob(&mut self, kind: LobKind) -> RelayResult<u64> {
        self.check_open()?;
        let locator = self.next_id();
        trace!("MockConnection: created {kind} with locator {locator}");
        self.lobs.insert(locator, Vec::new());
        Ok(locator)
    }

    async fn write_lob(&mut self, locator: u64, position: u64, data: &[u8]) -> RelayResult<()> {
        let lob = self
            .lobs
            .get_mut(&locator)
            .ok_or(RelayError::Usage("Unknown lob locator"))?;
        #[allow(clippy::cast_possible_truncation)]
        let position = position as usize;
        if lob.len() < position + data.len() {
            lob.resize(position + data.len(), 0);
        }
        lob[position..position + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn read_lob(
        &mut self,
        locator: u64,
        offset: u64,
        length: u32,
    ) -> RelayResult<(Vec<u8>, bool)> {
        let lob = self
            .lobs
            .get(&locator)
            .ok_or(RelayError::Usage("Unknown lob locator"))?;
        #[allow(clippy::cast_possible_truncation)]
        let offset = (offset as usize).min(lob.len());
        let end = (offset + length as usize).min(lob.len());
        Ok((lob[offset..end].to_vec(), end == lob.len()))
    }

    async fn lob_length(&mut self, locator: u64) -> RelayResult<Option<u64>> {
        Ok(self.lobs.get(&locator).map(|lob| lob.len() as u64))
    }

    async fn free_lob(&mut self, locator: u64) -> RelayResult<()> {
        self.lobs.remove(&locator);
        Ok(())
    }

    fn lobs_invalidated_on_advance(&self) -> bool {
        self.state.lobs_invalidated_on_advance.load(Ordering::SeqCst)
    }

    fn xa_resource(&mut self) -> Option<&mut dyn XaResource> {
        if self.is_xa {
            Some(self)
        } else {
            None
        }
    }

    async fn close(&mut self) -> RelayResult<()> {
        if !self.closed {
            self.closed = true;
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct MockCancel {
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl BackendCancel for MockCancel {
    async fn cancel(&self) -> RelayResult<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn xa_protocol(text: &str) -> RelayError {
    RelayError::XaProtocol(text.to_string())
}

#[async_trait]
impl XaResource for MockConnection {
    async fn start(&mut self, xid: &Xid, _flags: u32) -> RelayResult<()> {
        let mut branches = self.state.xa_branches.lock()?;
        if branches.contains_key(xid) {
            return Err(xa_protocol("xid already started"));
        }
        branches.insert(xid.clone(), XaBranchState::Active);
        Ok(())
    }

    async fn end(&mut self, xid: &Xid, _flags: u32) -> RelayResult<()> {
        let mut branches = self.state.xa_branches.lock()?;
        match branches.get(xid) {
            Some(XaBranchState::Active) => {
                branches.insert(xid.clone(), XaBranchState::Ended);
                Ok(())
            }
            _ => Err(xa_protocol("end without active xid")),
        }
    }

    async fn prepare(&mut self, xid: &Xid) -> RelayResult<i32> {
        let mut branches = self.state.xa_branches.lock()?;
        match branches.get(xid) {
            Some(XaBranchState::Ended) => {
                branches.insert(xid.clone(), XaBranchState::Prepared);
                Ok(0) // XA_OK
            }
            _ => Err(xa_protocol("prepare without ended xid")),
        }
    }

    async fn commit(&mut self, xid: &Xid, one_phase: bool) -> RelayResult<()> {
        let mut branches = self.state.xa_branches.lock()?;
        match branches.get(xid) {
            Some(XaBranchState::Prepared) if !one_phase => {
                branches.remove(xid);
                Ok(())
            }
            Some(XaBranchState::Ended) if one_phase => {
                branches.remove(xid);
                Ok(())
            }
            _ => Err(xa_protocol("commit in illegal branch state")),
        }
    }

    async fn rollback(&mut self, xid: &Xid) -> RelayResult<()> {
        let mut branches = self.state.xa_branches.lock()?;
        branches
            .remove(xid)
            .map(|_| ())
            .ok_or_else(|| xa_protocol("rollback of unknown xid"))
    }

    async fn forget(&mut self, xid: &Xid) -> RelayResult<()> {
        let mut branches = self.state.xa_branches.lock()?;
        branches.remove(xid);
        Ok(())
    }

    async fn recover(&mut self, _flags: u32) -> RelayResult<Vec<Xid>> {
        let branches = self.state.xa_branches.lock()?;
        Ok(branches
            .iter()
            .filter(|(_, state)| **state == XaBranchState::Prepared)
            .map(|(xid, _)| xid.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_command, Command, MockProvider};
    use crate::backend::{BackendExecution, BackendProvider};
    use sqlrelay_impl::RelayValue;
    use std::collections::HashMap;

    #[test]
    fn command_language() {
        assert!(matches!(
            parse_command("select 250 rows").unwrap(),
            (Command::Select { rows: 250, .. }, 0)
        ));
        assert!(matches!(
            parse_command("update 3 wait 100").unwrap(),
            (Command::Update { rows: 3 }, 100)
        ));
        assert!(matches!(
            parse_command("select 2 rows with lobs").unwrap(),
            (
                Command::Select {
                    rows: 2,
                    with_lobs: true
                },
                0
            )
        ));
        assert!(parse_command("drop table x").is_err());
    }

    #[tokio::test]
    async fn select_produces_rows_and_cursor() {
        let provider = MockProvider::new();
        let mut conn = provider
            .open("mock://", "u", "p", &HashMap::new())
            .await
            .unwrap();
        match conn.execute("select 5 rows", &[]).await.unwrap() {
            BackendExecution::Query {
                cursor_id,
                metadata,
            } => {
                assert_eq!(2, metadata.len());
                let (rows, exhausted) = conn.fetch(cursor_id, 3).await.unwrap();
                assert_eq!(3, rows.len());
                assert!(!exhausted);
                assert_eq!(RelayValue::Int(0), rows[0][0]);
                let (rows, exhausted) = conn.fetch(cursor_id, 3).await.unwrap();
                assert_eq!(2, rows.len());
                assert!(exhausted);
            }
            other => panic!("Unexpected execution result {other:?}"),
        }
    }
}
