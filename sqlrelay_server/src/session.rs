//! Per-client logical sessions and the process-wide session store.
//!
//! A session owns exactly one physical connection for its lifetime and every
//! handle created through it. Concurrent RPCs on the same session serialize
//! on the session mutex; the physical connection is never touched without
//! holding it.

use crate::backend::{BackendCancel, BackendConnection};
use crate::pool::PooledConnection;
use crate::statistics::ConnectionStatistics;
use sqlrelay_impl::{
    ClientInfo, LobKind, RelayError, RelayResult, RelayValue, ResourceKind, ResultSetMetadata,
    ServerError, SessionOptions,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use uuid::Uuid;

/// The physical connection a session owns.
#[derive(Debug)]
pub enum SessionConnection {
    Pooled(PooledConnection),
    Unpooled(Box<dyn BackendConnection>),
}

impl SessionConnection {
    pub fn conn_mut(&mut self) -> &mut dyn BackendConnection {
        match self {
            Self::Pooled(pc) => pc.conn_mut(),
            Self::Unpooled(conn) => conn.as_mut(),
        }
    }

    pub fn mark_isolation_dirty(&mut self) {
        if let Self::Pooled(pc) = self {
            pc.mark_isolation_dirty();
        }
    }
}

/// A handle table for one resource type.
///
/// Insertion hands out a fresh UUID; lookup by UUID is the only legal
/// dereference; ids are never reused after removal.
#[derive(Debug)]
pub struct HandleMap<T> {
    kind: ResourceKind,
    map: HashMap<Uuid, T>,
}

impl<T> HandleMap<T> {
    fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            map: HashMap::new(),
        }
    }

    pub fn put(&mut self, value: T) -> Uuid {
        let id = Uuid::new_v4();
        self.map.insert(id, value);
        id
    }

    pub fn get(&self, id: Uuid) -> RelayResult<&T> {
        self.map.get(&id).ok_or(RelayError::HandleNotFound {
            kind: self.kind,
            id,
        })
    }

    pub fn get_mut(&mut self, id: Uuid) -> RelayResult<&mut T> {
        self.map.get_mut(&id).ok_or(RelayError::HandleNotFound {
            kind: self.kind,
            id,
        })
    }

    pub fn remove(&mut self, id: Uuid) -> Option<T> {
        self.map.remove(&id)
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.map.drain().map(|(_, v)| v).collect()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.map.keys().copied().collect()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn retain<F: FnMut(&T) -> bool>(&mut self, mut keep: F) -> Vec<T> {
        let mut removed = Vec::new();
        let ids: Vec<Uuid> = self.map.keys().copied().collect();
        for id in ids {
            if let Some(value) = self.map.get(&id) {
                if !keep(value) {
                    if let Some(value) = self.map.remove(&id) {
                        removed.push(value);
                    }
                }
            }
        }
        removed
    }
}

/// A plain or prepared statement held by a session.
#[derive(Debug)]
pub struct StatementEntry {
    pub kind: ResourceKind,
    pub sql: Option<String>,
    pub backend_stmt: Option<u64>,
    pub param_count: u16,
    pub last_update_count: Option<i64>,
}

/// An open server-side result set.
#[derive(Debug)]
pub struct ResultSetEntry {
    pub cursor_id: u64,
    pub metadata: Arc<ResultSetMetadata>,
    pub row_by_row: bool,
    pub exhausted: bool,
    pub statement: Option<Uuid>,
    /// In row-by-row mode: the LOB handles of the current row, invalidated
    /// by the next cursor advance.
    pub row_lobs: Vec<Uuid>,
}

/// A large object bound to a session.
#[derive(Debug)]
pub struct LobEntry {
    pub kind: LobKind,
    pub locator: u64,
    pub statement: Option<Uuid>,
    pub written: u64,
}

#[derive(Debug)]
pub struct Session {
    session_id: Uuid,
    client_id: Uuid,
    conn_hash: String,
    is_xa: bool,
    connection: Option<SessionConnection>,
    cancel: Option<Arc<dyn BackendCancel>>,
    pub read_only: bool,
    pub options: SessionOptions,
    pub client_info: ClientInfo,
    pub statistics: ConnectionStatistics,
    pub warnings: Vec<ServerError>,
    pub statements: HandleMap<StatementEntry>,
    pub result_sets: HandleMap<ResultSetEntry>,
    pub lobs: HandleMap<LobEntry>,
    pub savepoints: HandleMap<String>,
    pub attributes: HandleMap<RelayValue>,
    pub metadata_handles: HandleMap<Arc<ResultSetMetadata>>,
    last_used: Instant,
}

impl Session {
    pub fn new(client_id: Uuid, conn_hash: String, is_xa: bool) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            client_id,
            conn_hash,
            is_xa,
            connection: None,
            cancel: None,
            read_only: false,
            options: SessionOptions::default(),
            client_info: ClientInfo::default(),
            statistics: ConnectionStatistics::default(),
            warnings: Vec::new(),
            statements: HandleMap::new(ResourceKind::Statement),
            result_sets: HandleMap::new(ResourceKind::ResultSet),
            lobs: HandleMap::new(ResourceKind::Blob),
            savepoints: HandleMap::new(ResourceKind::Savepoint),
            attributes: HandleMap::new(ResourceKind::Attribute),
            metadata_handles: HandleMap::new(ResourceKind::Metadata),
            last_used: Instant::now(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn conn_hash(&self) -> &str {
        &self.conn_hash
    }

    pub fn is_xa(&self) -> bool {
        self.is_xa
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Binds the lazily acquired physical connection and returns the cancel
    /// handle so the store can index it.
    pub fn bind_connection(
        &mut self,
        mut connection: SessionConnection,
    ) -> Option<Arc<dyn BackendCancel>> {
        self.cancel = connection.conn_mut().cancel_handle().map(Arc::from);
        self.connection = Some(connection);
        self.cancel.clone()
    }

    /// The physical connection; fails when none was acquired yet.
    pub fn connection_mut(&mut self) -> RelayResult<&mut SessionConnection> {
        self.connection
            .as_mut()
            .ok_or(RelayError::Usage("Session has no physical connection"))
    }

    pub fn conn_mut(&mut self) -> RelayResult<&mut dyn BackendConnection> {
        Ok(self.connection_mut()?.conn_mut())
    }

    /// The out-of-band cancel handle, if the back-end supports one.
    pub fn cancel_handle(&self) -> Option<Arc<dyn BackendCancel>> {
        self.cancel.clone()
    }

    pub fn pop_warnings(&mut self) -> Option<Vec<ServerError>> {
        if self.warnings.is_empty() {
            None
        } else {
            let mut v = Vec::<ServerError>::new();
            std::mem::swap(&mut v, &mut self.warnings);
            Some(v)
        }
    }

    /// Closes every handle against the back-end, in a defined order:
    /// result sets, LOBs, statements, savepoints. The connection itself is
    /// returned to the caller so the datasource can release or close it.
    pub async fn close_all_handles(&mut self) -> Option<SessionConnection> {
        let result_sets = self.result_sets.drain();
        let lobs = self.lobs.drain();
        let statements = self.statements.drain();
        self.savepoints.drain();
        self.attributes.drain();
        self.metadata_handles.drain();

        if let Some(mut connection) = self.connection.take() {
            let conn = connection.conn_mut();
            for rs in result_sets {
                if !rs.exhausted {
                    conn.close_cursor(rs.cursor_id).await.ok();
                }
            }
            for lob in lobs {
                conn.free_lob(lob.locator).await.ok();
            }
            for stmt in statements {
                if let Some(backend_stmt) = stmt.backend_stmt {
                    conn.drop_statement(backend_stmt).await.ok();
                }
            }
            self.cancel = None;
            Some(connection)
        } else {
            None
        }
    }
}

pub type AmSession = Arc<tokio::sync::Mutex<Session>>;

/// The process-wide mapping session-id → session, with a per-client index.
///
/// All operations are safe under concurrent access; removal is atomic with
/// respect to lookup — a concurrent `get` returns either the live session or
/// `None`, never a partially terminated one (termination happens under the
/// session mutex after removal).
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, AmSession>>,
    by_client: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    // cancel handles live outside the session mutex so a cancel does not
    // queue behind the statement it is meant to interrupt
    cancel_handles: RwLock<HashMap<Uuid, Arc<dyn BackendCancel>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cancel(&self, session_id: Uuid, handle: Arc<dyn BackendCancel>) {
        if let Ok(mut cancel_handles) = self.cancel_handles.write() {
            cancel_handles.insert(session_id, handle);
        }
    }

    pub fn cancel_handle(&self, session_id: Uuid) -> Option<Arc<dyn BackendCancel>> {
        self.cancel_handles
            .read()
            .ok()
            .and_then(|cancel_handles| cancel_handles.get(&session_id).cloned())
    }

    /// Registers the session and returns its id.
    pub fn register(&self, session: Session) -> RelayResult<Uuid> {
        let session_id = session.session_id();
        let client_id = session.client_id();
        self.sessions
            .write()?
            .insert(session_id, Arc::new(tokio::sync::Mutex::new(session)));
        self.by_client
            .write()?
            .entry(client_id)
            .or_default()
            .insert(session_id);
        debug!("SessionStore: registered session {session_id} of client {client_id}");
        Ok(session_id)
    }

    pub fn get(&self, session_id: Uuid) -> RelayResult<AmSession> {
        self.sessions
            .read()?
            .get(&session_id)
            .cloned()
            .ok_or(RelayError::SessionNotFound(session_id))
    }

    /// Unlinks the session; idempotent. The caller still holds an `Arc` and
    /// performs the actual teardown under the session mutex.
    pub fn remove(&self, session_id: Uuid, client_id: Uuid) -> Option<AmSession> {
        let removed = self
            .sessions
            .write()
            .ok()
            .and_then(|mut sessions| sessions.remove(&session_id));
        if removed.is_some() {
            if let Ok(mut by_client) = self.by_client.write() {
                if let Some(ids) = by_client.get_mut(&client_id) {
                    ids.remove(&session_id);
                    if ids.is_empty() {
                        by_client.remove(&client_id);
                    }
                }
            }
            if let Ok(mut cancel_handles) = self.cancel_handles.write() {
                cancel_handles.remove(&session_id);
            }
        }
        removed
    }

    /// The ids of all sessions a client currently holds.
    pub fn sessions_of_client(&self, client_id: Uuid) -> Vec<Uuid> {
        self.by_client
            .read()
            .map(|by_client| {
                by_client
                    .get(&client_id)
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// All sessions, for shutdown.
    pub fn drain(&self) -> Vec<AmSession> {
        let drained = self
            .sessions
            .write()
            .map(|mut sessions| sessions.drain().map(|(_, s)| s).collect())
            .unwrap_or_default();
        if let Ok(mut by_client) = self.by_client.write() {
            by_client.clear();
        }
        if let Ok(mut cancel_handles) = self.cancel_handles.write() {
            cancel_handles.clear();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionStore};
    use sqlrelay_impl::{ErrorKind, ResourceKind};
    use uuid::Uuid;

    #[test]
    fn register_get_remove() {
        let store = SessionStore::new();
        let client_id = Uuid::new_v4();
        let session_id = store
            .register(Session::new(client_id, "hash".to_string(), false))
            .unwrap();

        assert_eq!(1, store.count());
        assert!(store.get(session_id).is_ok());
        assert_eq!(vec![session_id], store.sessions_of_client(client_id));

        assert!(store.remove(session_id, client_id).is_some());
        assert!(store.remove(session_id, client_id).is_none());
        let e = store.get(session_id).unwrap_err();
        assert_eq!(ErrorKind::SessionNotFound, e.kind());
        assert!(store.sessions_of_client(client_id).is_empty());
    }

    #[test]
    fn handles_are_not_reused() {
        let mut session = Session::new(Uuid::new_v4(), "hash".to_string(), false);
        let id = session.savepoints.put("sp1".to_string());
        assert!(session.savepoints.get(id).is_ok());
        session.savepoints.remove(id);
        let e = session.savepoints.get(id).unwrap_err();
        match e {
            sqlrelay_impl::RelayError::HandleNotFound { kind, .. } => {
                assert_eq!(ResourceKind::Savepoint, kind);
            }
            other => panic!("Unexpected error {other:?}"),
        }
        let id2 = session.savepoints.put("sp2".to_string());
        assert_ne!(id, id2);
    }
}
