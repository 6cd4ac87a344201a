//! The server-side RPC surface: connect, execute, fetch, call-resource,
//! LOB transfer, session termination, and the XA verbs.
//!
//! Every session-bound operation locks the session mutex first, so RPCs on
//! one session are observably serialized; the physical connection is only
//! ever touched under that lock.

use crate::backend::BackendExecution;
use crate::config::ServerConfig;
use crate::datasource::{DatasourceEntry, DatasourceRegistry};
use crate::session::{
    LobEntry, ResultSetEntry, Session, SessionConnection, SessionStore, StatementEntry,
};
use crate::streamer;
use sqlrelay_impl::{
    protocol::{
        parts::{
            CallMethod, CallReply, CallStep, CallValue, ExecutionResult, LobKind, ReadLobReply,
            ResourceKind, ResourceRef, ServerError, SessionInfo, Topology, WriteLobReply,
            XatOptions,
        },
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    sql_fingerprint, xa_flags, RelayError, RelayResult, RelayValue, SessionOptions,
    MAX_LOB_BLOCK_SIZE,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// What the transport layer should do with a handled request.
#[derive(Debug)]
pub enum Outcome {
    Reply(Reply),
    /// A server-streamed sequence of replies; the last one is flagged in its
    /// payload.
    Stream(tokio::sync::mpsc::Receiver<Reply>),
}

#[derive(Debug)]
pub struct Dispatcher {
    config: ServerConfig,
    store: SessionStore,
    registry: DatasourceRegistry,
    topology: Topology,
}

fn missing_part(kind: PartKind) -> RelayError {
    RelayError::UsageDetailed(format!("Request lacks a {kind:?} part"))
}

impl Dispatcher {
    pub fn new(config: ServerConfig, registry: DatasourceRegistry, topology: Topology) -> Self {
        Self {
            config,
            store: SessionStore::new(),
            registry,
            topology,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn registry(&self) -> &DatasourceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handles one request; errors become error replies, so the transport
    /// always has something to send back.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Outcome {
        let message_type = request.message_type();
        let session_id = request.session_id();
        match self.dispatch(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("{message_type:?} for session {session_id} failed: {e}");
                if e.is_connection_failure() {
                    // state class 08: the physical connection is gone, take
                    // the session with it
                    self.terminate_session(session_id).await.ok();
                }
                Outcome::Reply(Self::error_reply(&e))
            }
        }
    }

    fn error_reply(e: &RelayError) -> Reply {
        let mut reply = Reply::new(ReplyType::Error);
        reply.push(Part::Error(vec![e.to_server_error()]));
        reply
    }

    async fn dispatch(self: &Arc<Self>, mut request: Request) -> RelayResult<Outcome> {
        match request.message_type() {
            MessageType::Connect => self.connect(&mut request).await.map(Outcome::Reply),
            MessageType::Disconnect => self
                .terminate_session(request.session_id())
                .await
                .map(Outcome::Reply),
            MessageType::Ping => Ok(Outcome::Reply(Reply::new(ReplyType::Pong))),
            MessageType::ExecuteDirect | MessageType::ExecuteUpdate | MessageType::ExecuteQuery => {
                self.execute(&mut request).await.map(Outcome::Reply)
            }
            MessageType::Prepare => self.prepare(&mut request).await.map(Outcome::Reply),
            MessageType::ExecutePrepared => {
                self.execute_prepared(&mut request).await.map(Outcome::Reply)
            }
            MessageType::FetchNext => self.fetch_next(&mut request).await.map(Outcome::Reply),
            MessageType::CloseResultSet => {
                self.close_result_set(&mut request).await.map(Outcome::Reply)
            }
            MessageType::DropStatement => {
                self.drop_statement(&mut request).await.map(Outcome::Reply)
            }
            MessageType::CallResource => self.call_resource(&mut request).await.map(Outcome::Reply),
            MessageType::WriteLob => self.write_lob(&mut request).await.map(Outcome::Reply),
            MessageType::ReadLob => self.read_lob(&mut request).await,
            MessageType::XaStart
            | MessageType::XaEnd
            | MessageType::XaPrepare
            | MessageType::XaCommit
            | MessageType::XaRollback
            | MessageType::XaRecover
            | MessageType::XaForget => self.xa_verb(&mut request).await.map(Outcome::Reply),
        }
    }

    // ------------------------------------------------------------------ connect

    async fn connect(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::ConnectRequest(connect)) = request.parts.extract(PartKind::ConnectRequest)
        else {
            return Err(missing_part(PartKind::ConnectRequest));
        };

        let mut properties = self.config.pool_properties_for(connect.datasource());
        for (k, v) in connect.properties() {
            properties.insert(k.clone(), v.clone());
        }
        let entry = self
            .registry
            .register(
                connect.url(),
                connect.user(),
                connect.password(),
                connect.datasource(),
                connect.is_xa(),
                &properties,
            )
            .await?;

        let mut session = Session::new(
            connect.client_id(),
            entry.conn_hash().to_string(),
            connect.is_xa(),
        );
        if let Some(Part::ClientInfo(client_info)) = request.parts.extract(PartKind::ClientInfo) {
            session.client_info = client_info;
        }
        let requested =
            match request.parts.extract(PartKind::SessionOptions) {
                Some(Part::SessionOptions(options)) => options,
                _ => SessionOptions::new(
                    self.config.fetch.rows_per_block,
                    self.config.fetch.lob_block_size,
                    self.config.fetch.lob_block_size,
                ),
            };
        session.options = requested.capped(self.config.fetch.lob_block_size.min(MAX_LOB_BLOCK_SIZE));

        let session_id = session.session_id();
        info!(
            "connect: session {} for client {} ({}) on datasource \"{}\"",
            session_id,
            connect.client_id(),
            session.client_info,
            entry.datasource(),
        );
        self.store.register(session)?;

        let mut reply = Reply::new(ReplyType::Connected);
        reply.push(Part::SessionInfo(SessionInfo::new(
            session_id,
            entry.conn_hash().to_string(),
            connect.is_xa(),
        )));
        reply.push(Part::Topology(self.topology.clone()));
        Ok(reply)
    }

    // ------------------------------------------------------- session plumbing

    fn entry_of(&self, session: &Session) -> RelayResult<Arc<DatasourceEntry>> {
        self.registry
            .get(session.conn_hash())
            .ok_or(RelayError::Impl("Session points to an unknown datasource"))
    }

    /// First statement on a session acquires the physical connection.
    async fn ensure_connection(
        &self,
        session: &mut Session,
        entry: &DatasourceEntry,
    ) -> RelayResult<()> {
        if session.has_connection() {
            return Ok(());
        }
        let started = Instant::now();
        let connection = self.registry.acquire_connection(entry).await?;
        if let Some(cancel) = session.bind_connection(connection) {
            self.store.register_cancel(session.session_id(), cancel);
        }
        session.statistics.add_roundtrip(started.elapsed());
        debug!(
            "session {}: physical connection bound after {} µs",
            session.session_id(),
            started.elapsed().as_micros()
        );
        Ok(())
    }

    // ------------------------------------------------------------- execution

    async fn run_backend_execution(
        &self,
        session: &mut Session,
        sql_or_stmt: Result<&str, u64>,
        params: &[RelayValue],
    ) -> RelayResult<BackendExecution> {
        let statement_timeout = Duration::from_millis(self.config.statement_timeout_ms);
        let cancel = self.store.cancel_handle(session.session_id());
        let conn = session.conn_mut()?;
        let execution = async {
            match sql_or_stmt {
                Ok(sql) => conn.execute(sql, params).await,
                Err(stmt_id) => conn.execute_prepared(stmt_id, params).await,
            }
        };
        if statement_timeout.is_zero() {
            execution.await
        } else {
            match tokio::time::timeout(statement_timeout, execution).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    if let Some(cancel) = cancel {
                        cancel.cancel().await.ok();
                    }
                    Err(RelayError::Backend {
                        source: ServerError::backend(
                            0,
                            b"HYT00",
                            "Statement execution timed out".to_string(),
                        ),
                    })
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn execute(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::Command(sql)) = request.parts.extract(PartKind::Command) else {
            return Err(missing_part(PartKind::Command));
        };
        let params = match request.parts.extract(PartKind::ParameterValues) {
            Some(Part::ParameterValues(values)) => values,
            _ => Vec::new(),
        };

        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        let entry = self.entry_of(&session)?;
        self.ensure_connection(&mut session, &entry).await?;

        let fingerprint = sql_fingerprint(&sql, params.len());
        let permit = entry.segregator().acquire(fingerprint).await?;
        let started = Instant::now();
        let result = self
            .run_backend_execution(&mut session, Ok(&sql), &params)
            .await;
        entry.segregator().release(permit);
        session.statistics.add_roundtrip(started.elapsed());

        let execution = result?;
        match (request.message_type(), execution) {
            (MessageType::ExecuteQuery | MessageType::ExecuteDirect, BackendExecution::Query { cursor_id, metadata }) => {
                let stmt_handle = session.statements.put(StatementEntry {
                    kind: ResourceKind::Statement,
                    sql: Some(sql),
                    backend_stmt: None,
                    param_count: 0,
                    last_update_count: None,
                });
                self.query_reply(&mut session, &entry, stmt_handle, cursor_id, metadata)
                    .await
            }
            (MessageType::ExecuteUpdate | MessageType::ExecuteDirect, BackendExecution::Updated(counts)) => {
                let stmt_handle = session.statements.put(StatementEntry {
                    kind: ResourceKind::Statement,
                    sql: Some(sql),
                    backend_stmt: None,
                    param_count: 0,
                    last_update_count: counts.first().copied(),
                });
                Ok(Self::update_reply(stmt_handle, &counts))
            }
            (_, BackendExecution::Updated(_)) => Err(RelayError::Usage(
                "executeQuery ran a statement that returns no result set",
            )),
            (_, BackendExecution::Query { cursor_id, .. }) => {
                session.conn_mut()?.close_cursor(cursor_id).await.ok();
                Err(RelayError::Usage(
                    "executeUpdate ran a statement that returns a result set",
                ))
            }
        }
    }

    async fn prepare(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::Command(sql)) = request.parts.extract(PartKind::Command) else {
            return Err(missing_part(PartKind::Command));
        };
        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        let entry = self.entry_of(&session)?;
        self.ensure_connection(&mut session, &entry).await?;

        let started = Instant::now();
        let prepared = session.conn_mut()?.prepare(&sql).await?;
        session.statistics.add_roundtrip(started.elapsed());

        let stmt_handle = session.statements.put(StatementEntry {
            kind: ResourceKind::PreparedStatement,
            sql: Some(sql),
            backend_stmt: Some(prepared.stmt_id),
            param_count: prepared.param_count,
            last_update_count: None,
        });
        let mut reply = Reply::new(ReplyType::Prepared);
        reply.push(Part::ResourceId(ResourceRef::new(
            ResourceKind::PreparedStatement,
            stmt_handle,
        )));
        reply.push(Part::CallReply(CallReply::new(CallValue::Scalar(
            RelayValue::Int(i32::from(prepared.param_count)),
        ))));
        Ok(reply)
    }

    async fn execute_prepared(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::ResourceId(resource)) = request.parts.extract(PartKind::ResourceId) else {
            return Err(missing_part(PartKind::ResourceId));
        };
        let params = match request.parts.extract(PartKind::ParameterValues) {
            Some(Part::ParameterValues(values)) => values,
            _ => Vec::new(),
        };

        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        let entry = self.entry_of(&session)?;
        self.ensure_connection(&mut session, &entry).await?;

        let (backend_stmt, fingerprint) = {
            let stmt = session.statements.get(resource.id)?;
            let backend_stmt = stmt
                .backend_stmt
                .ok_or(RelayError::Usage("Statement was not prepared"))?;
            let fingerprint =
                sql_fingerprint(stmt.sql.as_deref().unwrap_or_default(), params.len());
            (backend_stmt, fingerprint)
        };

        let permit = entry.segregator().acquire(fingerprint).await?;
        let started = Instant::now();
        let result = self
            .run_backend_execution(&mut session, Err(backend_stmt), &params)
            .await;
        entry.segregator().release(permit);
        session.statistics.add_roundtrip(started.elapsed());

        match result? {
            BackendExecution::Query {
                cursor_id,
                metadata,
            } => {
                self.query_reply(&mut session, &entry, resource.id, cursor_id, metadata)
                    .await
            }
            BackendExecution::Updated(counts) => {
                session.statements.get_mut(resource.id)?.last_update_count =
                    counts.first().copied();
                Ok(Self::update_reply(resource.id, &counts))
            }
        }
    }

    fn update_reply(stmt_handle: Uuid, counts: &[i64]) -> Reply {
        let mut reply = Reply::new(ReplyType::ExecutionResults);
        reply.push(Part::ResourceId(ResourceRef::new(
            ResourceKind::Statement,
            stmt_handle,
        )));
        reply.push(Part::ExecutionResults(
            counts.iter().map(|n| ExecutionResult::RowsAffected(*n)).collect(),
        ));
        reply
    }

    /// Builds the first-block reply of a fresh result set.
    async fn query_reply(
        &self,
        session: &mut Session,
        entry: &DatasourceEntry,
        stmt_handle: Uuid,
        cursor_id: u64,
        metadata: sqlrelay_impl::ResultSetMetadata,
    ) -> RelayResult<Reply> {
        let metadata = Arc::new(metadata);
        let conn = session.conn_mut()?;
        let row_by_row = streamer::has_lob_columns(&metadata)
            && entry.row_by_row_mode(|| conn.lobs_invalidated_on_advance());
        let fetch_size = if row_by_row {
            1
        } else {
            session.options.fetch_size()
        };
        let (mut rows, exhausted) = session.conn_mut()?.fetch(cursor_id, fetch_size).await?;
        let row_lobs =
            streamer::wrap_lob_columns(session, &metadata, Some(stmt_handle), &mut rows)?;
        session.statistics.add_rows_streamed(rows.len() as u64);

        let rs_handle = session.result_sets.put(ResultSetEntry {
            cursor_id,
            metadata: Arc::clone(&metadata),
            row_by_row,
            exhausted,
            statement: Some(stmt_handle),
            row_lobs,
        });
        debug!(
            "session {}: opened result set {rs_handle} (row_by_row = {row_by_row})",
            session.session_id()
        );

        let mut reply = Reply::new(ReplyType::ResultSet);
        reply.push(Part::ResourceId(ResourceRef::new(
            ResourceKind::Statement,
            stmt_handle,
        )));
        reply.push(Part::ResultSetMetadata((*metadata).clone()));
        reply.push(Part::ResultSetBlock(
            sqlrelay_impl::protocol::parts::ResultSetBlock::new(
                rs_handle, row_by_row, exhausted, rows,
            ),
        ));
        Ok(reply)
    }

    async fn fetch_next(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::FetchRequest(fetch)) = request.parts.extract(PartKind::FetchRequest) else {
            return Err(missing_part(PartKind::FetchRequest));
        };
        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();

        let rs_id = fetch.result_set_id();
        let (cursor_id, metadata, row_by_row, exhausted, statement, old_row_lobs) = {
            let rs = session.result_sets.get(rs_id)?;
            (
                rs.cursor_id,
                Arc::clone(&rs.metadata),
                rs.row_by_row,
                rs.exhausted,
                rs.statement,
                rs.row_lobs.clone(),
            )
        };
        if exhausted {
            let mut reply = Reply::new(ReplyType::Fetch);
            reply.push(Part::ResultSetBlock(
                sqlrelay_impl::protocol::parts::ResultSetBlock::new(
                    rs_id, row_by_row, true, Vec::new(),
                ),
            ));
            return Ok(reply);
        }

        // in row-by-row mode the previous row's LOB locators die with this
        // advance; their handles go with them
        if row_by_row {
            for lob_handle in old_row_lobs {
                session.lobs.remove(lob_handle);
            }
        }

        let fetch_size = if row_by_row {
            1
        } else if fetch.fetch_size() > 0 {
            fetch.fetch_size()
        } else {
            session.options.fetch_size()
        };
        let started = Instant::now();
        let (mut rows, now_exhausted) = session.conn_mut()?.fetch(cursor_id, fetch_size).await?;
        session.statistics.add_roundtrip(started.elapsed());
        let row_lobs = streamer::wrap_lob_columns(&mut session, &metadata, statement, &mut rows)?;
        session.statistics.add_rows_streamed(rows.len() as u64);
        {
            let rs = session.result_sets.get_mut(rs_id)?;
            rs.exhausted = now_exhausted;
            rs.row_lobs = row_lobs;
        }

        let mut reply = Reply::new(ReplyType::Fetch);
        reply.push(Part::ResultSetBlock(
            sqlrelay_impl::protocol::parts::ResultSetBlock::new(
                rs_id,
                row_by_row,
                now_exhausted,
                rows,
            ),
        ));
        Ok(reply)
    }

    async fn close_result_set(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::ResourceId(resource)) = request.parts.extract(PartKind::ResourceId) else {
            return Err(missing_part(PartKind::ResourceId));
        };
        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        Self::close_result_set_entry(&mut session, resource.id).await;
        Ok(Reply::new(ReplyType::Nil))
    }

    async fn close_result_set_entry(session: &mut Session, rs_id: Uuid) {
        if let Some(rs) = session.result_sets.remove(rs_id) {
            for lob_handle in rs.row_lobs {
                session.lobs.remove(lob_handle);
            }
            if !rs.exhausted {
                if let Ok(conn) = session.conn_mut() {
                    conn.close_cursor(rs.cursor_id).await.ok();
                }
            }
        }
    }

    async fn drop_statement(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::ResourceId(resource)) = request.parts.extract(PartKind::ResourceId) else {
            return Err(missing_part(PartKind::ResourceId));
        };
        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        Self::drop_statement_entry(&mut session, resource.id).await;
        Ok(Reply::new(ReplyType::Nil))
    }

    // closing a statement closes its dependent result sets first
    async fn drop_statement_entry(session: &mut Session, stmt_id: Uuid) {
        let dependent: Vec<Uuid> = session
            .result_sets
            .ids()
            .into_iter()
            .filter(|rs_id| {
                session
                    .result_sets
                    .get(*rs_id)
                    .map(|rs| rs.statement == Some(stmt_id))
                    .unwrap_or(false)
            })
            .collect();
        for rs_id in dependent {
            Self::close_result_set_entry(session, rs_id).await;
        }
        if let Some(stmt) = session.statements.remove(stmt_id) {
            if let Some(backend_stmt) = stmt.backend_stmt {
                if let Ok(conn) = session.conn_mut() {
                    conn.drop_statement(backend_stmt).await.ok();
                }
            }
        }
    }

    // ------------------------------------------------------------------- lobs

    async fn write_lob(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::WriteLobRequest(write)) = request.parts.extract(PartKind::WriteLobRequest)
        else {
            return Err(missing_part(PartKind::WriteLobRequest));
        };
        let block_cap = self.config.fetch.lob_block_size.min(MAX_LOB_BLOCK_SIZE) as usize;
        if write.data().len() > block_cap {
            return Err(RelayError::UsageDetailed(format!(
                "LOB block of {} bytes exceeds the maximum of {block_cap}",
                write.data().len()
            )));
        }

        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        let entry = self.entry_of(&session)?;
        self.ensure_connection(&mut session, &entry).await?;

        // first block of a fresh LOB creates it lazily
        let lob_handle = if write.is_create() {
            let locator = session.conn_mut()?.create_lob(write.kind()).await?;
            session.lobs.put(LobEntry {
                kind: write.kind(),
                locator,
                statement: None,
                written: 0,
            })
        } else {
            write.lob_id()
        };

        let (locator, kind, written) = {
            let lob = session.lobs.get(lob_handle)?;
            (lob.locator, lob.kind, lob.written)
        };
        // binary streams append; positioned kinds use the 1-based wire offset
        let backend_position = match kind {
            LobKind::BinaryStream => written,
            _ => {
                if write.position() == 0 {
                    return Err(RelayError::Usage("LOB positions are 1-based"));
                }
                write.position() - 1
            }
        };
        let started = Instant::now();
        session
            .conn_mut()?
            .write_lob(locator, backend_position, write.data())
            .await?;
        session.statistics.add_roundtrip(started.elapsed());
        session
            .statistics
            .add_lob_bytes_written(write.data().len() as u64);
        let total = {
            let lob = session.lobs.get_mut(lob_handle)?;
            lob.written = lob.written.max(backend_position + write.data().len() as u64);
            lob.written
        };

        let mut reply = Reply::new(ReplyType::WriteLob);
        reply.push(Part::WriteLobReply(WriteLobReply::new(
            lob_handle,
            total,
            write.is_last_data(),
        )));
        Ok(reply)
    }

    async fn read_lob(self: &Arc<Self>, request: &mut Request) -> RelayResult<Outcome> {
        let Some(Part::ReadLobRequest(read)) = request.parts.extract(PartKind::ReadLobRequest)
        else {
            return Err(missing_part(PartKind::ReadLobRequest));
        };
        let am_session = self.store.get(request.session_id())?;
        let block_cap = self.config.fetch.lob_block_size.min(MAX_LOB_BLOCK_SIZE);
        let (tx, rx) = tokio::sync::mpsc::channel::<Reply>(4);

        tokio::spawn(async move {
            let mut session = am_session.lock().await;
            session.touch();
            let lob_handle = read.lob_id();
            let session_cap = session.options.lob_read_length();
            let locator = match session.lobs.get(lob_handle) {
                Ok(lob) => lob.locator,
                Err(_) => {
                    // terminal marker block for an unresolvable reference
                    let mut reply = Reply::new(ReplyType::ReadLob);
                    reply.push(Part::ReadLobReply(ReadLobReply::unresolved(lob_handle)));
                    tx.send(reply).await.ok();
                    return;
                }
            };
            let block_cap = block_cap.min(session_cap);

            if read.offset() == 0 {
                warn!("read_lob with 0 offset rejected, positions are 1-based");
                let mut reply = Reply::new(ReplyType::ReadLob);
                reply.push(Part::ReadLobReply(ReadLobReply::unresolved(lob_handle)));
                tx.send(reply).await.ok();
                return;
            }

            let o_total = match session.conn_mut() {
                Ok(conn) => conn.lob_length(locator).await.unwrap_or(None),
                Err(_) => None,
            };
            let mut position = read.offset(); // 1-based
            let mut remaining = u64::from(read.length());

            loop {
                let o_total_remaining =
                    o_total.map(|total| total.saturating_sub(position - 1));
                let block = streamer::next_lob_block_size(block_cap, remaining, o_total_remaining);
                if block == 0 {
                    let mut reply = Reply::new(ReplyType::ReadLob);
                    reply.push(Part::ReadLobReply(ReadLobReply::new(
                        lob_handle,
                        i64::try_from(position).unwrap_or(i64::MAX),
                        true,
                        Vec::new(),
                    )));
                    tx.send(reply).await.ok();
                    return;
                }
                let read_result = match session.conn_mut() {
                    Ok(conn) => conn.read_lob(locator, position - 1, block).await,
                    Err(e) => Err(e),
                };
                let (mut data, backend_last) = match read_result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("read_lob failed at position {position}: {e}");
                        let mut reply = Reply::new(ReplyType::ReadLob);
                        reply.push(Part::ReadLobReply(ReadLobReply::unresolved(lob_handle)));
                        tx.send(reply).await.ok();
                        return;
                    }
                };
                let n = data.len() as u64;
                remaining = remaining.saturating_sub(n);
                let is_last = backend_last || remaining == 0 || (n as u32) < block;
                if is_last && o_total.is_none() {
                    // unknown total length: the driver pads the tail
                    data = streamer::trim_trailing_zeros(data);
                }
                session.statistics.add_lob_bytes_read(data.len() as u64);
                let mut reply = Reply::new(ReplyType::ReadLob);
                reply.push(Part::ReadLobReply(ReadLobReply::new(
                    lob_handle,
                    i64::try_from(position).unwrap_or(i64::MAX),
                    is_last,
                    data,
                )));
                position += n;
                // a closed receiver means the caller cancelled; stop at the
                // current block, nothing is retransmitted
                if tx.send(reply).await.is_err() || is_last {
                    return;
                }
            }
        });
        Ok(Outcome::Stream(rx))
    }

    // -------------------------------------------------------------- terminate

    /// Closes all handles, returns the connection, and evicts the session.
    /// Safe to call repeatedly; later calls are no-ops.
    pub async fn terminate_session(&self, session_id: Uuid) -> RelayResult<Reply> {
        let Ok(am_session) = self.store.get(session_id) else {
            return Ok(Reply::new(ReplyType::Nil));
        };
        let mut session = am_session.lock().await;
        self.store.remove(session_id, session.client_id());
        let o_connection = session.close_all_handles().await;
        if let Some(connection) = o_connection {
            match self.registry.get(session.conn_hash()) {
                Some(entry) => self.registry.release_connection(&entry, connection).await,
                None => {
                    if let SessionConnection::Unpooled(mut conn) = connection {
                        conn.close().await.ok();
                    }
                }
            }
        }
        info!(
            "terminate: session {session_id} ({})",
            session.statistics
        );
        Ok(Reply::new(ReplyType::Nil))
    }

    // ----------------------------------------------------------- call-resource

    async fn call_resource(&self, request: &mut Request) -> RelayResult<Reply> {
        let Some(Part::CallRequest(call)) = request.parts.extract(PartKind::CallRequest) else {
            return Err(missing_part(PartKind::CallRequest));
        };

        // cancel must not queue behind the statement it interrupts
        if call.call().method == CallMethod::Cancel {
            if let Some(cancel) = self.store.cancel_handle(request.session_id()) {
                cancel.cancel().await?;
            }
            let mut reply = Reply::new(ReplyType::CallReply);
            reply.push(Part::CallReply(CallReply::new(CallValue::Void)));
            return Ok(reply);
        }

        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        let entry = self.entry_of(&session)?;
        self.ensure_connection(&mut session, &entry).await?;

        let value = self
            .invoke(&mut session, call.resource(), call.call())
            .await?;
        let value = match (call.chained(), &value) {
            (Some(chained), CallValue::Handle(intermediate)) => {
                let chained_value = self.invoke(&mut session, *intermediate, chained).await?;
                // the intermediate handle only existed for the chain
                Self::discard_handle(&mut session, *intermediate);
                chained_value
            }
            (Some(_), _) => {
                return Err(RelayError::Usage(
                    "Chained call requires the first call to return a resource",
                ))
            }
            (None, _) => value,
        };

        let mut reply = Reply::new(ReplyType::CallReply);
        if let Some(warnings) = session.pop_warnings() {
            reply.push(Part::Error(warnings));
        }
        reply.push(Part::CallReply(CallReply::new(value)));
        Ok(reply)
    }

    fn discard_handle(session: &mut Session, resource: ResourceRef) {
        match resource.kind {
            ResourceKind::Metadata => {
                session.metadata_handles.remove(resource.id);
            }
            ResourceKind::Attribute => {
                session.attributes.remove(resource.id);
            }
            _ => {}
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn invoke(
        &self,
        session: &mut Session,
        resource: ResourceRef,
        step: &CallStep,
    ) -> RelayResult<CallValue> {
        use CallMethod as M;
        use ResourceKind as R;
        trace!(
            "invoke {:?} on {} {}",
            step.method,
            resource.kind,
            resource.id
        );
        let args = &step.args;
        match (resource.kind, step.method) {
            // --------------------------------------------------- connection
            (R::Connection, M::SetAutoCommit) => {
                let auto_commit = arg_bool(args, 0)?;
                session.conn_mut()?.set_auto_commit(auto_commit).await?;
                Ok(CallValue::Void)
            }
            (R::Connection, M::GetAutoCommit) => Ok(CallValue::Scalar(RelayValue::Boolean(true))),
            (R::Connection, M::Commit) => {
                session.conn_mut()?.commit().await?;
                Ok(CallValue::Void)
            }
            (R::Connection, M::Rollback) => {
                session.conn_mut()?.rollback().await?;
                Ok(CallValue::Void)
            }
            (R::Connection, M::SetTransactionIsolation) => {
                let level = arg_i32(args, 0)?;
                session.conn_mut()?.set_transaction_isolation(level).await?;
                // dirty connections get their isolation reset on release
                session.connection_mut()?.mark_isolation_dirty();
                Ok(CallValue::Void)
            }
            (R::Connection, M::GetTransactionIsolation) => {
                let level = session.conn_mut()?.transaction_isolation().await?;
                Ok(CallValue::Scalar(RelayValue::Int(level)))
            }
            (R::Connection, M::SetReadOnly) => {
                let read_only = arg_bool(args, 0)?;
                session.conn_mut()?.set_read_only(read_only).await?;
                session.read_only = read_only;
                Ok(CallValue::Void)
            }
            (R::Connection, M::IsReadOnly) => {
                Ok(CallValue::Scalar(RelayValue::Boolean(session.read_only)))
            }
            (R::Connection, M::SetSavepoint) => {
                let name = match args.first() {
                    Some(RelayValue::Varchar(name)) => name.clone(),
                    _ => format!("sp_{}", session.savepoints.len() + 1),
                };
                session.conn_mut()?.set_savepoint(&name).await?;
                let handle = session.savepoints.put(name);
                Ok(CallValue::Handle(ResourceRef::new(R::Savepoint, handle)))
            }
            (R::Connection, M::IsValid) => {
                let valid = session.conn_mut()?.ping().await.is_ok();
                Ok(CallValue::Scalar(RelayValue::Boolean(valid)))
            }
            (R::Connection, M::PopWarnings) => Ok(CallValue::Void), // emitted via the error part

            // ---------------------------------------------------- savepoint
            (R::Savepoint, M::GetSavepointName) => {
                let name = session.savepoints.get(resource.id)?.clone();
                Ok(CallValue::Scalar(RelayValue::Varchar(name)))
            }
            (R::Savepoint, M::ReleaseSavepoint) => {
                let name = session.savepoints.get(resource.id)?.clone();
                session.conn_mut()?.release_savepoint(&name).await?;
                session.savepoints.remove(resource.id);
                Ok(CallValue::Void)
            }
            (R::Savepoint, M::RollbackToSavepoint) => {
                let name = session.savepoints.get(resource.id)?.clone();
                session.conn_mut()?.rollback_to_savepoint(&name).await?;
                Ok(CallValue::Void)
            }

            // --------------------------------------------------- statements
            (R::Statement | R::PreparedStatement | R::CallableStatement, M::GetUpdateCount) => {
                let count = session
                    .statements
                    .get(resource.id)?
                    .last_update_count
                    .unwrap_or(-1);
                Ok(CallValue::Scalar(RelayValue::BigInt(count)))
            }
            (R::Statement | R::PreparedStatement | R::CallableStatement, M::GetMoreResults) => {
                Ok(CallValue::Scalar(RelayValue::Boolean(false)))
            }
            (R::Statement | R::PreparedStatement | R::CallableStatement, M::GetResultSet) => {
                let rs_id = session
                    .result_sets
                    .ids()
                    .into_iter()
                    .find(|rs_id| {
                        session
                            .result_sets
                            .get(*rs_id)
                            .map(|rs| rs.statement == Some(resource.id))
                            .unwrap_or(false)
                    })
                    .ok_or(RelayError::Usage("Statement has no open result set"))?;
                Ok(CallValue::Handle(ResourceRef::new(R::ResultSet, rs_id)))
            }
            (R::Statement | R::PreparedStatement | R::CallableStatement, M::Close) => {
                Self::drop_statement_entry(session, resource.id).await;
                Ok(CallValue::Void)
            }

            // --------------------------------------------------- result set
            (R::ResultSet, M::GetMetadata) => {
                let metadata = Arc::clone(&session.result_sets.get(resource.id)?.metadata);
                let handle = session.metadata_handles.put(metadata);
                Ok(CallValue::Handle(ResourceRef::new(R::Metadata, handle)))
            }
            (R::ResultSet, M::FindColumn) => {
                let label = arg_str(args, 0)?;
                let index = session
                    .result_sets
                    .get(resource.id)?
                    .metadata
                    .index_of(&label)?;
                let index = i32::try_from(index).unwrap_or(i32::MAX);
                Ok(CallValue::Scalar(RelayValue::Int(index + 1))) // 1-based
            }
            (R::ResultSet, M::Close) => {
                Self::close_result_set_entry(session, resource.id).await;
                Ok(CallValue::Void)
            }

            // ----------------------------------------------------- metadata
            (R::Metadata, M::GetColumnCount) => {
                let metadata = session.metadata_handles.get(resource.id)?;
                let count = i32::try_from(metadata.len()).unwrap_or(i32::MAX);
                Ok(CallValue::Scalar(RelayValue::Int(count)))
            }
            (R::Metadata, M::GetColumnLabel) => {
                let column = column_arg(args)?;
                let metadata = session.metadata_handles.get(resource.id)?;
                let field = field_at(metadata, column)?;
                Ok(CallValue::Scalar(RelayValue::Varchar(
                    field.label().to_string(),
                )))
            }
            (R::Metadata, M::GetColumnTypeName) => {
                let column = column_arg(args)?;
                let metadata = session.metadata_handles.get(resource.id)?;
                let field = field_at(metadata, column)?;
                Ok(CallValue::Scalar(RelayValue::Varchar(format!(
                    "{:?}",
                    field.type_id()
                ))))
            }
            (R::Metadata, M::IsNullable) => {
                let column = column_arg(args)?;
                let metadata = session.metadata_handles.get(resource.id)?;
                let field = field_at(metadata, column)?;
                Ok(CallValue::Scalar(RelayValue::Boolean(field.nullable())))
            }
            (R::Metadata, M::IsAutoIncrement) => {
                // not conveyed by the back-end seam
                let _ = column_arg(args)?;
                Ok(CallValue::Scalar(RelayValue::Boolean(false)))
            }

            // --------------------------------------------------------- lobs
            (R::Blob | R::Clob | R::BinaryStream, M::Length) => {
                let locator = session.lobs.get(resource.id)?.locator;
                let length = session.conn_mut()?.lob_length(locator).await?;
                match length {
                    Some(length) => Ok(CallValue::Scalar(RelayValue::BigInt(
                        i64::try_from(length).unwrap_or(i64::MAX),
                    ))),
                    None => Ok(CallValue::Scalar(RelayValue::BigInt(-1))),
                }
            }
            (R::Blob | R::Clob | R::BinaryStream, M::Free) => {
                if let Some(lob) = session.lobs.remove(resource.id) {
                    session.conn_mut()?.free_lob(lob.locator).await.ok();
                }
                Ok(CallValue::Void)
            }

            (kind, method) => Err(RelayError::UsageDetailed(format!(
                "Method {method:?} is not applicable to a {kind} resource"
            ))),
        }
    }

    // --------------------------------------------------------------------- xa

    async fn xa_verb(&self, request: &mut Request) -> RelayResult<Reply> {
        let xat = match request.parts.extract(PartKind::XatOptions) {
            Some(Part::XatOptions(xat)) => xat,
            _ => XatOptions::default(),
        };
        let am_session = self.store.get(request.session_id())?;
        let mut session = am_session.lock().await;
        session.touch();
        if !session.is_xa() {
            return Err(RelayError::XaProtocol(
                "Session was not opened for XA".to_string(),
            ));
        }
        let entry = self.entry_of(&session)?;
        self.ensure_connection(&mut session, &entry).await?;
        let control = entry.xa_control()?;
        let session_id = session.session_id();

        let flags = xat.flags();
        let require_xid = |xat: &XatOptions| {
            xat.xid()
                .cloned()
                .ok_or_else(|| RelayError::XaProtocol("Verb requires an xid".to_string()))
        };

        let conn = session.conn_mut()?;
        let xa = conn
            .xa_resource()
            .ok_or_else(|| RelayError::XaProtocol("Back-end is not XA-capable".to_string()))?;

        let mut response = XatOptions::default();
        match request.message_type() {
            MessageType::XaStart => {
                control.start(session_id, &require_xid(&xat)?, flags, xa).await?;
            }
            MessageType::XaEnd => {
                control.end(session_id, &require_xid(&xat)?, flags, xa).await?;
            }
            MessageType::XaPrepare => {
                let vote = control.prepare(&require_xid(&xat)?, xa).await?;
                response.set_return_code(vote);
            }
            MessageType::XaCommit => {
                let one_phase = flags & xa_flags::ONE_PHASE != 0;
                control.commit(&require_xid(&xat)?, one_phase, xa).await?;
            }
            MessageType::XaRollback => {
                control.rollback(&require_xid(&xat)?, xa).await?;
            }
            MessageType::XaForget => {
                control.forget(&require_xid(&xat)?, xa).await?;
            }
            MessageType::XaRecover => {
                let xids = control.recover(flags, xa).await?;
                response.set_xids(xids);
            }
            _ => return Err(RelayError::Impl("Not an XA verb")),
        }
        if response.return_code().is_none() {
            response.set_return_code(0);
        }

        let mut reply = Reply::new(ReplyType::XaResponse);
        reply.push(Part::XatOptions(response));
        Ok(reply)
    }
}

// ------------------------------------------------------------ argument access

fn arg_bool(args: &[RelayValue], index: usize) -> RelayResult<bool> {
    match args.get(index) {
        Some(RelayValue::Boolean(b)) => Ok(*b),
        other => Err(RelayError::UsageDetailed(format!(
            "Expected a boolean argument at {index}, got {other:?}"
        ))),
    }
}

fn arg_i32(args: &[RelayValue], index: usize) -> RelayResult<i32> {
    match args.get(index) {
        Some(RelayValue::Int(i)) => Ok(*i),
        other => Err(RelayError::UsageDetailed(format!(
            "Expected an int argument at {index}, got {other:?}"
        ))),
    }
}

fn arg_str(args: &[RelayValue], index: usize) -> RelayResult<String> {
    match args.get(index) {
        Some(RelayValue::Varchar(s)) => Ok(s.clone()),
        other => Err(RelayError::UsageDetailed(format!(
            "Expected a string argument at {index}, got {other:?}"
        ))),
    }
}

// metadata columns are addressed 1-based, as the driver API does
fn column_arg(args: &[RelayValue]) -> RelayResult<usize> {
    let column = arg_i32(args, 0)?;
    if column < 1 {
        return Err(RelayError::Usage("Column indexes are 1-based"));
    }
    Ok((column - 1) as usize)
}

fn field_at(
    metadata: &Arc<sqlrelay_impl::ResultSetMetadata>,
    column: usize,
) -> RelayResult<&sqlrelay_impl::FieldMetadata> {
    metadata
        .fields()
        .get(column)
        .ok_or_else(|| RelayError::UsageDetailed(format!("No column at index {}", column + 1)))
}

