//! The logical client connection: one proxy session, bound to one endpoint.

use crate::channel::RpcChannel;
use crate::cursor::Cursor;
use crate::dispatch::{EndpointManager, EndpointState, ManagedConnection};
use crate::driver::Driver;
use crate::lob::{LobReader, LobWriter};
use crate::prepared_statement::PreparedStatement;
use crate::xa::XaSession;
use sqlrelay_impl::{
    protocol::{
        parts::{
            CallMethod, CallRequest, CallStep, CallValue, ConnectRequest, LobKind, ResourceKind,
            ResourceRef,
        },
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    EndpointAddr, RelayError, RelayResult, RelayValue, ServerError,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
pub(crate) struct ConnectionInner {
    manager: Arc<EndpointManager>,
    endpoint: Arc<EndpointState>,
    channel: tokio::sync::Mutex<RpcChannel>,
    session_id: Uuid,
    is_xa: bool,
    closed: AtomicBool,
    marked_for_closure: AtomicBool,
    in_use: AtomicU32,
    warnings: Mutex<Vec<ServerError>>,
}

impl ConnectionInner {
    pub(crate) fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn check_open(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RelayError::TransportFailure(
                "Connection is closed".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// One request/reply exchange on this connection's channel.
    ///
    /// Calls on one connection serialize on the channel mutex. A transport
    /// failure on a non-repeatable operation closes the connection and
    /// surfaces the error: the request's effect may already have been
    /// applied on the bound endpoint. Repeatable operations are re-sent
    /// once to another healthy endpoint before the error surfaces.
    pub(crate) async fn request(&self, request: &Request) -> RelayResult<Reply> {
        self.check_open()?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        self.endpoint.begin_call();
        let started = Instant::now();
        let result = {
            let mut channel = self.channel.lock().await;
            channel.roundtrip(self.session_id, request).await
        };
        self.endpoint.finish_call();
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok((reply, warnings)) => {
                self.manager
                    .report_success(self.endpoint.addr(), started.elapsed());
                self.store_warnings(warnings);
                Ok(reply)
            }
            Err(e) => self.handle_transport_failure(request, e).await,
        }
    }

    // On a connection-level failure, repeatable requests go out once more to
    // another healthy endpoint; everything else fails to the caller and
    // closes the connection.
    async fn handle_transport_failure(
        &self,
        request: &Request,
        error: RelayError,
    ) -> RelayResult<Reply> {
        if !matches!(error, RelayError::TransportFailure(_)) {
            return Err(error);
        }
        self.manager.report_failure(self.endpoint.addr());
        if request.message_type().is_repeatable() {
            if let Ok(fallback) = self.manager.select_excluding(self.endpoint.addr()) {
                debug!(
                    "Retrying {:?} on {} after: {error}",
                    request.message_type(),
                    fallback.addr()
                );
                fallback.begin_call();
                let started = Instant::now();
                let retry = async {
                    let mut channel = RpcChannel::open(fallback.addr()).await?;
                    channel.roundtrip(self.session_id, request).await
                }
                .await;
                fallback.finish_call();
                match retry {
                    Ok((reply, warnings)) => {
                        self.manager
                            .report_success(fallback.addr(), started.elapsed());
                        self.store_warnings(warnings);
                        return Ok(reply);
                    }
                    Err(retry_error) => {
                        self.manager.report_failure(fallback.addr());
                        debug!("Retry on {} failed too: {retry_error}", fallback.addr());
                    }
                }
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        Err(error)
    }

    /// A request answered by a reply stream; `on_reply` returns false to
    /// stop consuming (the last block also stops it).
    ///
    /// A repeatable request whose transport fails before any reply was
    /// delivered is re-sent once to another healthy endpoint; once blocks
    /// have been consumed the error surfaces, nothing is retransmitted.
    pub(crate) async fn request_stream<F>(
        &self,
        request: &Request,
        mut on_reply: F,
    ) -> RelayResult<()>
    where
        F: FnMut(&mut Reply) -> RelayResult<bool>,
    {
        self.check_open()?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        self.endpoint.begin_call();
        let started = Instant::now();
        let mut delivered = false;
        let result = {
            let mut channel = self.channel.lock().await;
            Self::consume_stream(
                &mut channel,
                self.session_id,
                request,
                &mut on_reply,
                &mut delivered,
            )
            .await
        };
        self.endpoint.finish_call();
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        match result {
            Ok(()) => {
                self.manager
                    .report_success(self.endpoint.addr(), started.elapsed());
                Ok(())
            }
            Err(e) => {
                if !matches!(e, RelayError::TransportFailure(_)) {
                    return Err(e);
                }
                self.manager.report_failure(self.endpoint.addr());
                if !delivered && request.message_type().is_repeatable() {
                    if let Ok(fallback) = self.manager.select_excluding(self.endpoint.addr()) {
                        debug!(
                            "Retrying {:?} stream on {} after: {e}",
                            request.message_type(),
                            fallback.addr()
                        );
                        fallback.begin_call();
                        let started = Instant::now();
                        let retry = async {
                            let mut channel = RpcChannel::open(fallback.addr()).await?;
                            Self::consume_stream(
                                &mut channel,
                                self.session_id,
                                request,
                                &mut on_reply,
                                &mut delivered,
                            )
                            .await
                        }
                        .await;
                        fallback.finish_call();
                        match retry {
                            Ok(()) => {
                                self.manager
                                    .report_success(fallback.addr(), started.elapsed());
                                return Ok(());
                            }
                            Err(retry_error) => {
                                self.manager.report_failure(fallback.addr());
                                debug!(
                                    "Retry on {} failed too: {retry_error}",
                                    fallback.addr()
                                );
                            }
                        }
                    }
                }
                self.closed.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn consume_stream<F>(
        channel: &mut RpcChannel,
        session_id: Uuid,
        request: &Request,
        on_reply: &mut F,
        delivered: &mut bool,
    ) -> RelayResult<()>
    where
        F: FnMut(&mut Reply) -> RelayResult<bool>,
    {
        channel.send(session_id, request).await?;
        loop {
            let mut reply = channel.read_stream_reply().await?;
            *delivered = true;
            if !on_reply(&mut reply)? {
                return Ok(());
            }
        }
    }

    fn store_warnings(&self, warnings: Vec<ServerError>) {
        if !warnings.is_empty() {
            if let Ok(mut stored) = self.warnings.lock() {
                stored.extend(warnings);
            }
        }
    }

    pub(crate) async fn call(
        &self,
        resource: ResourceRef,
        step: CallStep,
        chained: Option<CallStep>,
    ) -> RelayResult<CallValue> {
        let mut request = Request::new(MessageType::CallResource);
        request.push(Part::CallRequest(match chained {
            Some(chained_step) => CallRequest::with_chained(resource, step, chained_step),
            None => CallRequest::new(resource, step),
        }));
        let mut reply = self.request(&request).await?;
        reply.assert_expected_reply_type(ReplyType::CallReply)?;
        match reply.parts.extract(PartKind::CallReply) {
            Some(Part::CallReply(call_reply)) => Ok(call_reply.into_value()),
            _ => Err(RelayError::Impl("CallReply part missing")),
        }
    }

    fn connection_resource(&self) -> ResourceRef {
        ResourceRef::new(ResourceKind::Connection, self.session_id)
    }
}

impl ManagedConnection for ConnectionInner {
    fn endpoint(&self) -> &EndpointAddr {
        self.endpoint.addr()
    }

    fn is_idle(&self) -> bool {
        self.in_use.load(Ordering::SeqCst) == 0
    }

    fn is_xa(&self) -> bool {
        self.is_xa
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn on_server_unhealthy(&self) {
        warn!(
            "Session {} closes: endpoint {} is unhealthy",
            self.session_id,
            self.endpoint.addr()
        );
        self.closed.store(true, Ordering::SeqCst);
    }

    fn mark_for_closure(&self) {
        self.marked_for_closure.store(true, Ordering::SeqCst);
    }
}

/// A logical database connection through a sqlrelay proxy.
///
/// Obtained from a [`Driver`](crate::Driver); all RPCs of this connection go
/// to the endpoint it was bound to at connect time.
#[derive(Debug)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connects with default driver settings; shorthand for building a
    /// [`Driver`](crate::Driver) with one connection.
    pub async fn connect<P: sqlrelay_impl::IntoConnectParams>(params: P) -> RelayResult<Self> {
        Driver::new(params)?.connect().await
    }

    pub(crate) async fn open(driver: &Driver, endpoint: Arc<EndpointState>) -> RelayResult<Self> {
        let params = driver.params();
        let mut channel = RpcChannel::open(endpoint.addr()).await?;

        let mut request = Request::new(MessageType::Connect);
        request.push(Part::ConnectRequest(ConnectRequest::new(
            params.backend_url().to_string(),
            params.datasource().to_string(),
            params.dbuser().to_string(),
            params.password().unsecure().to_string(),
            driver.client_id(),
            params.is_xa(),
            params.properties().clone(),
        )));
        request.push(Part::ClientInfo(driver.client_info()));
        request.push(Part::SessionOptions(driver.session_options()));

        let (mut reply, _) = channel.roundtrip(Uuid::nil(), &request).await?;
        reply.assert_expected_reply_type(ReplyType::Connected)?;
        let session_info = match reply.parts.extract(PartKind::SessionInfo) {
            Some(Part::SessionInfo(session_info)) => session_info,
            _ => return Err(RelayError::Impl("SessionInfo part missing")),
        };
        if let Some(Part::Topology(topology)) = reply.parts.extract(PartKind::Topology) {
            trace!("Server advertises {} endpoints", topology.endpoints().len());
        }
        debug!(
            "Connected: session {} on {}",
            session_info.session_id(),
            endpoint.addr()
        );

        let inner = Arc::new(ConnectionInner {
            manager: driver.manager(),
            endpoint,
            channel: tokio::sync::Mutex::new(channel),
            session_id: session_info.session_id(),
            is_xa: session_info.is_xa(),
            closed: AtomicBool::new(false),
            marked_for_closure: AtomicBool::new(false),
            in_use: AtomicU32::new(0),
            warnings: Mutex::new(Vec::new()),
        });
        let inner_dyn: Arc<dyn ManagedConnection> = inner.clone();
        let weak: std::sync::Weak<dyn ManagedConnection> = Arc::downgrade(&inner_dyn);
        driver.manager().register_connection(weak);
        Ok(Self { inner })
    }

    /// The server-issued session id.
    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    /// The endpoint this connection is bound to.
    pub fn endpoint(&self) -> &EndpointAddr {
        self.inner.endpoint.addr()
    }

    /// True once the connection closed itself (explicitly, after a transport
    /// failure, or because its endpoint became unhealthy).
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// True when the rebalancer wants this connection replaced; the owner
    /// should close it and connect anew.
    pub fn is_marked_for_closure(&self) -> bool {
        self.inner.marked_for_closure.load(Ordering::SeqCst)
    }

    /// Executes a statement that returns an update count.
    pub async fn execute_update(&mut self, sql: &str, params: &[RelayValue]) -> RelayResult<i64> {
        let mut request = Request::new(MessageType::ExecuteUpdate);
        request.push(Part::Command(sql.to_string()));
        if !params.is_empty() {
            request.push(Part::ParameterValues(params.to_vec()));
        }
        let mut reply = self.inner.request(&request).await?;
        reply.assert_expected_reply_type(ReplyType::ExecutionResults)?;
        execution_count(&mut reply)
    }

    /// Executes a query and returns a lazily fetching cursor.
    pub async fn execute_query(&mut self, sql: &str, params: &[RelayValue]) -> RelayResult<Cursor> {
        let mut request = Request::new(MessageType::ExecuteQuery);
        request.push(Part::Command(sql.to_string()));
        if !params.is_empty() {
            request.push(Part::ParameterValues(params.to_vec()));
        }
        let mut reply = self.inner.request(&request).await?;
        reply.assert_expected_reply_type(ReplyType::ResultSet)?;
        Cursor::from_reply(Arc::clone(&self.inner), &mut reply)
    }

    /// Prepares a statement for repeated execution.
    pub async fn prepare(&mut self, sql: &str) -> RelayResult<PreparedStatement> {
        let mut request = Request::new(MessageType::Prepare);
        request.push(Part::Command(sql.to_string()));
        let mut reply = self.inner.request(&request).await?;
        reply.assert_expected_reply_type(ReplyType::Prepared)?;
        let resource = match reply.parts.extract(PartKind::ResourceId) {
            Some(Part::ResourceId(resource)) => resource,
            _ => return Err(RelayError::Impl("ResourceId part missing")),
        };
        let param_count = match reply.parts.extract(PartKind::CallReply) {
            Some(Part::CallReply(call_reply)) => match call_reply.scalar()? {
                RelayValue::Int(n) => u16::try_from(*n).unwrap_or(0),
                _ => 0,
            },
            _ => 0,
        };
        Ok(PreparedStatement::new(
            Arc::clone(&self.inner),
            resource.id,
            param_count,
        ))
    }

    pub async fn commit(&mut self) -> RelayResult<()> {
        self.inner
            .call(
                self.inner.connection_resource(),
                CallStep::new(CallMethod::Commit, Vec::new()),
                None,
            )
            .await
            .map(|_| ())
    }

    pub async fn rollback(&mut self) -> RelayResult<()> {
        self.inner
            .call(
                self.inner.connection_resource(),
                CallStep::new(CallMethod::Rollback, Vec::new()),
                None,
            )
            .await
            .map(|_| ())
    }

    pub async fn set_auto_commit(&mut self, auto_commit: bool) -> RelayResult<()> {
        self.inner
            .call(
                self.inner.connection_resource(),
                CallStep::new(
                    CallMethod::SetAutoCommit,
                    vec![RelayValue::Boolean(auto_commit)],
                ),
                None,
            )
            .await
            .map(|_| ())
    }

    pub async fn set_transaction_isolation(&mut self, level: i32) -> RelayResult<()> {
        self.inner
            .call(
                self.inner.connection_resource(),
                CallStep::new(
                    CallMethod::SetTransactionIsolation,
                    vec![RelayValue::Int(level)],
                ),
                None,
            )
            .await
            .map(|_| ())
    }

    /// Creates a named savepoint; returns its handle for release/rollback.
    pub async fn set_savepoint(&mut self, name: &str) -> RelayResult<ResourceRef> {
        match self
            .inner
            .call(
                self.inner.connection_resource(),
                CallStep::new(
                    CallMethod::SetSavepoint,
                    vec![RelayValue::Varchar(name.to_string())],
                ),
                None,
            )
            .await?
        {
            CallValue::Handle(handle) => Ok(handle),
            other => Err(RelayError::UsageDetailed(format!(
                "setSavepoint returned {other:?}"
            ))),
        }
    }

    pub async fn rollback_to_savepoint(&mut self, savepoint: ResourceRef) -> RelayResult<()> {
        self.inner
            .call(
                savepoint,
                CallStep::new(CallMethod::RollbackToSavepoint, Vec::new()),
                None,
            )
            .await
            .map(|_| ())
    }

    /// Invokes a method on a session resource; the chained form reaches
    /// through a returned resource in the same round trip.
    pub async fn call_resource(
        &mut self,
        resource: ResourceRef,
        step: CallStep,
        chained: Option<CallStep>,
    ) -> RelayResult<CallValue> {
        self.inner.call(resource, step, chained).await
    }

    /// Streams a new large object to the server.
    pub fn lob_writer(&mut self, kind: LobKind) -> LobWriter {
        LobWriter::new(Arc::clone(&self.inner), kind)
    }

    /// A reader over a LOB value from a result-set row.
    pub fn lob_reader(&self, value: &RelayValue) -> RelayResult<LobReader> {
        match value {
            RelayValue::Blob(id) | RelayValue::Clob(id) => {
                Ok(LobReader::new(Arc::clone(&self.inner), *id))
            }
            other => Err(RelayError::UsageDetailed(format!(
                "Not a lob value: {other:?}"
            ))),
        }
    }

    /// The XA face of this connection; only for connections opened with
    /// `is_xa`.
    pub fn xa_session(&self) -> RelayResult<XaSession> {
        if self.inner.is_xa {
            Ok(XaSession::new(Arc::clone(&self.inner)))
        } else {
            Err(RelayError::Usage("Connection was not opened for XA"))
        }
    }

    /// Warnings the server accumulated since the last call.
    pub fn pop_warnings(&mut self) -> Vec<ServerError> {
        self.inner
            .warnings
            .lock()
            .map(|mut warnings| warnings.drain(..).collect())
            .unwrap_or_default()
    }

    /// Terminates the server-side session and closes the connection.
    pub async fn close(self) -> RelayResult<()> {
        let request = Request::new_for_disconnect();
        let result = self.inner.request(&request).await.map(|_| ());
        self.inner.closed.store(true, Ordering::SeqCst);
        result
    }
}

fn execution_count(reply: &mut Reply) -> RelayResult<i64> {
    match reply.parts.extract(PartKind::ExecutionResults) {
        Some(Part::ExecutionResults(results)) => match results.first() {
            Some(sqlrelay_impl::ExecutionResult::RowsAffected(n)) => Ok(*n),
            Some(sqlrelay_impl::ExecutionResult::SuccessNoInfo) => Ok(-1),
            other => Err(RelayError::UsageDetailed(format!(
                "Statement failed: {other:?}"
            ))),
        },
        _ => Err(RelayError::Impl("ExecutionResults part missing")),
    }
}
