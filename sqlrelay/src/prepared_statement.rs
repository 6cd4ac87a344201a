//! Client handle of a server-side prepared statement.

use crate::connection::ConnectionInner;
use crate::cursor::Cursor;
use sqlrelay_impl::{
    protocol::{
        parts::{ResourceKind, ResourceRef},
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    ExecutionResult, RelayError, RelayResult, RelayValue,
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug)]
pub struct PreparedStatement {
    conn: Arc<ConnectionInner>,
    handle: Uuid,
    param_count: u16,
    dropped: bool,
}

impl PreparedStatement {
    pub(crate) fn new(conn: Arc<ConnectionInner>, handle: Uuid, param_count: u16) -> Self {
        Self {
            conn,
            handle,
            param_count,
            dropped: false,
        }
    }

    /// The server-side handle of this statement.
    pub fn handle(&self) -> Uuid {
        self.handle
    }

    /// Number of `?` parameters of the statement.
    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    fn check_params(&self, params: &[RelayValue]) -> RelayResult<()> {
        if params.len() == usize::from(self.param_count) {
            Ok(())
        } else {
            Err(RelayError::UsageDetailed(format!(
                "Statement takes {} parameters, {} provided",
                self.param_count,
                params.len()
            )))
        }
    }

    fn execute_request(&self, params: &[RelayValue]) -> Request {
        let mut request = Request::new(MessageType::ExecutePrepared);
        request.push(Part::ResourceId(ResourceRef::new(
            ResourceKind::PreparedStatement,
            self.handle,
        )));
        if !params.is_empty() {
            request.push(Part::ParameterValues(params.to_vec()));
        }
        request
    }

    pub async fn execute_update(&mut self, params: &[RelayValue]) -> RelayResult<i64> {
        self.check_params(params)?;
        let mut reply = self.conn.request(&self.execute_request(params)).await?;
        reply.assert_expected_reply_type(ReplyType::ExecutionResults)?;
        first_count(&mut reply)
    }

    pub async fn execute_query(&mut self, params: &[RelayValue]) -> RelayResult<Cursor> {
        self.check_params(params)?;
        let mut reply = self.conn.request(&self.execute_request(params)).await?;
        reply.assert_expected_reply_type(ReplyType::ResultSet)?;
        Cursor::from_reply(Arc::clone(&self.conn), &mut reply)
    }

    /// Drops the server-side statement and its dependent result sets.
    pub async fn close(mut self) -> RelayResult<()> {
        self.dropped = true;
        let mut request = Request::new(MessageType::DropStatement);
        request.push(Part::ResourceId(ResourceRef::new(
            ResourceKind::PreparedStatement,
            self.handle,
        )));
        self.conn.request(&request).await.map(|_| ())
    }
}

impl Drop for PreparedStatement {
    // try to drop the server-side statement, ignore all errors
    fn drop(&mut self) {
        if !self.dropped {
            let conn = Arc::clone(&self.conn);
            let handle = self.handle;
            tokio::spawn(async move {
                let mut request = Request::new(MessageType::DropStatement);
                request.push(Part::ResourceId(ResourceRef::new(
                    ResourceKind::PreparedStatement,
                    handle,
                )));
                conn.request(&request).await.ok();
            });
        }
    }
}

fn first_count(reply: &mut Reply) -> RelayResult<i64> {
    match reply.parts.extract(PartKind::ExecutionResults) {
        Some(Part::ExecutionResults(results)) => match results.first() {
            Some(ExecutionResult::RowsAffected(n)) => Ok(*n),
            Some(ExecutionResult::SuccessNoInfo) => Ok(-1),
            other => Err(RelayError::UsageDetailed(format!(
                "Statement failed: {other:?}"
            ))),
        },
        _ => Err(RelayError::Impl("ExecutionResults part missing")),
    }
}
