//! The client-side result-set cursor.
//!
//! Holds the rows of the current block and transparently requests the next
//! block when they are exhausted; in row-by-row mode every advance is one
//! server round trip.

use crate::connection::ConnectionInner;
use sqlrelay_impl::{
    protocol::{
        parts::{FetchRequest, ResourceRef, ResultSetBlock},
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    RelayError, RelayResult, RelayValue, ResultSetMetadata, Row, Rows,
};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug)]
pub struct Cursor {
    conn: Arc<ConnectionInner>,
    result_set_id: Uuid,
    statement: Option<ResourceRef>,
    metadata: Arc<ResultSetMetadata>,
    row_by_row: bool,
    rows: VecDeque<Vec<RelayValue>>,
    complete: bool,
}

impl Cursor {
    pub(crate) fn from_reply(conn: Arc<ConnectionInner>, reply: &mut Reply) -> RelayResult<Self> {
        let statement = match reply.parts.extract(PartKind::ResourceId) {
            Some(Part::ResourceId(resource)) => Some(resource),
            _ => None,
        };
        let metadata = match reply.parts.extract(PartKind::ResultSetMetadata) {
            Some(Part::ResultSetMetadata(metadata)) => Arc::new(metadata),
            _ => return Err(RelayError::Impl("ResultSetMetadata part missing")),
        };
        let block = take_block(reply)?;
        Ok(Self {
            conn,
            result_set_id: block.result_set_id(),
            statement,
            metadata,
            row_by_row: block.row_by_row(),
            complete: block.is_last(),
            rows: block.into_rows().into(),
        })
    }

    pub fn metadata(&self) -> &ResultSetMetadata {
        &self.metadata
    }

    /// The server-side handle of this result set.
    pub fn result_set_id(&self) -> Uuid {
        self.result_set_id
    }

    /// The statement handle this result set belongs to.
    pub fn statement(&self) -> Option<ResourceRef> {
        self.statement
    }

    pub fn is_row_by_row(&self) -> bool {
        self.row_by_row
    }

    /// The next row, fetching the next block from the server when the
    /// current one is used up.
    pub async fn next_row(&mut self) -> RelayResult<Option<Row>> {
        if self.rows.is_empty() {
            if self.complete {
                return Ok(None);
            }
            self.fetch_next().await?;
        }
        Ok(self
            .rows
            .pop_front()
            .map(|values| Row::new(Arc::clone(&self.metadata), values)))
    }

    /// Drains the cursor into a fully materialized row set.
    pub async fn into_rows(mut self) -> RelayResult<Rows> {
        let mut all = Vec::new();
        while let Some(row) = self.next_row().await? {
            all.push(row.into_values());
        }
        Ok(Rows::new(Arc::clone(&self.metadata), all))
    }

    async fn fetch_next(&mut self) -> RelayResult<()> {
        trace!("Cursor::fetch_next() for {}", self.result_set_id);
        let mut request = Request::new(MessageType::FetchNext);
        request.push(Part::FetchRequest(FetchRequest::new(self.result_set_id, 0)));
        let mut reply = self.conn.request(&request).await?;
        reply.assert_expected_reply_type(ReplyType::Fetch)?;
        let block = take_block(&mut reply)?;
        self.complete = block.is_last();
        self.rows.extend(block.into_rows());
        Ok(())
    }

    /// Closes the server-side result set; the cursor is unusable afterwards.
    pub async fn close(self) -> RelayResult<()> {
        let mut request = Request::new(MessageType::CloseResultSet);
        request.push(Part::ResourceId(ResourceRef::new(
            sqlrelay_impl::ResourceKind::ResultSet,
            self.result_set_id,
        )));
        self.conn.request(&request).await.map(|_| ())
    }
}

fn take_block(reply: &mut Reply) -> RelayResult<ResultSetBlock> {
    match reply.parts.extract(PartKind::ResultSetBlock) {
        Some(Part::ResultSetBlock(block)) => Ok(block),
        _ => Err(RelayError::Impl("ResultSetBlock part missing")),
    }
}
