//! Client-side large-object transfer, both directions in bounded blocks.

use crate::connection::ConnectionInner;
use sqlrelay_impl::{
    protocol::{
        parts::{LobKind, ReadLobRequest, WriteLobRequest},
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    RelayError, RelayResult, RelayValue,
};
use std::sync::Arc;
use uuid::Uuid;

/// Streams a new LOB to the server in blocks of the session's write length.
///
/// The server creates the LOB lazily on the first block and reports the
/// total byte count with the acknowledgement of the final one.
#[derive(Debug)]
pub struct LobWriter {
    conn: Arc<ConnectionInner>,
    kind: LobKind,
    lob_id: Uuid,
    // 1-based position of the next byte to write
    position: u64,
    block_size: usize,
    buffer: Vec<u8>,
    total: u64,
}

impl LobWriter {
    pub(crate) fn new(conn: Arc<ConnectionInner>, kind: LobKind) -> Self {
        Self {
            conn,
            kind,
            lob_id: Uuid::nil(),
            position: 1,
            block_size: sqlrelay_impl::DEFAULT_LOB_BLOCK_SIZE as usize,
            buffer: Vec::new(),
            total: 0,
        }
    }

    /// Overrides the block size for this writer.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Appends bytes; full blocks are sent as they accumulate.
    pub async fn write(&mut self, data: &[u8]) -> RelayResult<()> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= self.block_size {
            let block: Vec<u8> = self.buffer.drain(..self.block_size).collect();
            self.send_block(block, false).await?;
        }
        Ok(())
    }

    /// Sends the remaining bytes with the final-block marker and returns the
    /// LOB value for use as a statement parameter, plus the total length.
    pub async fn finish(mut self) -> RelayResult<(RelayValue, u64)> {
        let block = std::mem::take(&mut self.buffer);
        self.send_block(block, true).await?;
        let value = match self.kind {
            LobKind::Clob => RelayValue::Clob(self.lob_id),
            _ => RelayValue::Blob(self.lob_id),
        };
        Ok((value, self.total))
    }

    async fn send_block(&mut self, block: Vec<u8>, is_last: bool) -> RelayResult<()> {
        let block_len = block.len() as u64;
        let mut request = Request::new(MessageType::WriteLob);
        request.push(Part::WriteLobRequest(WriteLobRequest::new(
            self.lob_id,
            self.kind,
            self.position,
            block,
            is_last,
        )));
        let mut reply = self.conn.request(&request).await?;
        reply.assert_expected_reply_type(ReplyType::WriteLob)?;
        match reply.parts.extract(PartKind::WriteLobReply) {
            Some(Part::WriteLobReply(ack)) => {
                self.lob_id = ack.lob_id();
                self.total = ack.total_length();
            }
            _ => return Err(RelayError::Impl("WriteLobReply part missing")),
        }
        self.position += block_len;
        Ok(())
    }
}

/// Reads a server-side LOB in bounded blocks, in increasing position order.
#[derive(Debug)]
pub struct LobReader {
    conn: Arc<ConnectionInner>,
    lob_id: Uuid,
}

impl LobReader {
    pub(crate) fn new(conn: Arc<ConnectionInner>, lob_id: Uuid) -> Self {
        Self { conn, lob_id }
    }

    pub fn lob_id(&self) -> Uuid {
        self.lob_id
    }

    /// Reads `length` bytes starting at the 1-based `offset`.
    pub async fn read(&mut self, offset: u64, length: u32) -> RelayResult<Vec<u8>> {
        let mut request = Request::new(MessageType::ReadLob);
        request.push(Part::ReadLobRequest(ReadLobRequest::new(
            self.lob_id,
            offset,
            length,
        )));
        let mut data = Vec::new();
        let lob_id = self.lob_id;
        self.conn
            .request_stream(&request, |reply: &mut Reply| {
                reply.assert_expected_reply_type(ReplyType::ReadLob)?;
                match reply.parts.extract(PartKind::ReadLobReply) {
                    Some(Part::ReadLobReply(block)) => {
                        if !block.is_resolved() {
                            return Err(RelayError::HandleNotFound {
                                kind: sqlrelay_impl::ResourceKind::Blob,
                                id: lob_id,
                            });
                        }
                        let (bytes, is_last) = block.into_data_and_last();
                        data.extend_from_slice(&bytes);
                        Ok(!is_last)
                    }
                    _ => Err(RelayError::Impl("ReadLobReply part missing")),
                }
            })
            .await?;
        Ok(data)
    }

    /// Reads the whole LOB from the start.
    pub async fn read_to_end(&mut self) -> RelayResult<Vec<u8>> {
        self.read(1, u32::MAX).await
    }
}
