use crate::{protocol::util_sync, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// One block of LOB data on its way to the client.
///
/// `position` is the absolute position of the block's first byte; a position
/// of `-1` marks the terminal block of a LOB that could not be resolved.
#[derive(Debug)]
pub struct ReadLobReply {
    lob_id: uuid::Uuid,
    position: i64,
    is_last_data: bool,
    data: Vec<u8>,
}

impl ReadLobReply {
    pub fn new(lob_id: uuid::Uuid, position: i64, is_last_data: bool, data: Vec<u8>) -> Self {
        Self {
            lob_id,
            position,
            is_last_data,
            data,
        }
    }

    /// The terminal block that is sent when the LOB reference cannot be resolved.
    pub fn unresolved(lob_id: uuid::Uuid) -> Self {
        Self::new(lob_id, -1, true, Vec::new())
    }

    pub fn lob_id(&self) -> &uuid::Uuid {
        &self.lob_id
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn is_resolved(&self) -> bool {
        self.position >= 0
    }

    pub fn into_data_and_last(self) -> (Vec<u8>, bool) {
        (self.data, self.is_last_data)
    }

    pub fn size(&self) -> usize {
        16 + 8 + 1 + util_sync::bytes_size(&self.data)
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_all(self.lob_id.as_bytes()).await?;
        w.write_i64_le(self.position).await?;
        w.write_u8(u8::from(self.is_last_data)).await?;
        util_sync::emit_bytes(&self.data, w).await?;
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let lob_id = util_sync::parse_uuid(rdr)?;
        let position = rdr.read_i64::<LittleEndian>()?;
        let is_last_data = rdr.read_u8()? != 0;
        let chunk_length = rdr.read_u32::<LittleEndian>()? as usize;
        let data = util_sync::parse_bytes(chunk_length, rdr)?;
        Ok(Self {
            lob_id,
            position,
            is_last_data,
            data,
        })
    }
}
