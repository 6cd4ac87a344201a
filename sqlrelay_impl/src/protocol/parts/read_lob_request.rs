use crate::{protocol::util_sync, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

#[derive(Debug)]
pub struct ReadLobRequest {
    lob_id: uuid::Uuid,
    offset: u64,
    length: u32,
}

impl ReadLobRequest {
    pub fn new(lob_id: uuid::Uuid, offset: u64, length: u32) -> Self {
        trace!("Offset = {}, length = {}", offset, length);
        Self {
            lob_id,
            offset,
            length,
        }
    }

    pub fn lob_id(&self) -> uuid::Uuid {
        self.lob_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        trace!("read_lob_request::emit() {:?}", self);
        w.write_all(self.lob_id.as_bytes()).await?;
        w.write_u64_le(self.offset).await?;
        w.write_u32_le(self.length).await?;
        w.write_u32_le(0).await?; // FILLER
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let lob_id = util_sync::parse_uuid(rdr)?;
        let offset = rdr.read_u64::<LittleEndian>()?;
        let length = rdr.read_u32::<LittleEndian>()?;
        util_sync::skip_bytes(4, rdr)?; // FILLER
        Ok(Self {
            lob_id,
            offset,
            length,
        })
    }

    pub fn size() -> usize {
        32
    }
}
