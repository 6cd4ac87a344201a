use crate::{protocol::util_sync, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// Acknowledges one or more written LOB blocks.
///
/// After the first block this carries the server-issued LOB id; after the
/// final block it additionally carries the accumulated byte count.
#[derive(Debug)]
pub struct WriteLobReply {
    lob_id: uuid::Uuid,
    total_length: u64,
    is_final: bool,
}

impl WriteLobReply {
    pub fn new(lob_id: uuid::Uuid, total_length: u64, is_final: bool) -> Self {
        Self {
            lob_id,
            total_length,
            is_final,
        }
    }

    pub fn lob_id(&self) -> uuid::Uuid {
        self.lob_id
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn size() -> usize {
        25
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_all(self.lob_id.as_bytes()).await?;
        w.write_u64_le(self.total_length).await?;
        w.write_u8(u8::from(self.is_final)).await?;
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let lob_id = util_sync::parse_uuid(rdr)?;
        let total_length = rdr.read_u64::<LittleEndian>()?;
        let is_final = rdr.read_u8()? != 0;
        Ok(Self {
            lob_id,
            total_length,
            is_final,
        })
    }
}
