use crate::{protocol::util_sync, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// Asks the server for the next block of an open result set.
#[derive(Debug)]
pub struct FetchRequest {
    result_set_id: uuid::Uuid,
    fetch_size: u32,
}

impl FetchRequest {
    pub fn new(result_set_id: uuid::Uuid, fetch_size: u32) -> Self {
        trace!("FetchRequest for {result_set_id} with fetch_size = {fetch_size}");
        Self {
            result_set_id,
            fetch_size,
        }
    }

    pub fn result_set_id(&self) -> uuid::Uuid {
        self.result_set_id
    }

    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    pub fn size() -> usize {
        20
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_all(self.result_set_id.as_bytes()).await?;
        w.write_u32_le(self.fetch_size).await?;
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let result_set_id = util_sync::parse_uuid(rdr)?;
        let fetch_size = rdr.read_u32::<LittleEndian>()?;
        Ok(Self {
            result_set_id,
            fetch_size,
        })
    }
}
