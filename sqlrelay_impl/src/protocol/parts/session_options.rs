use crate::{RelayResult, DEFAULT_LOB_BLOCK_SIZE, DEFAULT_ROWS_PER_BLOCK};
use byteorder::{LittleEndian, ReadBytesExt};

/// Per-session streaming tunables, sent by the driver on connect and capped
/// by the server's configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionOptions {
    fetch_size: u32,
    lob_read_length: u32,
    lob_write_length: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            fetch_size: DEFAULT_ROWS_PER_BLOCK,
            lob_read_length: DEFAULT_LOB_BLOCK_SIZE,
            lob_write_length: DEFAULT_LOB_BLOCK_SIZE,
        }
    }
}

impl SessionOptions {
    pub fn new(fetch_size: u32, lob_read_length: u32, lob_write_length: u32) -> Self {
        Self {
            fetch_size,
            lob_read_length,
            lob_write_length,
        }
    }

    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    pub fn lob_read_length(&self) -> u32 {
        self.lob_read_length
    }

    pub fn lob_write_length(&self) -> u32 {
        self.lob_write_length
    }

    pub fn set_fetch_size(&mut self, fetch_size: u32) {
        self.fetch_size = fetch_size.max(1);
    }

    pub fn set_lob_read_length(&mut self, lob_read_length: u32) {
        self.lob_read_length = lob_read_length.max(1);
    }

    pub fn set_lob_write_length(&mut self, lob_write_length: u32) {
        self.lob_write_length = lob_write_length.max(1);
    }

    /// Returns a copy with both LOB lengths capped at `cap`.
    pub fn capped(mut self, cap: u32) -> Self {
        self.lob_read_length = self.lob_read_length.min(cap);
        self.lob_write_length = self.lob_write_length.min(cap);
        self
    }

    pub fn size() -> usize {
        12
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_u32_le(self.fetch_size).await?;
        w.write_u32_le(self.lob_read_length).await?;
        w.write_u32_le(self.lob_write_length).await?;
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let fetch_size = rdr.read_u32::<LittleEndian>()?;
        let lob_read_length = rdr.read_u32::<LittleEndian>()?;
        let lob_write_length = rdr.read_u32::<LittleEndian>()?;
        Ok(Self {
            fetch_size,
            lob_read_length,
            lob_write_length,
        })
    }
}
