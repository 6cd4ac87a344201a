use crate::{protocol::util_sync, RelayError, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// The flavor of a large object.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LobKind {
    Blob = 0,
    Clob = 1,
    /// A binary LOB that is written through a streaming channel rather than
    /// through positioned writes.
    BinaryStream = 2,
}

impl LobKind {
    pub(crate) fn try_from_u8(i: u8) -> RelayResult<Self> {
        Ok(match i {
            0 => Self::Blob,
            1 => Self::Clob,
            2 => Self::BinaryStream,
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid lob kind {i} on the wire"
                )))
            }
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for LobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Blob => f.write_str("BLOB"),
            Self::Clob => f.write_str("CLOB"),
            Self::BinaryStream => f.write_str("binary stream"),
        }
    }
}

/// One block of LOB data on its way to the server.
///
/// A nil `lob_id` on the first block asks the server to create the LOB; the
/// reply carries the server-issued id, which subsequent blocks must echo.
#[derive(Debug)]
pub struct WriteLobRequest {
    lob_id: uuid::Uuid,
    kind: LobKind,
    position: u64,
    data: Vec<u8>,
    is_last_data: bool,
}

impl WriteLobRequest {
    pub fn new(
        lob_id: uuid::Uuid,
        kind: LobKind,
        position: u64,
        data: Vec<u8>,
        is_last_data: bool,
    ) -> Self {
        Self {
            lob_id,
            kind,
            position,
            data,
            is_last_data,
        }
    }

    pub fn lob_id(&self) -> uuid::Uuid {
        self.lob_id
    }

    pub fn is_create(&self) -> bool {
        self.lob_id.is_nil()
    }

    pub fn kind(&self) -> LobKind {
        self.kind
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_last_data(&self) -> bool {
        self.is_last_data
    }

    pub fn size(&self) -> usize {
        16 + 1 + 8 + 1 + util_sync::bytes_size(&self.data)
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        trace!(
            "write_lob_request::emit() {} bytes at position {}",
            self.data.len(),
            self.position
        );
        w.write_all(self.lob_id.as_bytes()).await?;
        w.write_u8(self.kind.as_u8()).await?;
        w.write_u64_le(self.position).await?;
        w.write_u8(u8::from(self.is_last_data)).await?;
        util_sync::emit_bytes(&self.data, w).await?;
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let lob_id = util_sync::parse_uuid(rdr)?;
        let kind = LobKind::try_from_u8(rdr.read_u8()?)?;
        let position = rdr.read_u64::<LittleEndian>()?;
        let is_last_data = rdr.read_u8()? != 0;
        let chunk_length = rdr.read_u32::<LittleEndian>()? as usize;
        let data = util_sync::parse_bytes(chunk_length, rdr)?;
        Ok(Self {
            lob_id,
            kind,
            position,
            data,
            is_last_data,
        })
    }
}
