use crate::{protocol::util_sync, RelayError, RelayResult};
use byteorder::ReadBytesExt;

/// The server-side resource types a session can hold handles for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceKind {
    Connection = 0,
    Statement = 1,
    PreparedStatement = 2,
    CallableStatement = 3,
    ResultSet = 4,
    Blob = 5,
    Clob = 6,
    BinaryStream = 7,
    Savepoint = 8,
    Attribute = 9,
    Metadata = 10,
}

impl ResourceKind {
    pub(crate) fn try_from_u8(i: u8) -> RelayResult<Self> {
        Ok(match i {
            0 => Self::Connection,
            1 => Self::Statement,
            2 => Self::PreparedStatement,
            3 => Self::CallableStatement,
            4 => Self::ResultSet,
            5 => Self::Blob,
            6 => Self::Clob,
            7 => Self::BinaryStream,
            8 => Self::Savepoint,
            9 => Self::Attribute,
            10 => Self::Metadata,
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid resource kind {i} on the wire"
                )))
            }
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Statement => "statement",
            Self::PreparedStatement => "prepared-statement",
            Self::CallableStatement => "callable-statement",
            Self::ResultSet => "result-set",
            Self::Blob => "blob",
            Self::Clob => "clob",
            Self::BinaryStream => "binary-stream",
            Self::Savepoint => "savepoint",
            Self::Attribute => "attribute",
            Self::Metadata => "metadata",
        };
        f.write_str(s)
    }
}

/// A handle as it travels on the wire: resource kind plus session-scoped uuid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: uuid::Uuid,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: uuid::Uuid) -> Self {
        Self { kind, id }
    }

    pub fn size() -> usize {
        1 + 16
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_u8(self.kind.as_u8()).await?;
        w.write_all(self.id.as_bytes()).await?;
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let kind = ResourceKind::try_from_u8(rdr.read_u8()?)?;
        let id = util_sync::parse_uuid(rdr)?;
        Ok(Self { kind, id })
    }
}
