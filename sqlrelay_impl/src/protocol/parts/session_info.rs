use crate::{protocol::util_sync, RelayResult};
use byteorder::ReadBytesExt;

/// Reply payload of a successful `Connect`: the server-issued session id and
/// the datasource key the session is bound to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    session_id: uuid::Uuid,
    conn_hash: String,
    is_xa: bool,
}

impl SessionInfo {
    pub fn new(session_id: uuid::Uuid, conn_hash: String, is_xa: bool) -> Self {
        Self {
            session_id,
            conn_hash,
            is_xa,
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn conn_hash(&self) -> &str {
        &self.conn_hash
    }

    pub fn is_xa(&self) -> bool {
        self.is_xa
    }

    pub fn size(&self) -> usize {
        16 + util_sync::string_size(&self.conn_hash) + 1
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        w.write_all(self.session_id.as_bytes()).await?;
        util_sync::emit_string(&self.conn_hash, w).await?;
        w.write_u8(u8::from(self.is_xa)).await?;
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let session_id = util_sync::parse_uuid(rdr)?;
        let conn_hash = util_sync::parse_string(rdr)?;
        let is_xa = rdr.read_u8()? != 0;
        Ok(Self {
            session_id,
            conn_hash,
            is_xa,
        })
    }
}
