use crate::{protocol::util_sync, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};
use debug_ignore::DebugIgnore;
use std::collections::HashMap;

/// Payload of the `Connect` request.
///
/// The URL still contains `${…}` placeholders; they are resolved server-side
/// after validation. The client id groups the sessions a single driver
/// instance opens.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectRequest {
    url: String,
    datasource: String,
    user: String,
    password: DebugIgnore<String>,
    client_id: uuid::Uuid,
    is_xa: bool,
    properties: HashMap<String, String>,
}

impl ConnectRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        datasource: String,
        user: String,
        password: String,
        client_id: uuid::Uuid,
        is_xa: bool,
        properties: HashMap<String, String>,
    ) -> Self {
        Self {
            url,
            datasource,
            user,
            password: DebugIgnore(password),
            client_id,
            is_xa,
            properties,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn datasource(&self) -> &str {
        &self.datasource
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn client_id(&self) -> uuid::Uuid {
        self.client_id
    }

    pub fn is_xa(&self) -> bool {
        self.is_xa
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn size(&self) -> usize {
        util_sync::string_size(&self.url)
            + util_sync::string_size(&self.datasource)
            + util_sync::string_size(&self.user)
            + util_sync::string_size(&self.password)
            + 16
            + 1
            + 4
            + self
                .properties
                .iter()
                .map(|(k, v)| util_sync::string_size(k) + util_sync::string_size(v))
                .sum::<usize>()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        util_sync::emit_string(&self.url, w).await?;
        util_sync::emit_string(&self.datasource, w).await?;
        util_sync::emit_string(&self.user, w).await?;
        util_sync::emit_string(&self.password, w).await?;
        w.write_all(self.client_id.as_bytes()).await?;
        w.write_u8(u8::from(self.is_xa)).await?;
        w.write_u32_le(self.properties.len() as u32).await?;
        // deterministic order keeps request bytes reproducible
        let mut keys: Vec<&String> = self.properties.keys().collect();
        keys.sort();
        for k in keys {
            util_sync::emit_string(k, w).await?;
            util_sync::emit_string(&self.properties[k], w).await?;
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let url = util_sync::parse_string(rdr)?;
        let datasource = util_sync::parse_string(rdr)?;
        let user = util_sync::parse_string(rdr)?;
        let password = DebugIgnore(util_sync::parse_string(rdr)?);
        let client_id = util_sync::parse_uuid(rdr)?;
        let is_xa = rdr.read_u8()? != 0;
        let no_of_props = rdr.read_u32::<LittleEndian>()?;
        let mut properties = HashMap::with_capacity(no_of_props as usize);
        for _ in 0..no_of_props {
            let k = util_sync::parse_string(rdr)?;
            let v = util_sync::parse_string(rdr)?;
            properties.insert(k, v);
        }
        Ok(Self {
            url,
            datasource,
            user,
            password,
            client_id,
            is_xa,
            properties,
        })
    }
}
