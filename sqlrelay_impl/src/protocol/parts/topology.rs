use crate::{protocol::util_sync, RelayResult};
use byteorder::{LittleEndian, ReadBytesExt};

/// One proxy endpoint as advertised to drivers.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct EndpointAddr {
    host: String,
    port: u16,
}

impl EndpointAddr {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for EndpointAddr {
    type Err = crate::RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| crate::RelayError::UsageDetailed(format!("Not an endpoint: {s}")))?;
        let port = port
            .parse()
            .map_err(|_| crate::RelayError::UsageDetailed(format!("Not an endpoint: {s}")))?;
        Ok(Self::new(host.to_string(), port))
    }
}

/// The set of proxy endpoints a server advertises on connect; feeds the
/// driver's endpoint monitor.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Topology {
    endpoints: Vec<EndpointAddr>,
}

impl Topology {
    pub fn new(endpoints: Vec<EndpointAddr>) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &[EndpointAddr] {
        &self.endpoints
    }

    pub(crate) fn count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn size(&self) -> usize {
        self.endpoints
            .iter()
            .map(|e| util_sync::string_size(&e.host) + 2)
            .sum()
    }

    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        for endpoint in &self.endpoints {
            util_sync::emit_string(&endpoint.host, w).await?;
            w.write_u16_le(endpoint.port).await?;
        }
        Ok(())
    }

    pub fn parse(no_of_args: usize, rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let mut endpoints = Vec::with_capacity(no_of_args);
        for _ in 0..no_of_args {
            let host = util_sync::parse_string(rdr)?;
            let port = rdr.read_u16::<LittleEndian>()?;
            endpoints.push(EndpointAddr::new(host, port));
        }
        Ok(Self { endpoints })
    }
}
