use crate::{
    protocol::{
        parts::{
            CallReply, CallRequest, ClientInfo, ConnectRequest, ExecutionResult, FetchRequest,
            ReadLobReply, ReadLobRequest, ResourceRef, ResultSetBlock, ResultSetMetadata,
            ServerError, SessionInfo, SessionOptions, Topology, WriteLobReply, WriteLobRequest,
            XatOptions,
        },
        util_sync, PartKind, PART_HEADER_SIZE,
    },
    RelayError, RelayResult, RelayValue,
};
use byteorder::{LittleEndian, ReadBytesExt};

#[derive(Debug)]
pub enum Part {
    CallReply(CallReply),
    CallRequest(CallRequest),
    ClientInfo(ClientInfo),
    Command(String),
    ConnectRequest(ConnectRequest),
    Error(Vec<ServerError>),
    ExecutionResults(Vec<ExecutionResult>),
    FetchRequest(FetchRequest),
    ParameterValues(Vec<RelayValue>),
    ReadLobRequest(ReadLobRequest),
    ReadLobReply(ReadLobReply),
    ResourceId(ResourceRef),
    ResultSetBlock(ResultSetBlock),
    ResultSetMetadata(ResultSetMetadata),
    SessionInfo(SessionInfo),
    SessionOptions(SessionOptions),
    Topology(Topology),
    WriteLobRequest(WriteLobRequest),
    WriteLobReply(WriteLobReply),
    XatOptions(XatOptions),
}

impl Part {
    pub fn kind(&self) -> PartKind {
        match self {
            Self::CallReply(_) => PartKind::CallReply,
            Self::CallRequest(_) => PartKind::CallRequest,
            Self::ClientInfo(_) => PartKind::ClientInfo,
            Self::Command(_) => PartKind::Command,
            Self::ConnectRequest(_) => PartKind::ConnectRequest,
            Self::Error(_) => PartKind::Error,
            Self::ExecutionResults(_) => PartKind::ExecutionResults,
            Self::FetchRequest(_) => PartKind::FetchRequest,
            Self::ParameterValues(_) => PartKind::ParameterValues,
            Self::ReadLobRequest(_) => PartKind::ReadLobRequest,
            Self::ReadLobReply(_) => PartKind::ReadLobReply,
            Self::ResourceId(_) => PartKind::ResourceId,
            Self::ResultSetBlock(_) => PartKind::ResultSetBlock,
            Self::ResultSetMetadata(_) => PartKind::ResultSetMetadata,
            Self::SessionInfo(_) => PartKind::SessionInfo,
            Self::SessionOptions(_) => PartKind::SessionOptions,
            Self::Topology(_) => PartKind::Topology,
            Self::WriteLobRequest(_) => PartKind::WriteLobRequest,
            Self::WriteLobReply(_) => PartKind::WriteLobReply,
            Self::XatOptions(_) => PartKind::XatOptions,
        }
    }

    fn arg_count(&self) -> usize {
        match self {
            Self::Error(v) => v.len(),
            Self::ExecutionResults(v) => v.len(),
            Self::ParameterValues(v) => v.len(),
            Self::ResultSetMetadata(rsmd) => rsmd.len(),
            Self::Topology(topology) => topology.count(),
            Self::ClientInfo(ci) => ci.count(),
            _ => 1,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            Self::CallReply(cr) => cr.size(),
            Self::CallRequest(cr) => cr.size(),
            Self::ClientInfo(ci) => ci.size(),
            Self::Command(s) => util_sync::string_size(s),
            Self::ConnectRequest(cr) => cr.size(),
            Self::Error(v) => v.iter().map(ServerError::size).sum(),
            Self::ExecutionResults(v) => v.iter().map(ExecutionResult::size).sum(),
            Self::FetchRequest(_) => FetchRequest::size(),
            Self::ParameterValues(v) => v.iter().map(RelayValue::size).sum(),
            Self::ReadLobRequest(_) => ReadLobRequest::size(),
            Self::ReadLobReply(r) => r.size(),
            Self::ResourceId(_) => ResourceRef::size(),
            Self::ResultSetBlock(b) => b.size(),
            Self::ResultSetMetadata(rsmd) => rsmd.size(),
            Self::SessionInfo(si) => si.size(),
            Self::SessionOptions(_) => SessionOptions::size(),
            Self::Topology(t) => t.size(),
            Self::WriteLobRequest(r) => r.size(),
            Self::WriteLobReply(_) => WriteLobReply::size(),
            Self::XatOptions(x) => x.size(),
        }
    }

    /// Size of the part on the wire, including the part header.
    pub fn size(&self) -> usize {
        PART_HEADER_SIZE + self.body_size()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        w: &mut W,
    ) -> std::io::Result<()> {
        // PART HEADER
        w.write_u8(self.kind() as u8).await?; // I1
        w.write_u8(0).await?; // I1 (filler)
        w.write_u16_le(self.arg_count() as u16).await?; // I2
        w.write_u32_le(self.body_size() as u32).await?; // I4

        match self {
            Self::CallReply(cr) => cr.emit(w).await?,
            Self::CallRequest(cr) => cr.emit(w).await?,
            Self::ClientInfo(ci) => ci.emit(w).await?,
            Self::Command(s) => util_sync::emit_string(s, w).await?,
            Self::ConnectRequest(cr) => cr.emit(w).await?,
            Self::Error(v) => {
                for server_error in v {
                    server_error.emit(w).await?;
                }
            }
            Self::ExecutionResults(v) => {
                for execution_result in v {
                    execution_result.emit(w).await?;
                }
            }
            Self::FetchRequest(fr) => fr.emit(w).await?,
            Self::ParameterValues(v) => {
                for value in v {
                    value.emit(w).await?;
                }
            }
            Self::ReadLobRequest(r) => r.emit(w).await?,
            Self::ReadLobReply(r) => r.emit(w).await?,
            Self::ResourceId(r) => r.emit(w).await?,
            Self::ResultSetBlock(b) => b.emit(w).await?,
            Self::ResultSetMetadata(rsmd) => rsmd.emit(w).await?,
            Self::SessionInfo(si) => si.emit(w).await?,
            Self::SessionOptions(so) => so.emit(w).await?,
            Self::Topology(t) => t.emit(w).await?,
            Self::WriteLobRequest(r) => r.emit(w).await?,
            Self::WriteLobReply(r) => r.emit(w).await?,
            Self::XatOptions(x) => x.emit(w).await?,
        }
        Ok(())
    }

    pub fn parse(rdr: &mut std::io::Cursor<Vec<u8>>) -> RelayResult<Self> {
        let kind = PartKind::try_from_u8(rdr.read_u8()?)?;
        util_sync::skip_bytes(1, rdr)?; // filler
        let no_of_args = rdr.read_u16::<LittleEndian>()? as usize;
        let body_size = u64::from(rdr.read_u32::<LittleEndian>()?);
        let start = rdr.position();

        let part = match kind {
            PartKind::CallReply => Self::CallReply(CallReply::parse(rdr)?),
            PartKind::CallRequest => Self::CallRequest(CallRequest::parse(rdr)?),
            PartKind::ClientInfo => Self::ClientInfo(ClientInfo::parse(rdr)?),
            PartKind::Command => Self::Command(util_sync::parse_string(rdr)?),
            PartKind::ConnectRequest => Self::ConnectRequest(ConnectRequest::parse(rdr)?),
            PartKind::Error => Self::Error(ServerError::parse(no_of_args, rdr)?),
            PartKind::ExecutionResults => {
                Self::ExecutionResults(ExecutionResult::parse(no_of_args, rdr)?)
            }
            PartKind::FetchRequest => Self::FetchRequest(FetchRequest::parse(rdr)?),
            PartKind::ParameterValues => {
                let mut values = Vec::with_capacity(no_of_args);
                for _ in 0..no_of_args {
                    values.push(RelayValue::parse(rdr)?);
                }
                Self::ParameterValues(values)
            }
            PartKind::ReadLobRequest => Self::ReadLobRequest(ReadLobRequest::parse(rdr)?),
            PartKind::ReadLobReply => Self::ReadLobReply(ReadLobReply::parse(rdr)?),
            PartKind::ResourceId => Self::ResourceId(ResourceRef::parse(rdr)?),
            PartKind::ResultSetBlock => Self::ResultSetBlock(ResultSetBlock::parse(rdr)?),
            PartKind::ResultSetMetadata => {
                Self::ResultSetMetadata(ResultSetMetadata::parse(no_of_args, rdr)?)
            }
            PartKind::SessionInfo => Self::SessionInfo(SessionInfo::parse(rdr)?),
            PartKind::SessionOptions => Self::SessionOptions(SessionOptions::parse(rdr)?),
            PartKind::Topology => Self::Topology(Topology::parse(no_of_args, rdr)?),
            PartKind::WriteLobRequest => Self::WriteLobRequest(WriteLobRequest::parse(rdr)?),
            PartKind::WriteLobReply => Self::WriteLobReply(WriteLobReply::parse(rdr)?),
            PartKind::XatOptions => Self::XatOptions(XatOptions::parse(rdr)?),
        };

        let consumed = rdr.position() - start;
        if consumed != body_size {
            return Err(RelayError::ImplDetailed(format!(
                "Part of kind {kind:?} declared {body_size} bytes but parsing consumed {consumed}"
            )));
        }
        Ok(part)
    }
}
