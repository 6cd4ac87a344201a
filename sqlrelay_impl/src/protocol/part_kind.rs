use crate::{RelayError, RelayResult};

// Identifies the payload type of a part.
// The discriminants are part of the wire protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartKind {
    ClientInfo = 1,
    Command = 2,
    ConnectRequest = 3,
    SessionInfo = 4,
    Error = 5,
    ExecutionResults = 6,
    FetchRequest = 7,
    ParameterValues = 8,
    ReadLobRequest = 9,
    ReadLobReply = 10,
    WriteLobRequest = 11,
    WriteLobReply = 12,
    CallRequest = 13,
    CallReply = 14,
    ResourceId = 15,
    ResultSetBlock = 16,
    ResultSetMetadata = 17,
    SessionOptions = 18,
    Topology = 19,
    XatOptions = 20,
}

impl PartKind {
    pub(crate) fn try_from_u8(i: u8) -> RelayResult<Self> {
        Ok(match i {
            1 => Self::ClientInfo,
            2 => Self::Command,
            3 => Self::ConnectRequest,
            4 => Self::SessionInfo,
            5 => Self::Error,
            6 => Self::ExecutionResults,
            7 => Self::FetchRequest,
            8 => Self::ParameterValues,
            9 => Self::ReadLobRequest,
            10 => Self::ReadLobReply,
            11 => Self::WriteLobRequest,
            12 => Self::WriteLobReply,
            13 => Self::CallRequest,
            14 => Self::CallReply,
            15 => Self::ResourceId,
            16 => Self::ResultSetBlock,
            17 => Self::ResultSetMetadata,
            18 => Self::SessionOptions,
            19 => Self::Topology,
            20 => Self::XatOptions,
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid part kind {i} on the wire"
                )))
            }
        })
    }
}
