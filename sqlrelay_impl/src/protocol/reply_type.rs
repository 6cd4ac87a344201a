use crate::{RelayError, RelayResult};

// The semantic category of a reply, as sent by the server.
// The discriminants are part of the wire protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyType {
    Nil = 0,              // Successful, no specific payload
    Connected = 1,        // Reply to Connect, carries SessionInfo
    ExecutionResults = 2, // Reply to updates, carries counts
    ResultSet = 3,        // Reply to a query, carries metadata and the first block
    Fetch = 4,            // Reply to FetchNext, carries one block
    Prepared = 5,         // Reply to Prepare, carries the statement handle
    CallReply = 6,        // Reply to CallResource
    ReadLob = 7,
    WriteLob = 8,
    XaResponse = 9,
    Pong = 10,
    Error = 15,
}

impl ReplyType {
    pub(crate) fn try_from_u8(i: u8) -> RelayResult<Self> {
        Ok(match i {
            0 => Self::Nil,
            1 => Self::Connected,
            2 => Self::ExecutionResults,
            3 => Self::ResultSet,
            4 => Self::Fetch,
            5 => Self::Prepared,
            6 => Self::CallReply,
            7 => Self::ReadLob,
            8 => Self::WriteLob,
            9 => Self::XaResponse,
            10 => Self::Pong,
            15 => Self::Error,
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid reply type {i} on the wire"
                )))
            }
        })
    }
}
