use crate::{RelayError, RelayResult};

// Defines the action requested from the proxy server.
// The discriminants are part of the wire protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageType {
    Connect = 1,          // Registers the datasource and opens a logical session
    Disconnect = 2,       // Terminates a session
    ExecuteDirect = 3,    // Directly execute a SQL statement (kind auto-detected)
    ExecuteUpdate = 4,    // Execute a SQL statement that returns an update count
    ExecuteQuery = 5,     // Execute a SQL statement that returns a result set
    Prepare = 6,          // Prepare a SQL statement
    ExecutePrepared = 7,  // Execute a previously prepared SQL statement
    FetchNext = 8,        // Fetches the next block from a result set
    CloseResultSet = 9,   // Closes a result set
    DropStatement = 10,   // Drops a (prepared) statement handle
    CallResource = 11,    // Invokes a method on a session resource
    WriteLob = 12,        // Writes large object data
    ReadLob = 13,         // Reads large object data
    Ping = 14,            // Health probe, also used by the driver's endpoint monitor
    XaStart = 20,
    XaEnd = 21,
    XaPrepare = 22,
    XaCommit = 23,
    XaRollback = 24,
    XaRecover = 25,
    XaForget = 26,
}

impl MessageType {
    // Requests that can be re-sent to another endpoint after a connection-level
    // failure without risking a duplicated effect. Fetches advance a cursor and
    // executes may mutate, so neither is repeatable; LOB reads are addressed
    // by absolute position.
    pub fn is_repeatable(self) -> bool {
        matches!(self, Self::Ping | Self::ReadLob)
    }

    pub(crate) fn try_from_u8(i: u8) -> RelayResult<Self> {
        Ok(match i {
            1 => Self::Connect,
            2 => Self::Disconnect,
            3 => Self::ExecuteDirect,
            4 => Self::ExecuteUpdate,
            5 => Self::ExecuteQuery,
            6 => Self::Prepare,
            7 => Self::ExecutePrepared,
            8 => Self::FetchNext,
            9 => Self::CloseResultSet,
            10 => Self::DropStatement,
            11 => Self::CallResource,
            12 => Self::WriteLob,
            13 => Self::ReadLob,
            14 => Self::Ping,
            20 => Self::XaStart,
            21 => Self::XaEnd,
            22 => Self::XaPrepare,
            23 => Self::XaCommit,
            24 => Self::XaRollback,
            25 => Self::XaRecover,
            26 => Self::XaForget,
            i => {
                return Err(RelayError::ImplDetailed(format!(
                    "Invalid message type {i} on the wire"
                )))
            }
        })
    }
}
