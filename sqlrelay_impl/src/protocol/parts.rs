mod call_reply;
mod call_request;
mod client_info;
mod connect_request;
mod execution_result;
mod fetch_request;
mod read_lob_reply;
mod read_lob_request;
mod resource;
mod result_set_block;
mod resultset_metadata;
mod server_error;
mod session_info;
mod session_options;
mod topology;
mod write_lob_reply;
mod write_lob_request;
mod xat_options;

pub use self::{
    call_reply::{CallReply, CallValue},
    call_request::{CallMethod, CallRequest, CallStep},
    client_info::ClientInfo,
    connect_request::ConnectRequest,
    execution_result::ExecutionResult,
    fetch_request::FetchRequest,
    read_lob_reply::ReadLobReply,
    read_lob_request::ReadLobRequest,
    resource::{ResourceKind, ResourceRef},
    result_set_block::ResultSetBlock,
    resultset_metadata::{FieldMetadata, ResultSetMetadata},
    server_error::{ServerError, Severity},
    session_info::SessionInfo,
    session_options::SessionOptions,
    topology::{EndpointAddr, Topology},
    write_lob_reply::WriteLobReply,
    write_lob_request::{LobKind, WriteLobRequest},
    xat_options::{xa_flags, XatOptions, Xid},
};

use crate::protocol::{Part, PartKind};

/// The ordered parts of a request or reply message.
#[derive(Debug, Default)]
pub struct Parts(Vec<Part>);

impl Parts {
    pub fn push(&mut self, part: Part) {
        self.0.push(part);
    }

    pub fn pop(&mut self) -> Option<Part> {
        self.0.pop()
    }

    pub fn pop_if_kind(&mut self, kind: PartKind) -> Option<Part> {
        match self.0.last() {
            Some(part) if (part.kind() == kind) => self.0.pop(),
            _ => None,
        }
    }

    pub fn drop_parts_of_kind(&mut self, kind: PartKind) {
        self.0.retain(|part| part.kind() != kind);
    }

    /// Removes and returns the first part of the given kind, wherever it
    /// sits in the message.
    pub fn extract(&mut self, kind: PartKind) -> Option<Part> {
        self.0
            .iter()
            .position(|part| part.kind() == kind)
            .map(|i| self.0.remove(i))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn ref_inner(&self) -> &Vec<Part> {
        &self.0
    }
}

impl IntoIterator for Parts {
    type Item = Part;
    type IntoIter = std::vec::IntoIter<Part>;
    fn into_iter(self) -> std::vec::IntoIter<Part> {
        self.0.into_iter()
    }
}
