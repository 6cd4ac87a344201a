mod message_type;
mod part;
mod part_kind;
pub mod parts;
mod reply;
mod reply_type;
mod request;
pub(crate) mod util_sync;

pub use self::{
    message_type::MessageType, part::Part, part_kind::PartKind, parts::Parts, reply::Reply,
    reply_type::ReplyType, request::Request,
};

pub(crate) const MESSAGE_HEADER_SIZE: u32 = 32;
pub(crate) const PART_HEADER_SIZE: usize = 8;
