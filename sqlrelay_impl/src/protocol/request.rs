//! Request messages as sent by the driver and parsed by the server.
//!
//! A message is a fixed header followed by its parts; requests and replies
//! share the framing but are modelled separately.
use crate::{
    protocol::{MessageType, Part, Parts, MESSAGE_HEADER_SIZE},
    RelayError, RelayResult,
};

// Packets having the same sequence number belong to one request/response pair.
#[derive(Debug)]
pub struct Request {
    message_type: MessageType,
    auto_commit: bool,
    session_id: uuid::Uuid,
    seq_number: i32,
    pub parts: Parts,
}

impl Request {
    pub fn new(message_type: MessageType) -> Request {
        Request {
            message_type,
            auto_commit: true,
            session_id: uuid::Uuid::nil(),
            seq_number: 0,
            parts: Parts::default(),
        }
    }

    pub fn new_for_disconnect() -> Request {
        Request::new(MessageType::Disconnect)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// The session the request belongs to; nil before `Connect` succeeded.
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Routes the request to a session; in-process callers set this instead
    /// of passing the id to `emit`.
    pub fn set_session_id(&mut self, session_id: uuid::Uuid) {
        self.session_id = session_id;
    }

    pub fn seq_number(&self) -> i32 {
        self.seq_number
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        session_id: uuid::Uuid,
        seq_number: i32,
        w: &mut W,
    ) -> RelayResult<()> {
        let varpart_size = self.varpart_size();
        debug!(
            "Request::emit() of type {:?} for session_id = {}, seq_number = {}",
            self.message_type, session_id, seq_number
        );

        // MESSAGE HEADER
        w.write_all(session_id.as_bytes()).await?; // B16
        w.write_i32_le(seq_number).await?; // I4
        w.write_u32_le(varpart_size).await?; // UI4
        w.write_u16_le(self.parts.len() as u16).await?; // UI2
        w.write_u8(self.message_type as u8).await?; // I1
        w.write_u8(u8::from(self.auto_commit)).await?; // I1
        for _ in 0..4_u8 {
            w.write_u8(0).await?;
        } // B4 (filler)
        trace!("Header is written");

        // PARTS
        for part in self.parts.ref_inner() {
            part.emit(w).await?;
        }
        w.flush().await?;
        trace!("Parts are written");
        Ok(())
    }

    /// Reads one request message, first the fixed header, then the variable
    /// part, which is parsed from an in-memory buffer.
    ///
    /// `o_max_varpart_size` guards the server against oversized requests.
    pub async fn parse<R: std::marker::Unpin + tokio::io::AsyncReadExt>(
        o_max_varpart_size: Option<u32>,
        rdr: &mut R,
    ) -> RelayResult<Request> {
        let mut header = [0_u8; MESSAGE_HEADER_SIZE as usize];
        rdr.read_exact(&mut header).await?;
        let session_id = uuid::Uuid::from_bytes(header[0..16].try_into().unwrap_or_default());
        let seq_number = i32::from_le_bytes(header[16..20].try_into().unwrap_or_default());
        let varpart_size = u32::from_le_bytes(header[20..24].try_into().unwrap_or_default());
        let no_of_parts = u16::from_le_bytes(header[24..26].try_into().unwrap_or_default());
        let message_type = MessageType::try_from_u8(header[26])?;
        let auto_commit = header[27] != 0;

        if let Some(max) = o_max_varpart_size {
            if varpart_size > max {
                return Err(RelayError::UsageDetailed(format!(
                    "Request of {varpart_size} bytes exceeds the configured maximum of {max}"
                )));
            }
        }

        let varpart = {
            let mut buf = vec![0_u8; varpart_size as usize];
            rdr.read_exact(&mut buf).await?;
            buf
        };
        let mut cursor = std::io::Cursor::new(varpart);
        let mut parts = Parts::default();
        for _ in 0..no_of_parts {
            parts.push(Part::parse(&mut cursor)?);
        }

        Ok(Request {
            message_type,
            auto_commit,
            session_id,
            seq_number,
            parts,
        })
    }

    // Length in bytes of the variable part of the message, i.e. total message
    // without the header
    #[allow(clippy::cast_possible_truncation)]
    fn varpart_size(&self) -> u32 {
        self.parts
            .ref_inner()
            .iter()
            .map(|part| part.size() as u32)
            .sum()
    }
}

