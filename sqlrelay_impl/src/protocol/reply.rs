use crate::{
    protocol::{Part, PartKind, Parts, ReplyType, MESSAGE_HEADER_SIZE},
    RelayError, RelayResult,
};

#[derive(Debug)]
pub struct Reply {
    reply_type: ReplyType,
    session_id: uuid::Uuid,
    seq_number: i32,
    pub parts: Parts,
}

impl Reply {
    pub fn new(reply_type: ReplyType) -> Reply {
        Reply {
            reply_type,
            session_id: uuid::Uuid::nil(),
            seq_number: 0,
            parts: Parts::default(),
        }
    }

    pub fn reply_type(&self) -> ReplyType {
        self.reply_type
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn seq_number(&self) -> i32 {
        self.seq_number
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn assert_expected_reply_type(&self, reply_type: ReplyType) -> RelayResult<()> {
        if self.reply_type == reply_type {
            Ok(())
        } else {
            Err(RelayError::ImplDetailed(format!(
                "Expected reply type {:?}, got {:?}",
                reply_type, self.reply_type
            )))
        }
    }

    /// Turns an error reply into the error it carries.
    ///
    /// Warnings are split off and returned separately so the caller can
    /// accumulate them on its session.
    pub fn evaluate_error_part(&mut self) -> RelayResult<Vec<crate::ServerError>> {
        use crate::Severity;
        let mut warnings = Vec::new();
        if let Some(Part::Error(server_errors)) = self.parts.pop_if_kind(PartKind::Error) {
            let mut errors = Vec::new();
            for server_error in server_errors {
                match server_error.severity() {
                    Severity::Warning => warnings.push(server_error),
                    _ => errors.push(server_error),
                }
            }
            if let Some(first) = errors.into_iter().next() {
                return Err(RelayError::Backend { source: first });
            }
        }
        Ok(warnings)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub async fn emit<W: std::marker::Unpin + tokio::io::AsyncWriteExt>(
        &self,
        session_id: uuid::Uuid,
        seq_number: i32,
        w: &mut W,
    ) -> RelayResult<()> {
        let varpart_size: u32 = self
            .parts
            .ref_inner()
            .iter()
            .map(|part| part.size() as u32)
            .sum();
        debug!(
            "Reply::emit() of type {:?} for session_id = {}, seq_number = {}",
            self.reply_type, session_id, seq_number
        );

        // MESSAGE HEADER
        w.write_all(session_id.as_bytes()).await?; // B16
        w.write_i32_le(seq_number).await?; // I4
        w.write_u32_le(varpart_size).await?; // UI4
        w.write_u16_le(self.parts.len() as u16).await?; // UI2
        w.write_u8(self.reply_type as u8).await?; // I1
        for _ in 0..5_u8 {
            w.write_u8(0).await?;
        } // B5 (filler)

        // PARTS
        for part in self.parts.ref_inner() {
            part.emit(w).await?;
        }
        w.flush().await?;
        Ok(())
    }

    pub async fn parse<R: std::marker::Unpin + tokio::io::AsyncReadExt>(
        rdr: &mut R,
    ) -> RelayResult<Reply> {
        let mut header = [0_u8; MESSAGE_HEADER_SIZE as usize];
        rdr.read_exact(&mut header).await?;
        let session_id = uuid::Uuid::from_bytes(header[0..16].try_into().unwrap_or_default());
        let seq_number = i32::from_le_bytes(header[16..20].try_into().unwrap_or_default());
        let varpart_size = u32::from_le_bytes(header[20..24].try_into().unwrap_or_default());
        let no_of_parts = u16::from_le_bytes(header[24..26].try_into().unwrap_or_default());
        let reply_type = ReplyType::try_from_u8(header[26])?;

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

        Ok(Reply {
            reply_type,
            session_id,
            seq_number,
            parts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Reply, ReplyType};
    use crate::protocol::{parts::SessionInfo, MessageType, Part, Request};

    #[tokio::test]
    async fn request_frames_round_trip() {
        let session_id = uuid::Uuid::new_v4();
        let mut request = Request::new(MessageType::ExecuteQuery);
        request.push(Part::Command("select 1 from dummy".to_string()));

        let mut wire = Vec::<u8>::new();
        request.emit(session_id, 7, &mut wire).await.unwrap();

        let parsed = Request::parse(None, &mut wire.as_slice()).await.unwrap();
        assert_eq!(parsed.session_id(), session_id);
        assert_eq!(parsed.seq_number(), 7);
        assert_eq!(parsed.message_type(), MessageType::ExecuteQuery);
        assert_eq!(parsed.parts.len(), 1);
    }

    #[tokio::test]
    async fn reply_frames_round_trip() {
        let session_id = uuid::Uuid::new_v4();
        let mut reply = Reply::new(ReplyType::Connected);
        reply.push(Part::SessionInfo(SessionInfo::new(
            session_id,
            "abcd".to_string(),
            false,
        )));

        let mut wire = Vec::<u8>::new();
        reply.emit(session_id, 1, &mut wire).await.unwrap();

        let mut parsed = Reply::parse(&mut wire.as_slice()).await.unwrap();
        parsed.assert_expected_reply_type(ReplyType::Connected).unwrap();
        match parsed.parts.pop() {
            Some(Part::SessionInfo(si)) => assert_eq!(si.session_id(), session_id),
            other => panic!("Unexpected part {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected() {
        let mut request = Request::new(MessageType::ExecuteDirect);
        request.push(Part::Command("x".repeat(1000)));
        let mut wire = Vec::<u8>::new();
        request
            .emit(uuid::Uuid::nil(), 1, &mut wire)
            .await
            .unwrap();
        assert!(Request::parse(Some(100), &mut wire.as_slice())
            .await
            .is_err());
    }
}
