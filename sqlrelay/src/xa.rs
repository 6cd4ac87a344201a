//! The XA face of a connection, for use by a transaction manager.

use crate::connection::ConnectionInner;
use sqlrelay_impl::{
    protocol::{
        parts::XatOptions,
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    xa_flags, RelayError, RelayResult, Xid,
};
use std::sync::Arc;

/// Drives the two-phase-commit verbs of one XA-enabled connection.
///
/// The proxy maps each verb onto the back-end resource manager and enforces
/// the per-datasource branch limit; a `start` beyond the limit fails with
/// `xa-limit-reached` after the configured wait.
#[derive(Debug)]
pub struct XaSession {
    conn: Arc<ConnectionInner>,
}

impl XaSession {
    pub(crate) fn new(conn: Arc<ConnectionInner>) -> Self {
        Self { conn }
    }

    async fn verb(
        &self,
        message_type: MessageType,
        o_xid: Option<&Xid>,
        flags: u32,
    ) -> RelayResult<XatOptions> {
        debug!("XaSession::{message_type:?}");
        let mut xat = XatOptions::default();
        if let Some(xid) = o_xid {
            xat.set_xid(xid.clone());
        }
        xat.set_flags(flags);
        let mut request = Request::new(message_type);
        request.push(Part::XatOptions(xat));
        let mut reply: Reply = self.conn.request(&request).await?;
        reply.assert_expected_reply_type(ReplyType::XaResponse)?;
        match reply.parts.extract(PartKind::XatOptions) {
            Some(Part::XatOptions(response)) => Ok(response),
            _ => Err(RelayError::Impl("XatOptions part missing")),
        }
    }

    pub async fn start(&self, xid: &Xid, flags: u32) -> RelayResult<()> {
        self.verb(MessageType::XaStart, Some(xid), flags).await.map(|_| ())
    }

    pub async fn end(&self, xid: &Xid, flags: u32) -> RelayResult<()> {
        self.verb(MessageType::XaEnd, Some(xid), flags).await.map(|_| ())
    }

    /// Returns the prepare vote of the back-end.
    pub async fn prepare(&self, xid: &Xid) -> RelayResult<i32> {
        let response = self
            .verb(MessageType::XaPrepare, Some(xid), xa_flags::NONE)
            .await?;
        response
            .return_code()
            .ok_or(RelayError::Impl("Prepare returned no vote"))
    }

    pub async fn commit(&self, xid: &Xid, one_phase: bool) -> RelayResult<()> {
        let flags = if one_phase {
            xa_flags::ONE_PHASE
        } else {
            xa_flags::NONE
        };
        self.verb(MessageType::XaCommit, Some(xid), flags).await.map(|_| ())
    }

    pub async fn rollback(&self, xid: &Xid) -> RelayResult<()> {
        self.verb(MessageType::XaRollback, Some(xid), xa_flags::NONE)
            .await
            .map(|_| ())
    }

    pub async fn forget(&self, xid: &Xid) -> RelayResult<()> {
        self.verb(MessageType::XaForget, Some(xid), xa_flags::NONE)
            .await
            .map(|_| ())
    }

    /// The xids of in-doubt branches the back-end knows about.
    pub async fn recover(&self, flags: u32) -> RelayResult<Vec<Xid>> {
        let response = self.verb(MessageType::XaRecover, None, flags).await?;
        Ok(response.into_xids())
    }
}
