//! One framed RPC connection to one proxy endpoint.

use sqlrelay_impl::{
    protocol::{Reply, ReplyType, Request},
    EndpointAddr, RelayError, RelayResult, ServerError,
};
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use uuid::Uuid;

#[derive(Debug)]
pub(crate) struct RpcChannel {
    addr: EndpointAddr,
    stream: BufStream<TcpStream>,
    seq_number: i32,
}

impl RpcChannel {
    pub(crate) async fn open(addr: &EndpointAddr) -> RelayResult<Self> {
        trace!("Opening channel to {addr}");
        let stream = TcpStream::connect((addr.host(), addr.port()))
            .await
            .map_err(|e| RelayError::TransportFailure(format!("connect to {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            addr: addr.clone(),
            stream: BufStream::new(stream),
            seq_number: 0,
        })
    }

    fn next_seq_number(&mut self) -> i32 {
        self.seq_number += 1;
        self.seq_number
    }

    /// Sends a request and reads exactly one reply. Error replies become
    /// errors; warning-severity entries are handed back for the caller to
    /// accumulate.
    pub(crate) async fn roundtrip(
        &mut self,
        session_id: Uuid,
        request: &Request,
    ) -> RelayResult<(Reply, Vec<ServerError>)> {
        let seq_number = self.next_seq_number();
        request
            .emit(session_id, seq_number, &mut self.stream)
            .await
            .map_err(into_transport_failure)?;
        let mut reply = Reply::parse(&mut self.stream)
            .await
            .map_err(into_transport_failure)?;
        let warnings = reply.evaluate_error_part()?;
        Ok((reply, warnings))
    }

    /// Sends a request that the server answers with a reply stream; replies
    /// are read one by one with [`read_stream_reply`](Self::read_stream_reply).
    pub(crate) async fn send(&mut self, session_id: Uuid, request: &Request) -> RelayResult<()> {
        let seq_number = self.next_seq_number();
        request
            .emit(session_id, seq_number, &mut self.stream)
            .await
            .map_err(into_transport_failure)
    }

    pub(crate) async fn read_stream_reply(&mut self) -> RelayResult<Reply> {
        let mut reply = Reply::parse(&mut self.stream)
            .await
            .map_err(into_transport_failure)?;
        reply.evaluate_error_part()?;
        Ok(reply)
    }

    /// One health probe; the channel is fresh and dropped by the prober.
    pub(crate) async fn ping(&mut self, timeout: Duration) -> RelayResult<()> {
        let request = Request::new(sqlrelay_impl::protocol::MessageType::Ping);
        let (reply, _) = tokio::time::timeout(timeout, self.roundtrip(Uuid::nil(), &request))
            .await
            .map_err(|_elapsed| {
                RelayError::TransportFailure(format!("ping to {} timed out", self.addr))
            })??;
        reply.assert_expected_reply_type(ReplyType::Pong)
    }
}

fn into_transport_failure(e: RelayError) -> RelayError {
    match e {
        RelayError::Io { source } => RelayError::TransportFailure(source.to_string()),
        other => other,
    }
}
