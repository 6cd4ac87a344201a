//! The accept loop: framed request/reply handling per client connection.
//!
//! Each TCP connection carries a sequence of requests; replies (and streamed
//! reply sequences) go back over the same connection. A bounded semaphore
//! caps the number of concurrently processed requests across the process.

use crate::dispatcher::{Dispatcher, Outcome};
use crate::ipfilter::IpFilter;
use sqlrelay_impl::{
    protocol::{Reply, Request},
    RelayError, RelayResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

#[derive(Debug)]
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    filter: IpFilter,
    workers: Arc<Semaphore>,
    max_request_size: u32,
    idle_timeout: Duration,
}

impl Server {
    pub fn new(dispatcher: Arc<Dispatcher>) -> RelayResult<Self> {
        let config = dispatcher.config();
        let filter = IpFilter::parse(&config.allowed_ips)?;
        Ok(Self {
            workers: Arc::new(Semaphore::new(config.thread_pool_size)),
            max_request_size: config.max_request_size,
            idle_timeout: Duration::from_millis(config.connection_idle_timeout_ms),
            filter,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Binds the configured port and returns the listener, so the caller
    /// learns the actual address before serving starts.
    pub async fn bind(&self) -> RelayResult<TcpListener> {
        let addr = format!("0.0.0.0:{}", self.dispatcher.config().port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            RelayError::ConfigInvalid(format!("Cannot bind {addr}: {e}"))
        })?;
        info!("Listening on {addr}");
        Ok(listener)
    }

    /// Accepts connections until the listener fails or the task is aborted.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> RelayResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let allowed = self.filter.check(peer.ip()).is_ok();
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, allowed).await {
                    debug!("Connection from {peer} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, allowed: bool) -> RelayResult<()> {
        stream.set_nodelay(true).ok();
        let (mut rd, wr) = stream.into_split();
        let mut wr = BufWriter::new(wr);

        loop {
            let request = match tokio::time::timeout(
                self.idle_timeout,
                Request::parse(Some(self.max_request_size), &mut rd),
            )
            .await
            {
                Ok(Ok(request)) => request,
                Ok(Err(RelayError::Io { source }))
                    if source.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    trace!("Client closed the connection");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_idle) => {
                    debug!("Dropping idle client connection");
                    return Ok(());
                }
            };
            let session_id = request.session_id();
            let seq_number = request.seq_number();

            if !allowed {
                let e = RelayError::SecurityDenied("Address is not allowed".to_string());
                let mut reply = Reply::new(sqlrelay_impl::protocol::ReplyType::Error);
                reply.push(sqlrelay_impl::protocol::Part::Error(vec![
                    e.to_server_error()
                ]));
                reply.emit(session_id, seq_number, &mut wr).await?;
                wr.flush().await?;
                return Ok(());
            }

            // bounded worker concurrency across all connections
            let _permit = self
                .workers
                .acquire()
                .await
                .map_err(|_closed| RelayError::Impl("Worker semaphore closed"))?;

            match self.dispatcher.handle(request).await {
                Outcome::Reply(reply) => {
                    reply.emit(session_id, seq_number, &mut wr).await?;
                }
                Outcome::Stream(mut blocks) => {
                    while let Some(reply) = blocks.recv().await {
                        reply.emit(session_id, seq_number, &mut wr).await?;
                    }
                }
            }
            wr.flush().await?;
        }
    }
}
