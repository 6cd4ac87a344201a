//! The driver: endpoint set, health monitoring, and connection opening.

use crate::connection::Connection;
use crate::dispatch::{DispatchConfig, EndpointManager};
use sqlrelay_impl::{
    ClientInfo, ConnectParams, IntoConnectParams, RelayError, RelayResult, SessionOptions,
};
use std::sync::Arc;
use uuid::Uuid;

/// Entry point of the client side: holds the connect parameters, the client
/// id shared by all sessions of this driver instance, and the endpoint
/// manager.
#[derive(Debug)]
pub struct Driver {
    params: ConnectParams,
    client_id: Uuid,
    client_info: ClientInfo,
    session_options: SessionOptions,
    manager: Arc<EndpointManager>,
}

impl Driver {
    pub fn new<P: IntoConnectParams>(params: P) -> RelayResult<Self> {
        Self::with_dispatch_config(params, DispatchConfig::default())
    }

    pub fn with_dispatch_config<P: IntoConnectParams>(
        params: P,
        config: DispatchConfig,
    ) -> RelayResult<Self> {
        let params = params.into_connect_params()?;
        let manager = EndpointManager::start(params.endpoints(), config)?;
        Ok(Self {
            params,
            client_id: Uuid::new_v4(),
            client_info: ClientInfo::default(),
            session_options: SessionOptions::default(),
            manager,
        })
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub(crate) fn client_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    pub(crate) fn session_options(&self) -> SessionOptions {
        self.session_options
    }

    pub fn manager(&self) -> Arc<EndpointManager> {
        Arc::clone(&self.manager)
    }

    /// Sets the application name that is attached to new sessions.
    pub fn set_application<S: AsRef<str>>(&mut self, application: S) {
        self.client_info.set_application(application);
    }

    pub fn set_application_version(&mut self, version: &str) {
        self.client_info.set_application_version(version);
    }

    pub fn set_application_user(&mut self, user: &str) {
        self.client_info.set_application_user(user);
    }

    /// Rows per result-set block for new sessions.
    pub fn set_fetch_size(&mut self, fetch_size: u32) {
        self.session_options.set_fetch_size(fetch_size);
    }

    /// Bytes per LOB read block for new sessions.
    pub fn set_lob_read_length(&mut self, lob_read_length: u32) {
        self.session_options.set_lob_read_length(lob_read_length);
    }

    /// Bytes per LOB write block for new sessions.
    pub fn set_lob_write_length(&mut self, lob_write_length: u32) {
        self.session_options.set_lob_write_length(lob_write_length);
    }

    /// Opens a logical connection, bound to the endpoint the selector picks.
    ///
    /// The initial connect is the one operation that fails over: when an
    /// endpoint cannot be reached, the next healthy one is tried before the
    /// error surfaces.
    pub async fn connect(&self) -> RelayResult<Connection> {
        let mut last_error = None;
        for _attempt in 0..self.manager.endpoints().len() {
            let endpoint = self.manager.select()?;
            match Connection::open(self, Arc::clone(&endpoint)).await {
                Ok(connection) => return Ok(connection),
                Err(e) if matches!(e, RelayError::TransportFailure(_)) => {
                    warn!("Connect to {} failed: {e}", endpoint.addr());
                    self.manager.report_failure(endpoint.addr());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| RelayError::TransportFailure("No endpoint reachable".to_string())))
    }
}
