//! The sqlrelay proxy server.
//!
//! Terminates driver connections over the framed RPC protocol, multiplexes
//! logical sessions onto pooled physical back-end connections, and forwards
//! statement execution, streaming result sets, LOB transfer, and XA
//! two-phase-commit operations.
//!
//! Concrete database drivers stay outside this crate; they are plugged in
//! through the [`backend`] trait family. The [`backend::mock`] provider
//! exists for tests and local experiments.

#![deny(missing_debug_implementations)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod backend;
pub mod config;
pub mod datasource;
pub mod dispatcher;
pub mod ipfilter;
pub mod pool;
pub mod segregator;
pub mod session;
pub mod statistics;
pub mod streamer;
pub mod xa;

mod server;

pub use crate::config::ServerConfig;
pub use crate::dispatcher::{Dispatcher, Outcome};
pub use crate::server::Server;

use crate::backend::BackendProvider;
use crate::datasource::DatasourceRegistry;
use crate::pool::{BuiltinPoolProvider, PoolProvider};
use sqlrelay_impl::{EndpointAddr, RelayResult, Topology};
use std::sync::Arc;

/// Wires a dispatcher from configuration, a back-end provider, and the
/// endpoints this deployment advertises to drivers.
pub fn build_dispatcher(
    config: ServerConfig,
    backend: Arc<dyn BackendProvider>,
    advertised_endpoints: Vec<EndpointAddr>,
) -> Arc<Dispatcher> {
    build_dispatcher_with_pool_provider(
        config,
        backend,
        Arc::new(BuiltinPoolProvider),
        advertised_endpoints,
    )
}

/// Like [`build_dispatcher`], with a custom pool provider.
pub fn build_dispatcher_with_pool_provider(
    config: ServerConfig,
    backend: Arc<dyn BackendProvider>,
    pool_provider: Arc<dyn PoolProvider>,
    advertised_endpoints: Vec<EndpointAddr>,
) -> Arc<Dispatcher> {
    let registry =
        DatasourceRegistry::new(backend, pool_provider, config.datasource_defaults());
    Arc::new(Dispatcher::new(
        config,
        registry,
        Topology::new(advertised_endpoints),
    ))
}

/// Builds the server around a dispatcher.
pub fn build_server(dispatcher: Arc<Dispatcher>) -> RelayResult<Arc<Server>> {
    Ok(Arc::new(Server::new(dispatcher)?))
}
