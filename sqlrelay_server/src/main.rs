//! The sqlrelay server binary.
//!
//! Exit codes: 0 on normal shutdown, 1 on fatal configuration errors
//! (invalid CIDR list, invalid placeholder configuration, bind failure).

#[macro_use]
extern crate log;

use sqlrelay_impl::EndpointAddr;
use sqlrelay_server::{backend::mock::MockProvider, build_dispatcher, build_server, ServerConfig};
use std::sync::Arc;

fn init_logger() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .map(|logger| logger.start().ok())
        .ok();
}

#[tokio::main]
async fn main() {
    init_logger();
    if let Err(e) = run().await {
        error!("Fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> sqlrelay_impl::RelayResult<()> {
    let environment = std::env::var("SQLRELAY_ENVIRONMENT").ok();
    let config = ServerConfig::load(environment.as_deref(), std::path::Path::new("."))?;
    let advertised = vec![EndpointAddr::new("localhost".to_string(), config.port)];

    // Deployments plug a real driver provider in here; the in-memory
    // provider keeps the binary self-contained.
    let dispatcher = build_dispatcher(config, Arc::new(MockProvider::new()), advertised);
    let server = build_server(Arc::clone(&dispatcher))?;
    let listener = server.bind().await?;

    let serve = tokio::spawn(Arc::clone(&server).serve(listener));
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down");
    serve.abort();

    for am_session in dispatcher.store().drain() {
        let mut session = am_session.lock().await;
        session.close_all_handles().await;
    }
    dispatcher.registry().shutdown().await;
    Ok(())
}
