//! End-to-end driver tests against an in-process proxy server with the
//! in-memory back-end.

use sqlrelay::dispatch::{DispatchConfig, EndpointEvent};
use sqlrelay::{
    xa_flags, CallMethod, CallStep, Connection, ConnectParamsBuilder, Driver, ErrorKind, LobKind,
    RelayValue, ResourceKind, ResourceRef, Xid,
};
use sqlrelay_server::backend::mock::{MockProvider, MockState};
use sqlrelay_server::{build_dispatcher, build_server, Dispatcher, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct TestServer {
    port: u16,
    serve: JoinHandle<sqlrelay::RelayResult<()>>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<MockState>,
}

fn init_logger() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .map(|logger| logger.start().ok())
        .ok();
}

async fn start_server(port: u16, tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    init_logger();
    let mut config = ServerConfig::default();
    config.port = port;
    tweak(&mut config);
    let mock = MockProvider::new();
    let state = mock.state();
    let dispatcher = build_dispatcher(config, Arc::new(mock), Vec::new());
    let server = build_server(Arc::clone(&dispatcher)).unwrap();
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serve = tokio::spawn(Arc::clone(&server).serve(listener));
    TestServer {
        port,
        serve,
        dispatcher,
        state,
    }
}

fn params_for(ports: &[u16]) -> ConnectParamsBuilder {
    let mut builder = ConnectParamsBuilder::new()
        .hostname("127.0.0.1")
        .port(ports[0])
        .backend_url("mock://backend/app")
        .dbuser("scott")
        .password("tiger");
    for port in &ports[1..] {
        builder = builder.endpoint("127.0.0.1", *port);
    }
    builder
}

fn fast_probes() -> DispatchConfig {
    DispatchConfig {
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(100),
        failure_threshold: 2,
    }
}

async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<EndpointEvent>,
    want: impl Fn(&EndpointEvent) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if want(&event) => return,
                Ok(_) => {}
                Err(e) => panic!("Event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("Expected endpoint event in time");
}

#[tokio::test]
async fn cursor_iterates_across_block_boundaries() {
    let server = start_server(0, |_| {}).await;
    let mut connection = Connection::connect(
        params_for(&[server.port]).build().unwrap(),
    )
    .await
    .unwrap();

    let mut cursor = connection
        .execute_query("select 250 rows", &[])
        .await
        .unwrap();
    let mut seen = 0_i32;
    while let Some(row) = cursor.next_row().await.unwrap() {
        assert_eq!(&RelayValue::Int(seen), row.value(0).unwrap());
        seen += 1;
    }
    assert_eq!(250, seen);
    // the cursor stays exhausted
    // (a fresh next_row on a drained cursor answers None without an RPC)
    connection.close().await.unwrap();
    server.serve.abort();
}

#[tokio::test]
async fn update_counts_and_backend_errors() {
    let server = start_server(0, |_| {}).await;
    let mut connection =
        Connection::connect(params_for(&[server.port]).build().unwrap())
            .await
            .unwrap();

    let count = connection.execute_update("update 7", &[]).await.unwrap();
    assert_eq!(7, count);

    let e = connection
        .execute_update("raise 1205 40001", &[])
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::BackendSql, e.kind());
    let server_error = e.server_error().unwrap();
    assert_eq!(1205, server_error.code());
    assert_eq!(b"40001", server_error.sqlstate());

    connection.close().await.unwrap();
    server.serve.abort();
}

#[tokio::test]
async fn prepared_statements_round_trip() {
    let server = start_server(0, |_| {}).await;
    let mut connection =
        Connection::connect(params_for(&[server.port]).build().unwrap())
            .await
            .unwrap();

    let mut prepared = connection.prepare("select 5 rows").await.unwrap();
    assert_eq!(0, prepared.param_count());
    let rows = prepared
        .execute_query(&[])
        .await
        .unwrap()
        .into_rows()
        .await
        .unwrap();
    assert_eq!(5, rows.len());
    prepared.close().await.unwrap();

    connection.close().await.unwrap();
    server.serve.abort();
}

#[tokio::test]
async fn lob_write_and_read_back() {
    const MB: usize = 1_048_576;
    let server = start_server(0, |_| {}).await;
    let mut connection =
        Connection::connect(params_for(&[server.port]).build().unwrap())
            .await
            .unwrap();

    let payload: Vec<u8> = (0..(3 * MB + MB / 2)).map(|i| (i % 249) as u8).collect();
    let mut writer = connection.lob_writer(LobKind::Blob).with_block_size(MB);
    writer.write(&payload).await.unwrap();
    let (lob_value, total) = writer.finish().await.unwrap();
    assert_eq!(payload.len() as u64, total);

    let mut reader = connection.lob_reader(&lob_value).unwrap();
    let readback = reader.read_to_end().await.unwrap();
    assert_eq!(payload, readback);

    // positioned read of a slice
    let slice = reader.read(MB as u64 + 1, 10).await.unwrap();
    assert_eq!(&payload[MB..MB + 10], slice.as_slice());

    connection.close().await.unwrap();
    server.serve.abort();
}

#[tokio::test]
async fn chained_metadata_call() {
    let server = start_server(0, |_| {}).await;
    let mut connection =
        Connection::connect(params_for(&[server.port]).build().unwrap())
            .await
            .unwrap();

    let cursor = connection.execute_query("select 1 rows", &[]).await.unwrap();
    let rs = ResourceRef::new(ResourceKind::ResultSet, cursor.result_set_id());
    let value = connection
        .call_resource(
            rs,
            CallStep::new(CallMethod::GetMetadata, Vec::new()),
            Some(CallStep::new(
                CallMethod::IsAutoIncrement,
                vec![RelayValue::Int(1)],
            )),
        )
        .await
        .unwrap();
    match value {
        sqlrelay::CallValue::Scalar(RelayValue::Boolean(_)) => {}
        other => panic!("Unexpected call value {other:?}"),
    }

    connection.close().await.unwrap();
    server.serve.abort();
}

#[tokio::test]
async fn xa_branch_through_the_driver() {
    let server = start_server(0, |config| {
        config.xa.max_transactions = 4;
    })
    .await;
    let mut params = params_for(&[server.port]);
    params = params.xa(true);
    let connection = Connection::connect(params.build().unwrap()).await.unwrap();
    let xa = connection.xa_session().unwrap();

    let xid = Xid::try_new(42, b"global-1".to_vec(), b"branch-1".to_vec()).unwrap();
    xa.start(&xid, xa_flags::NONE).await.unwrap();
    xa.end(&xid, xa_flags::SUCCESS).await.unwrap();
    assert_eq!(0, xa.prepare(&xid).await.unwrap());

    // the branch is in doubt now and shows up in recovery
    let recovered = xa.recover(xa_flags::START_RECOVERY_SCAN).await.unwrap();
    assert!(recovered.contains(&xid));

    xa.commit(&xid, false).await.unwrap();
    let recovered = xa.recover(xa_flags::START_RECOVERY_SCAN).await.unwrap();
    assert!(recovered.is_empty());

    connection.close().await.unwrap();
    server.serve.abort();
}

#[tokio::test]
async fn failover_closes_bound_connections_and_rebalances_on_recovery() {
    let server1 = start_server(0, |_| {}).await;
    let server2 = start_server(0, |_| {}).await;
    let port1 = server1.port;
    let port2 = server2.port;

    let driver = Driver::with_dispatch_config(
        params_for(&[port1, port2]).build().unwrap(),
        fast_probes(),
    )
    .unwrap();
    let mut events = driver.manager().subscribe();

    // the first connection binds to an endpoint and sticks to it
    let bound = driver.connect().await.unwrap();
    let bound_port = bound.endpoint().port();
    assert!(bound_port == port1 || bound_port == port2);

    // kill the bound endpoint's server
    if bound_port == port1 {
        server1.serve.abort();
    } else {
        server2.serve.abort();
    }

    wait_for_event(&mut events, |event| {
        matches!(event, EndpointEvent::Unhealthy(addr) if addr.port() == bound_port)
    })
    .await;
    // the reconciler notifies bound connections, they close themselves
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bound.is_closed());

    // reopened connections all land on the surviving endpoint
    let surviving_port = if bound_port == port1 { port2 } else { port1 };
    let mut replacements = Vec::new();
    for _ in 0..4 {
        let connection = driver.connect().await.unwrap();
        assert_eq!(surviving_port, connection.endpoint().port());
        replacements.push(connection);
    }

    // the dead endpoint comes back on its old port
    let revived = start_server(bound_port, |_| {}).await;
    assert_eq!(bound_port, revived.port);
    wait_for_event(&mut events, |event| {
        matches!(event, EndpointEvent::Recovered(addr) if addr.port() == bound_port)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the rebalancer marked idle connections on the crowded endpoint
    let marked = replacements
        .iter()
        .filter(|c| c.is_marked_for_closure())
        .count();
    assert!(
        marked >= 1,
        "Expected at least one idle connection marked for closure"
    );

    // closing marked connections and reconnecting spreads load back
    let mut kept = Vec::new();
    for connection in replacements {
        if connection.is_marked_for_closure() {
            connection.close().await.ok();
            kept.push(driver.connect().await.unwrap());
        } else {
            kept.push(connection);
        }
    }
    let on_revived = kept
        .iter()
        .filter(|c| c.endpoint().port() == bound_port && !c.is_closed())
        .count();
    assert!(on_revived >= 1, "Reconnects should reach the revived endpoint");

    revived.serve.abort();
    if bound_port == port1 {
        server2.serve.abort();
    } else {
        server1.serve.abort();
    }
}

#[tokio::test]
async fn idempotent_reads_retry_on_another_healthy_endpoint() {
    init_logger();
    // two listeners over one dispatcher, so the session is reachable
    // through either endpoint
    let mut config = ServerConfig::default();
    config.port = 0;
    config.connection_idle_timeout_ms = 250; // the bound socket dies quickly
    let dispatcher = build_dispatcher(config, Arc::new(MockProvider::new()), Vec::new());
    let server_a = build_server(Arc::clone(&dispatcher)).unwrap();
    let listener_a = server_a.bind().await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    let serve_a = tokio::spawn(Arc::clone(&server_a).serve(listener_a));
    let server_b = build_server(Arc::clone(&dispatcher)).unwrap();
    let listener_b = server_b.bind().await.unwrap();
    let port_b = listener_b.local_addr().unwrap().port();
    let serve_b = tokio::spawn(Arc::clone(&server_b).serve(listener_b));

    let driver = Driver::with_dispatch_config(
        params_for(&[port_a, port_b]).build().unwrap(),
        fast_probes(),
    )
    .unwrap();
    let mut connection = driver.connect().await.unwrap();

    let mut writer = connection.lob_writer(LobKind::Blob);
    writer.write(b"retry-me").await.unwrap();
    let (lob_value, _) = writer.finish().await.unwrap();
    let mut reader = connection.lob_reader(&lob_value).unwrap();

    // the server drops the idle bound socket; the next read hits a transport
    // failure and, being repeatable, is re-sent to the other endpoint
    tokio::time::sleep(Duration::from_millis(600)).await;
    let data = reader.read_to_end().await.unwrap();
    assert_eq!(b"retry-me".to_vec(), data);
    // the successful retry leaves the logical connection open
    assert!(!connection.is_closed());

    serve_a.abort();
    serve_b.abort();
}

#[tokio::test]
async fn initial_connect_fails_over_to_a_healthy_endpoint() {
    // port1 points nowhere; the driver must fall back to port2
    let server = start_server(0, |_| {}).await;
    let dead_port = {
        // grab an ephemeral port and release it again
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let driver = Driver::with_dispatch_config(
        params_for(&[dead_port, server.port]).build().unwrap(),
        fast_probes(),
    )
    .unwrap();
    let connection = driver.connect().await.unwrap();
    assert_eq!(server.port, connection.endpoint().port());

    connection.close().await.unwrap();
    server.serve.abort();
}

#[tokio::test]
async fn sessions_of_one_client_share_the_client_id() {
    let server = start_server(0, |_| {}).await;
    let driver = Driver::new(params_for(&[server.port]).build().unwrap()).unwrap();
    let c1 = driver.connect().await.unwrap();
    let c2 = driver.connect().await.unwrap();
    assert_ne!(c1.session_id(), c2.session_id());
    assert_eq!(2, server.dispatcher.store().count());

    c1.close().await.unwrap();
    c2.close().await.unwrap();
    assert_eq!(0, server.dispatcher.store().count());
    // both physical connections went back to the pool
    assert_eq!(0, server.state.closed());
    server.serve.abort();
}
