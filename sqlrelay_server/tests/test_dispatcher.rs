//! Scenario tests that drive the dispatcher the way the wire does.

use sqlrelay_impl::{
    protocol::{
        parts::{
            CallMethod, CallRequest, CallStep, ConnectRequest, FetchRequest, LobKind,
            ReadLobRequest, ResourceKind, ResourceRef, WriteLobRequest, XatOptions,
        },
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    xa_flags, ErrorKind, RelayValue, Xid,
};
use sqlrelay_server::backend::mock::{MockProvider, MockState};
use sqlrelay_server::{build_dispatcher, Dispatcher, Outcome, ServerConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn test_setup(tweak: impl FnOnce(&mut ServerConfig)) -> (Arc<Dispatcher>, Arc<MockState>) {
    let mut config = ServerConfig::default();
    tweak(&mut config);
    let mock = MockProvider::new();
    let state = mock.state();
    let dispatcher = build_dispatcher(config, Arc::new(mock), Vec::new());
    (dispatcher, state)
}

fn connect_request(client_id: Uuid, is_xa: bool, properties: HashMap<String, String>) -> Request {
    let mut request = Request::new(MessageType::Connect);
    request.push(Part::ConnectRequest(ConnectRequest::new(
        "mock://backend/app".to_string(),
        "default".to_string(),
        "scott".to_string(),
        "tiger".to_string(),
        client_id,
        is_xa,
        properties,
    )));
    request
}

async fn reply_of(dispatcher: &Arc<Dispatcher>, request: Request) -> Reply {
    match dispatcher.handle(request).await {
        Outcome::Reply(reply) => reply,
        Outcome::Stream(_) => panic!("Expected a single reply"),
    }
}

async fn connect(dispatcher: &Arc<Dispatcher>, is_xa: bool) -> Uuid {
    connect_with_properties(dispatcher, is_xa, HashMap::new()).await
}

async fn connect_with_properties(
    dispatcher: &Arc<Dispatcher>,
    is_xa: bool,
    properties: HashMap<String, String>,
) -> Uuid {
    let mut reply = reply_of(
        dispatcher,
        connect_request(Uuid::new_v4(), is_xa, properties),
    )
    .await;
    reply
        .assert_expected_reply_type(ReplyType::Connected)
        .unwrap();
    match reply.parts.extract(PartKind::SessionInfo) {
        Some(Part::SessionInfo(si)) => si.session_id(),
        other => panic!("No session info in connect reply: {other:?}"),
    }
}

fn execute_query(session_id: Uuid, sql: &str) -> Request {
    let mut request = Request::new(MessageType::ExecuteQuery);
    request.set_session_id(session_id);
    request.push(Part::Command(sql.to_string()));
    request
}

fn fetch_next(session_id: Uuid, rs_id: Uuid) -> Request {
    let mut request = Request::new(MessageType::FetchNext);
    request.set_session_id(session_id);
    request.push(Part::FetchRequest(FetchRequest::new(rs_id, 0)));
    request
}

fn block_of(reply: &mut Reply) -> sqlrelay_impl::protocol::parts::ResultSetBlock {
    match reply.parts.extract(PartKind::ResultSetBlock) {
        Some(Part::ResultSetBlock(block)) => block,
        other => panic!("No result-set block in reply: {other:?}"),
    }
}

fn error_of(reply: &mut Reply) -> sqlrelay_impl::ServerError {
    assert_eq!(ReplyType::Error, reply.reply_type());
    match reply.parts.extract(PartKind::Error) {
        Some(Part::Error(mut errors)) => errors.remove(0),
        other => panic!("No error part in reply: {other:?}"),
    }
}

// ---------------------------------------------------------------- streaming

#[tokio::test]
async fn rows_stream_in_blocks_of_fetch_size() {
    let (dispatcher, _) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;

    let mut reply = reply_of(&dispatcher, execute_query(session_id, "select 250 rows")).await;
    reply.assert_expected_reply_type(ReplyType::ResultSet).unwrap();
    assert!(matches!(
        reply.parts.extract(PartKind::ResultSetMetadata),
        Some(Part::ResultSetMetadata(_))
    ));
    let first = block_of(&mut reply);
    assert_eq!(100, first.no_of_rows());
    assert!(!first.is_last());

    let mut reply = reply_of(&dispatcher, fetch_next(session_id, first.result_set_id())).await;
    let second = block_of(&mut reply);
    assert_eq!(100, second.no_of_rows());
    assert!(!second.is_last());

    let mut reply = reply_of(&dispatcher, fetch_next(session_id, first.result_set_id())).await;
    let third = block_of(&mut reply);
    assert_eq!(50, third.no_of_rows());
    assert!(third.is_last());

    // concatenating the blocks yields the back-end order
    let rows: Vec<Vec<RelayValue>> = first
        .into_rows()
        .into_iter()
        .chain(second.into_rows())
        .chain(third.into_rows())
        .collect();
    assert_eq!(250, rows.len());
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(RelayValue::Int(i32::try_from(i).unwrap()), row[0]);
    }
}

// ------------------------------------------------------------ pool exhaustion

#[tokio::test]
async fn pool_exhaustion_fails_the_third_query_and_recovers() {
    let (dispatcher, _) = test_setup(|config| {
        config.pool.maximum_pool_size = Some(2);
        config.pool.connection_timeout_ms = Some(200);
    });

    let s1 = connect(&dispatcher, false).await;
    let s2 = connect(&dispatcher, false).await;
    let s3 = connect(&dispatcher, false).await;

    let d1 = Arc::clone(&dispatcher);
    let long1 = tokio::spawn(async move {
        reply_of(&d1, execute_query(s1, "select 1 rows wait 600")).await
    });
    let d2 = Arc::clone(&dispatcher);
    let long2 = tokio::spawn(async move {
        reply_of(&d2, execute_query(s2, "select 1 rows wait 600")).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // both physical connections are busy; the third session times out
    let started = Instant::now();
    let mut reply = reply_of(&dispatcher, execute_query(s3, "select 1 rows")).await;
    assert!(started.elapsed() >= Duration::from_millis(200));
    let error = error_of(&mut reply);
    assert_eq!(ErrorKind::PoolExhausted, error.kind());

    // once a long runner finishes and its session terminates, the pool frees
    long1.await.unwrap().assert_expected_reply_type(ReplyType::ResultSet).unwrap();
    long2.await.unwrap().assert_expected_reply_type(ReplyType::ResultSet).unwrap();
    dispatcher.terminate_session(s1).await.unwrap();

    let started = Instant::now();
    let reply = reply_of(&dispatcher, execute_query(s3, "select 1 rows")).await;
    reply.assert_expected_reply_type(ReplyType::ResultSet).unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
}

// ------------------------------------------------------------- lob round trip

#[tokio::test]
async fn lob_round_trip_in_four_blocks() {
    const MB: usize = 1_048_576;
    let (dispatcher, _) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;

    let payload: Vec<u8> = (0..(3 * MB + MB / 2)).map(|i| (i % 251) as u8).collect();

    // write in 1 MB blocks, positions are 1-based
    let mut lob_id = Uuid::nil();
    let mut position = 1_u64;
    for chunk in payload.chunks(MB) {
        let mut request = Request::new(MessageType::WriteLob);
        request.set_session_id(session_id);
        let is_last = position as usize + chunk.len() - 1 >= payload.len();
        request.push(Part::WriteLobRequest(WriteLobRequest::new(
            lob_id,
            LobKind::Blob,
            position,
            chunk.to_vec(),
            is_last,
        )));
        let mut reply = reply_of(&dispatcher, request).await;
        reply.assert_expected_reply_type(ReplyType::WriteLob).unwrap();
        match reply.parts.extract(PartKind::WriteLobReply) {
            Some(Part::WriteLobReply(ack)) => {
                lob_id = ack.lob_id();
                if is_last {
                    assert_eq!(payload.len() as u64, ack.total_length());
                }
            }
            other => panic!("No write-lob reply: {other:?}"),
        }
        position += chunk.len() as u64;
    }

    // read it back from position 1; expect 1 MB, 1 MB, 1 MB, 0.5 MB
    let mut request = Request::new(MessageType::ReadLob);
    request.set_session_id(session_id);
    request.push(Part::ReadLobRequest(ReadLobRequest::new(
        lob_id,
        1,
        u32::try_from(payload.len()).unwrap(),
    )));
    let mut blocks = match dispatcher.handle(request).await {
        Outcome::Stream(blocks) => blocks,
        Outcome::Reply(reply) => panic!("Expected a stream, got {reply:?}"),
    };

    let mut sizes = Vec::new();
    let mut readback = Vec::new();
    while let Some(mut reply) = blocks.recv().await {
        reply.assert_expected_reply_type(ReplyType::ReadLob).unwrap();
        match reply.parts.extract(PartKind::ReadLobReply) {
            Some(Part::ReadLobReply(block)) => {
                assert!(block.is_resolved());
                let (data, is_last) = block.into_data_and_last();
                sizes.push(data.len());
                readback.extend_from_slice(&data);
                if is_last {
                    break;
                }
            }
            other => panic!("No read-lob block: {other:?}"),
        }
    }
    assert_eq!(vec![MB, MB, MB, MB / 2], sizes);
    assert_eq!(payload, readback);
}

#[tokio::test]
async fn unresolvable_lob_yields_a_terminal_marker_block() {
    let (dispatcher, _) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;
    // sessions without a physical connection yet must also answer
    let mut request = Request::new(MessageType::ReadLob);
    request.set_session_id(session_id);
    request.push(Part::ReadLobRequest(ReadLobRequest::new(
        Uuid::new_v4(),
        1,
        100,
    )));
    let mut blocks = match dispatcher.handle(request).await {
        Outcome::Stream(blocks) => blocks,
        Outcome::Reply(reply) => panic!("Expected a stream, got {reply:?}"),
    };
    let mut reply = blocks.recv().await.expect("one terminal block");
    match reply.parts.extract(PartKind::ReadLobReply) {
        Some(Part::ReadLobReply(block)) => {
            assert_eq!(-1, block.position());
            assert!(!block.is_resolved());
        }
        other => panic!("No read-lob block: {other:?}"),
    }
    assert!(blocks.recv().await.is_none());
}

// ----------------------------------------------------------------------- xa

fn xa_request(session_id: Uuid, message_type: MessageType, xid: &Xid, flags: u32) -> Request {
    let mut request = Request::new(message_type);
    request.set_session_id(session_id);
    let mut xat = XatOptions::default();
    xat.set_xid(xid.clone());
    xat.set_flags(flags);
    request.push(Part::XatOptions(xat));
    request
}

#[tokio::test]
async fn xa_permits_bound_contention_and_release() {
    let (dispatcher, _) = test_setup(|config| {
        config.xa.max_transactions = 1;
        config.xa.start_timeout_ms = 100;
    });
    let sa = connect(&dispatcher, true).await;
    let sb = connect(&dispatcher, true).await;
    let xid_a = Xid::try_new(1, vec![1, 2, 3], vec![1]).unwrap();
    let xid_b = Xid::try_new(1, vec![4, 5, 6], vec![1]).unwrap();

    let reply = reply_of(
        &dispatcher,
        xa_request(sa, MessageType::XaStart, &xid_a, xa_flags::NONE),
    )
    .await;
    reply.assert_expected_reply_type(ReplyType::XaResponse).unwrap();

    // client B cannot start its branch while A holds the only permit
    let started = Instant::now();
    let mut reply = reply_of(
        &dispatcher,
        xa_request(sb, MessageType::XaStart, &xid_b, xa_flags::NONE),
    )
    .await;
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(ErrorKind::XaLimitReached, error_of(&mut reply).kind());

    // A: end, prepare, commit
    reply_of(
        &dispatcher,
        xa_request(sa, MessageType::XaEnd, &xid_a, xa_flags::SUCCESS),
    )
    .await
    .assert_expected_reply_type(ReplyType::XaResponse)
    .unwrap();
    let mut reply = reply_of(
        &dispatcher,
        xa_request(sa, MessageType::XaPrepare, &xid_a, xa_flags::NONE),
    )
    .await;
    match reply.parts.extract(PartKind::XatOptions) {
        Some(Part::XatOptions(xat)) => assert_eq!(Some(0), xat.return_code()),
        other => panic!("No xa options in reply: {other:?}"),
    }
    reply_of(
        &dispatcher,
        xa_request(sa, MessageType::XaCommit, &xid_a, xa_flags::NONE),
    )
    .await
    .assert_expected_reply_type(ReplyType::XaResponse)
    .unwrap();

    // B retries and succeeds immediately
    let started = Instant::now();
    let reply = reply_of(
        &dispatcher,
        xa_request(sb, MessageType::XaStart, &xid_b, xa_flags::NONE),
    )
    .await;
    reply.assert_expected_reply_type(ReplyType::XaResponse).unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
}

// ------------------------------------------------------- placeholders, errors

#[tokio::test]
async fn invalid_placeholder_rejects_before_any_connection() {
    let (dispatcher, state) = test_setup(|_| {});
    let mut request = Request::new(MessageType::Connect);
    request.push(Part::ConnectRequest(ConnectRequest::new(
        "mock://${PATH}/db".to_string(),
        "default".to_string(),
        "scott".to_string(),
        "tiger".to_string(),
        Uuid::new_v4(),
        false,
        HashMap::new(),
    )));
    let mut reply = reply_of(&dispatcher, request).await;
    assert_eq!(ErrorKind::SecurityDenied, error_of(&mut reply).kind());
    assert_eq!(0, state.opened());
}

#[tokio::test]
async fn backend_errors_keep_state_and_vendor_code() {
    let (dispatcher, _) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;

    let mut reply = reply_of(&dispatcher, execute_query(session_id, "raise 1205 40001")).await;
    let error = error_of(&mut reply);
    assert_eq!(ErrorKind::BackendSql, error.kind());
    assert_eq!(1205, error.code());
    assert_eq!(b"40001", error.sqlstate());

    // a non-08 error leaves the session usable
    let reply = reply_of(&dispatcher, execute_query(session_id, "select 1 rows")).await;
    reply.assert_expected_reply_type(ReplyType::ResultSet).unwrap();
}

#[tokio::test]
async fn connection_failures_terminate_the_session() {
    let (dispatcher, _) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;
    let mut reply = reply_of(&dispatcher, execute_query(session_id, "raise 99 08006")).await;
    assert_eq!(ErrorKind::BackendSql, error_of(&mut reply).kind());

    // state class 08: the session is gone
    let mut reply = reply_of(&dispatcher, execute_query(session_id, "select 1 rows")).await;
    assert_eq!(ErrorKind::SessionNotFound, error_of(&mut reply).kind());
}

// ----------------------------------------------------- terminate and handles

#[tokio::test]
async fn terminate_returns_the_connection_and_clears_handles() {
    let (dispatcher, state) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;

    let mut reply = reply_of(&dispatcher, execute_query(session_id, "select 150 rows")).await;
    let block = block_of(&mut reply);
    let rs_id = block.result_set_id();

    let mut request = Request::new(MessageType::Disconnect);
    request.set_session_id(session_id);
    reply_of(&dispatcher, request)
        .await
        .assert_expected_reply_type(ReplyType::Nil)
        .unwrap();

    // the session and its handles are unreachable now
    let mut reply = reply_of(&dispatcher, fetch_next(session_id, rs_id)).await;
    assert_eq!(ErrorKind::SessionNotFound, error_of(&mut reply).kind());

    // the physical connection went back to its pool, not to the backend
    assert_eq!(1, state.opened());
    assert_eq!(0, state.closed());

    // terminate is idempotent
    let mut request = Request::new(MessageType::Disconnect);
    request.set_session_id(session_id);
    reply_of(&dispatcher, request)
        .await
        .assert_expected_reply_type(ReplyType::Nil)
        .unwrap();
}

#[tokio::test]
async fn concurrent_rpcs_on_one_session_are_serialized() {
    let (dispatcher, state) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let dispatcher = Arc::clone(&dispatcher);
        tasks.push(tokio::spawn(async move {
            reply_of(&dispatcher, execute_query(session_id, "select 1 rows wait 40")).await
        }));
    }
    for task in tasks {
        task.await
            .unwrap()
            .assert_expected_reply_type(ReplyType::ResultSet)
            .unwrap();
    }
    // all four went through the one physical connection, one after another
    assert_eq!(1, state.opened());
    assert_eq!(4, state.journal().len());
}

// ----------------------------------------------------------- row-by-row mode

#[tokio::test]
async fn lob_invalidating_backends_stream_row_by_row() {
    let (dispatcher, state) = test_setup(|_| {});
    state.set_lobs_invalidated_on_advance(true);
    let session_id = connect(&dispatcher, false).await;

    let mut reply = reply_of(
        &dispatcher,
        execute_query(session_id, "select 3 rows with lobs"),
    )
    .await;
    let first = block_of(&mut reply);
    assert!(first.row_by_row());
    assert_eq!(1, first.no_of_rows());
    let rs_id = first.result_set_id();
    let first_lob = match &first.into_rows()[0][2] {
        RelayValue::Blob(handle) => *handle,
        other => panic!("Expected a blob handle, got {other:?}"),
    };

    // the previous row's LOB dies with the advance
    let mut reply = reply_of(&dispatcher, fetch_next(session_id, rs_id)).await;
    let second = block_of(&mut reply);
    assert_eq!(1, second.no_of_rows());
    assert!(!second.is_last());

    let mut request = Request::new(MessageType::ReadLob);
    request.set_session_id(session_id);
    request.push(Part::ReadLobRequest(ReadLobRequest::new(first_lob, 1, 10)));
    let mut blocks = match dispatcher.handle(request).await {
        Outcome::Stream(blocks) => blocks,
        Outcome::Reply(reply) => panic!("Expected a stream, got {reply:?}"),
    };
    let mut reply = blocks.recv().await.expect("terminal block");
    match reply.parts.extract(PartKind::ReadLobReply) {
        Some(Part::ReadLobReply(block)) => assert!(!block.is_resolved()),
        other => panic!("No read-lob block: {other:?}"),
    }
}

// ------------------------------------------------------------- call-resource

#[tokio::test]
async fn chained_call_reaches_metadata_in_one_round_trip() {
    let (dispatcher, _) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;

    let mut reply = reply_of(&dispatcher, execute_query(session_id, "select 2 rows")).await;
    let rs_id = block_of(&mut reply).result_set_id();

    let mut request = Request::new(MessageType::CallResource);
    request.set_session_id(session_id);
    request.push(Part::CallRequest(CallRequest::with_chained(
        ResourceRef::new(ResourceKind::ResultSet, rs_id),
        CallStep::new(CallMethod::GetMetadata, Vec::new()),
        CallStep::new(CallMethod::GetColumnLabel, vec![RelayValue::Int(2)]),
    )));
    let mut reply = reply_of(&dispatcher, request).await;
    reply.assert_expected_reply_type(ReplyType::CallReply).unwrap();
    match reply.parts.extract(PartKind::CallReply) {
        Some(Part::CallReply(call_reply)) => {
            assert_eq!(
                &RelayValue::Varchar("NAME".to_string()),
                call_reply.scalar().unwrap()
            );
        }
        other => panic!("No call reply: {other:?}"),
    }
}

#[tokio::test]
async fn savepoints_round_trip_through_handles() {
    let (dispatcher, _) = test_setup(|_| {});
    let session_id = connect(&dispatcher, false).await;
    // force the physical connection
    reply_of(&dispatcher, execute_query(session_id, "select 1 rows")).await;

    let mut request = Request::new(MessageType::CallResource);
    request.set_session_id(session_id);
    request.push(Part::CallRequest(CallRequest::new(
        ResourceRef::new(ResourceKind::Connection, session_id),
        CallStep::new(
            CallMethod::SetSavepoint,
            vec![RelayValue::Varchar("sp_main".to_string())],
        ),
    )));
    let mut reply = reply_of(&dispatcher, request).await;
    let savepoint = match reply.parts.extract(PartKind::CallReply) {
        Some(Part::CallReply(call_reply)) => call_reply.handle().unwrap(),
        other => panic!("No call reply: {other:?}"),
    };
    assert_eq!(ResourceKind::Savepoint, savepoint.kind);

    let mut request = Request::new(MessageType::CallResource);
    request.set_session_id(session_id);
    request.push(Part::CallRequest(CallRequest::new(
        savepoint,
        CallStep::new(CallMethod::RollbackToSavepoint, Vec::new()),
    )));
    reply_of(&dispatcher, request)
        .await
        .assert_expected_reply_type(ReplyType::CallReply)
        .unwrap();
}
