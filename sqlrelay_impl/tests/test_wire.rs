//! Round trips of complete framed messages over an in-memory wire.

use sqlrelay_impl::{
    protocol::{
        parts::{
            CallMethod, CallRequest, CallStep, ClientInfo, ConnectRequest, ExecutionResult,
            FieldMetadata, LobKind, ReadLobReply, ResourceKind, ResourceRef, ResultSetBlock,
            ResultSetMetadata, ServerError, SessionInfo, SessionOptions, WriteLobRequest,
            XatOptions,
        },
        MessageType, Part, PartKind, Reply, ReplyType, Request,
    },
    xa_flags, ErrorKind, RelayValue, Severity, TypeId, Xid,
};
use std::collections::HashMap;

fn init_logger() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .map(|logger| logger.start().ok())
        .ok();
}

#[tokio::test]
async fn connect_request_with_all_optional_parts() {
    init_logger();
    let client_id = uuid::Uuid::new_v4();
    let mut properties = HashMap::new();
    properties.insert(
        "connection.pool.maximumPoolSize".to_string(),
        "7".to_string(),
    );

    let mut request = Request::new(MessageType::Connect);
    request.push(Part::ConnectRequest(ConnectRequest::new(
        "postgresql://${relay.server.dbhost}:5432/app".to_string(),
        "analytics".to_string(),
        "scott".to_string(),
        "tiger".to_string(),
        client_id,
        true,
        properties,
    )));
    let mut client_info = ClientInfo::default();
    client_info.set_application("reporting");
    client_info.set_application_version("2.4.1");
    request.push(Part::ClientInfo(client_info));
    request.push(Part::SessionOptions(SessionOptions::new(250, 65536, 65536)));

    let mut wire = Vec::new();
    request.emit(uuid::Uuid::nil(), 1, &mut wire).await.unwrap();
    let mut parsed = Request::parse(None, &mut wire.as_slice()).await.unwrap();

    match parsed.parts.extract(PartKind::ConnectRequest) {
        Some(Part::ConnectRequest(connect)) => {
            assert_eq!("analytics", connect.datasource());
            assert_eq!("tiger", connect.password());
            assert_eq!(client_id, connect.client_id());
            assert!(connect.is_xa());
            assert_eq!("7", connect.properties()["connection.pool.maximumPoolSize"]);
            // the password never shows up in debug output
            assert!(!format!("{connect:?}").contains("tiger"));
        }
        other => panic!("Lost the connect request: {other:?}"),
    }
    match parsed.parts.extract(PartKind::SessionOptions) {
        Some(Part::SessionOptions(options)) => assert_eq!(250, options.fetch_size()),
        other => panic!("Lost the session options: {other:?}"),
    }
}

#[tokio::test]
async fn result_set_reply_round_trip() {
    init_logger();
    let session_id = uuid::Uuid::new_v4();
    let rs_id = uuid::Uuid::new_v4();
    let metadata = ResultSetMetadata::new(vec![
        FieldMetadata::new("ID".to_string(), TypeId::Int, false),
        FieldMetadata::new("PAYLOAD".to_string(), TypeId::Blob, true),
    ]);
    let rows = vec![
        vec![RelayValue::Int(1), RelayValue::Blob(uuid::Uuid::new_v4())],
        vec![RelayValue::Int(2), RelayValue::Null(TypeId::Blob)],
    ];

    let mut reply = Reply::new(ReplyType::ResultSet);
    reply.push(Part::ResourceId(ResourceRef::new(
        ResourceKind::Statement,
        uuid::Uuid::new_v4(),
    )));
    reply.push(Part::ResultSetMetadata(metadata));
    reply.push(Part::ResultSetBlock(ResultSetBlock::new(
        rs_id, false, true, rows,
    )));

    let mut wire = Vec::new();
    reply.emit(session_id, 3, &mut wire).await.unwrap();
    let mut parsed = Reply::parse(&mut wire.as_slice()).await.unwrap();
    assert_eq!(session_id, parsed.session_id());
    assert_eq!(3, parsed.seq_number());

    match parsed.parts.extract(PartKind::ResultSetMetadata) {
        Some(Part::ResultSetMetadata(metadata)) => {
            assert_eq!(1, metadata.index_of("PAYLOAD").unwrap());
        }
        other => panic!("Lost the metadata: {other:?}"),
    }
    match parsed.parts.extract(PartKind::ResultSetBlock) {
        Some(Part::ResultSetBlock(block)) => {
            assert_eq!(rs_id, block.result_set_id());
            assert!(block.is_last());
            let rows = block.into_rows();
            assert_eq!(2, rows.len());
            assert!(rows[1][1].is_null());
        }
        other => panic!("Lost the block: {other:?}"),
    }
}

#[tokio::test]
async fn error_reply_preserves_state_code_and_kind() {
    init_logger();
    let mut reply = Reply::new(ReplyType::Error);
    reply.push(Part::Error(vec![
        ServerError::backend(1205, b"40001", "deadlock detected".to_string()),
        ServerError::new(
            ErrorKind::SegregatorTimeout,
            0,
            Severity::Error,
            b"HY000".to_vec(),
            "no slow lane slot".to_string(),
            Some("segregator: waited 10000 ms".to_string()),
        ),
    ]));

    let mut wire = Vec::new();
    reply.emit(uuid::Uuid::nil(), 9, &mut wire).await.unwrap();
    let mut parsed = Reply::parse(&mut wire.as_slice()).await.unwrap();

    match parsed.parts.extract(PartKind::Error) {
        Some(Part::Error(errors)) => {
            assert_eq!(2, errors.len());
            assert_eq!(ErrorKind::BackendSql, errors[0].kind());
            assert_eq!(1205, errors[0].code());
            assert_eq!(b"40001", errors[0].sqlstate());
            assert!(!errors[0].is_connection_failure());
            assert_eq!(ErrorKind::SegregatorTimeout, errors[1].kind());
            assert_eq!(
                Some("segregator: waited 10000 ms"),
                errors[1].chain()
            );
        }
        other => panic!("Lost the errors: {other:?}"),
    }
}

#[tokio::test]
async fn lob_and_call_and_xa_parts_round_trip() {
    init_logger();
    let lob_id = uuid::Uuid::new_v4();

    let mut request = Request::new(MessageType::WriteLob);
    request.push(Part::WriteLobRequest(WriteLobRequest::new(
        lob_id,
        LobKind::Blob,
        1_048_577,
        vec![7; 4096],
        false,
    )));
    request.push(Part::CallRequest(CallRequest::with_chained(
        ResourceRef::new(ResourceKind::ResultSet, uuid::Uuid::new_v4()),
        CallStep::new(CallMethod::GetMetadata, Vec::new()),
        CallStep::new(CallMethod::IsAutoIncrement, vec![RelayValue::Int(3)]),
    )));
    let mut xat = XatOptions::default();
    xat.set_xid(Xid::try_new(7, vec![1; 64], vec![2; 64]).unwrap());
    xat.set_flags(xa_flags::JOIN);
    request.push(Part::XatOptions(xat));

    let mut wire = Vec::new();
    request.emit(uuid::Uuid::new_v4(), 4, &mut wire).await.unwrap();
    let mut parsed = Request::parse(None, &mut wire.as_slice()).await.unwrap();

    match parsed.parts.extract(PartKind::WriteLobRequest) {
        Some(Part::WriteLobRequest(write)) => {
            assert_eq!(lob_id, write.lob_id());
            assert_eq!(1_048_577, write.position());
            assert_eq!(4096, write.data().len());
            assert!(!write.is_last_data());
        }
        other => panic!("Lost the write-lob request: {other:?}"),
    }
    match parsed.parts.extract(PartKind::CallRequest) {
        Some(Part::CallRequest(call)) => {
            assert_eq!(CallMethod::GetMetadata, call.call().method);
            assert_eq!(
                CallMethod::IsAutoIncrement,
                call.chained().unwrap().method
            );
        }
        other => panic!("Lost the call request: {other:?}"),
    }
    match parsed.parts.extract(PartKind::XatOptions) {
        Some(Part::XatOptions(xat)) => {
            assert!(xat.flags_contain_only(xa_flags::JOIN));
            assert_eq!(64, xat.xid().unwrap().global_tid().len());
        }
        other => panic!("Lost the xa options: {other:?}"),
    }
}

#[tokio::test]
async fn read_lob_reply_sentinel() {
    let block = ReadLobReply::unresolved(uuid::Uuid::new_v4());
    assert!(!block.is_resolved());

    let mut reply = Reply::new(ReplyType::ReadLob);
    reply.push(Part::ReadLobReply(block));
    let mut wire = Vec::new();
    reply.emit(uuid::Uuid::nil(), 1, &mut wire).await.unwrap();
    let mut parsed = Reply::parse(&mut wire.as_slice()).await.unwrap();
    match parsed.parts.extract(PartKind::ReadLobReply) {
        Some(Part::ReadLobReply(block)) => {
            assert_eq!(-1, block.position());
            let (data, is_last) = block.into_data_and_last();
            assert!(data.is_empty());
            assert!(is_last);
        }
        other => panic!("Lost the block: {other:?}"),
    }
}

#[tokio::test]
async fn execution_results_round_trip() {
    let mut reply = Reply::new(ReplyType::ExecutionResults);
    reply.push(Part::ExecutionResults(vec![
        ExecutionResult::RowsAffected(42),
        ExecutionResult::SuccessNoInfo,
        ExecutionResult::Failure(Some(ServerError::backend(
            100,
            b"23505",
            "duplicate key".to_string(),
        ))),
    ]));
    let mut wire = Vec::new();
    reply.emit(uuid::Uuid::nil(), 2, &mut wire).await.unwrap();
    let mut parsed = Reply::parse(&mut wire.as_slice()).await.unwrap();
    match parsed.parts.extract(PartKind::ExecutionResults) {
        Some(Part::ExecutionResults(results)) => {
            assert_eq!(3, results.len());
            assert!(matches!(results[0], ExecutionResult::RowsAffected(42)));
            assert!(results[2].is_failure());
        }
        other => panic!("Lost the execution results: {other:?}"),
    }
}

#[tokio::test]
async fn session_info_round_trip() {
    let session_id = uuid::Uuid::new_v4();
    let info = SessionInfo::new(session_id, "0123abcd".to_string(), false);
    let mut reply = Reply::new(ReplyType::Connected);
    reply.push(Part::SessionInfo(info));
    let mut wire = Vec::new();
    reply.emit(session_id, 1, &mut wire).await.unwrap();
    let mut parsed = Reply::parse(&mut wire.as_slice()).await.unwrap();
    match parsed.parts.extract(PartKind::SessionInfo) {
        Some(Part::SessionInfo(info)) => {
            assert_eq!(session_id, info.session_id());
            assert_eq!("0123abcd", info.conn_hash());
        }
        other => panic!("Lost the session info: {other:?}"),
    }
}
