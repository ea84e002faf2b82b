mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::sync::mpsc;
use uuid::Uuid;

use cql_mux::frame::response::event::{Event, StatusChangeEvent};
use cql_mux::{
    Connection, ConnectionError, HandshakeError, KeyspaceError, Query, QueryResult, Request,
    RequestError, SessionEvent,
};

use common::*;

#[tokio::test]
async fn handshake_rejection_fails_sync_init() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept(&listener).await;
        let startup = read_request(&mut socket).await;
        assert_eq!(startup.opcode, STARTUP_OPCODE);
        write_response(
            &mut socket,
            startup.stream,
            ERROR_OPCODE,
            &error_body(0x000A, "protocol"),
        )
        .await;
    })
    .await;

    let result = Connection::connect(node.config()).await;
    assert_matches!(
        result,
        Err(ConnectionError::Handshake(HandshakeError::Db {
            code: 0x000A,
            ..
        }))
    );
}

#[tokio::test]
async fn keyspace_mismatch_fails_sync_init() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let use_request = read_request(&mut socket).await;
        assert_eq!(use_request.opcode, QUERY_OPCODE);
        assert_eq!(parse_query_body(&use_request.body).contents, "USE ks1");
        write_response(
            &mut socket,
            use_request.stream,
            RESULT_OPCODE,
            &set_keyspace_body("ks2"),
        )
        .await;
    })
    .await;

    let mut config = node.config();
    config.keyspace = Some("ks1".to_owned());

    let result = Connection::connect(config).await;
    assert_matches!(
        result,
        Err(ConnectionError::Keyspace(KeyspaceError::Mismatch { .. }))
    );
}

#[tokio::test]
async fn keyspace_is_bound_after_handshake() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let use_request = read_request(&mut socket).await;
        write_response(
            &mut socket,
            use_request.stream,
            RESULT_OPCODE,
            &set_keyspace_body("ks1"),
        )
        .await;

        let query = read_request(&mut socket).await;
        write_response(&mut socket, query.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let mut config = node.config();
    config.keyspace = Some("ks1".to_owned());

    let connection = Connection::connect(config).await.unwrap();
    let result = connection.send(Query::new("INSERT INTO tab (pk) VALUES (1)")).await;
    assert_matches!(result, Ok(QueryResult::Void));
}

#[tokio::test]
async fn first_user_request_gets_stream_id_two() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;

        let first = read_request(&mut socket).await;
        assert_eq!(first.stream, 2);
        write_response(&mut socket, first.stream, RESULT_OPCODE, &void_body()).await;

        let second = read_request(&mut socket).await;
        assert_eq!(second.stream, 3);
        write_response(&mut socket, second.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();
    assert_matches!(
        connection.send(Query::new("INSERT INTO tab (pk) VALUES (1)")).await,
        Ok(QueryResult::Void)
    );
    assert_matches!(
        connection.send(Query::new("INSERT INTO tab (pk) VALUES (2)")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn server_error_reaches_only_its_waiter() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;

        let failing = read_request(&mut socket).await;
        write_response(
            &mut socket,
            failing.stream,
            ERROR_OPCODE,
            &error_body(0x2200, "unconfigured table"),
        )
        .await;

        let fine = read_request(&mut socket).await;
        write_response(&mut socket, fine.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();

    let result = connection.send(Query::new("SELECT pk FROM nonexistent")).await;
    assert_matches!(
        result,
        Err(RequestError::Db { code: 0x2200, ref message }) if message == "unconfigured table"
    );

    // The failure was local to that request.
    assert_matches!(
        connection.send(Query::new("INSERT INTO tab (pk) VALUES (1)")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn single_page_rows_are_returned_inline() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let query = read_request(&mut socket).await;
        write_response(
            &mut socket,
            query.stream,
            RESULT_OPCODE,
            &rows_body(&[1, 2, 3], None),
        )
        .await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();
    let result = connection.send(Query::new("SELECT pk FROM tab")).await;

    let rows = match result {
        Ok(QueryResult::Rows(rows)) => rows,
        other => panic!("expected inline rows, got {:?}", other),
    };
    assert_eq!(rows.rows_count, 3);
    assert_eq!(rows.metadata.col_specs[0].name, "pk");
    let values: Vec<i32> = rows.rows.iter().map(|row| int_cell(row, 0)).collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[tokio::test]
async fn paged_rows_stream_across_pages() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;

        let first = read_request(&mut socket).await;
        let first_body = parse_query_body(&first.body);
        assert_eq!(first_body.contents, "SELECT pk FROM tab");
        assert_eq!(first_body.paging_state, None);
        let page_one: Vec<i32> = (0..10).collect();
        write_response(
            &mut socket,
            first.stream,
            RESULT_OPCODE,
            &rows_body(&page_one, Some(b"token-1")),
        )
        .await;

        // Exactly one follow-up submission, carrying the continuation token.
        let second = read_request(&mut socket).await;
        let second_body = parse_query_body(&second.body);
        assert_eq!(second_body.contents, "SELECT pk FROM tab");
        assert_eq!(second_body.paging_state.as_deref(), Some(&b"token-1"[..]));
        let page_two: Vec<i32> = (10..15).collect();
        write_response(
            &mut socket,
            second.stream,
            RESULT_OPCODE,
            &rows_body(&page_two, None),
        )
        .await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();
    let result = connection
        .send(Query::new("SELECT pk FROM tab").with_page_size(10))
        .await;

    let mut stream = match result {
        Ok(QueryResult::RowStream(stream)) => stream,
        other => panic!("expected a row stream, got {:?}", other),
    };
    assert_eq!(stream.column_specs()[0].name, "pk");

    let mut values = Vec::new();
    while let Some(row) = stream.next_row().await {
        values.push(int_cell(&row.unwrap(), 0));
    }
    assert_eq!(values, (0..15).collect::<Vec<i32>>());
}

#[tokio::test]
async fn prepared_response_notifies_the_session() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let prepare = read_request(&mut socket).await;
        assert_eq!(prepare.opcode, PREPARE_OPCODE);
        write_response(
            &mut socket,
            prepare.stream,
            RESULT_OPCODE,
            &prepared_body(b"prep-id"),
        )
        .await;
    })
    .await;

    let (session_sink, mut session_events) = mpsc::unbounded_channel();
    let host_id = Uuid::new_v4();
    let mut config = node.config();
    config.session_sink = Some(session_sink);
    config.host_id = Some(host_id);

    let connection = Connection::connect(config).await.unwrap();

    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionOpened { host_id: id }) if id == host_id
    );

    let result = connection
        .send(cql_mux::Prepare {
            query: "SELECT pk FROM tab WHERE pk = ?".to_owned(),
        })
        .await;
    let prepared = match result {
        Ok(QueryResult::Prepared(prepared)) => prepared,
        other => panic!("expected a prepared result, got {:?}", other),
    };
    assert_eq!(prepared.id.as_ref(), b"prep-id");

    match session_events.recv().await {
        Some(SessionEvent::Prepared {
            host_id: id,
            hash,
            prepared: notified,
        }) => {
            assert_eq!(id, host_id);
            assert_eq!(notified.id, prepared.id);
            // Digest of the encoded request is stable across submissions.
            assert_ne!(hash, [0u8; 16]);
        }
        other => panic!("expected a prepared notification, got {:?}", other),
    }
}

#[tokio::test]
async fn server_event_is_delivered_to_the_sink() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        write_response(
            &mut socket,
            -1,
            EVENT_OPCODE,
            &status_change_up_body("10.0.0.7:9042".parse().unwrap()),
        )
        .await;

        let query = read_request(&mut socket).await;
        write_response(&mut socket, query.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let (event_sink, mut events) = mpsc::unbounded_channel();
    let mut config = node.config();
    config.event_sink = Some(event_sink);

    let connection = Connection::connect(config).await.unwrap();

    let event = events.recv().await.unwrap();
    assert_matches!(
        event,
        Event::StatusChange(StatusChangeEvent::Up(addr)) if addr == "10.0.0.7:9042".parse().unwrap()
    );

    // Requests multiplex happily around events.
    assert_matches!(
        connection.send(Query::new("INSERT INTO tab (pk) VALUES (1)")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn server_event_without_a_sink_is_dropped() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;

        let query = read_request(&mut socket).await;
        write_response(
            &mut socket,
            -1,
            EVENT_OPCODE,
            &status_change_up_body("10.0.0.7:9042".parse().unwrap()),
        )
        .await;
        write_response(&mut socket, query.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();

    // The event preceding the reply is logged and dropped; the pending
    // request is untouched.
    assert_matches!(
        connection.send(Query::new("INSERT INTO tab (pk) VALUES (1)")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn socket_drop_wakes_every_pending_waiter() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        for _ in 0..3 {
            read_request(&mut socket).await;
        }
        // Never reply; drop the socket instead.
    })
    .await;

    let (session_sink, mut session_events) = mpsc::unbounded_channel();
    let consulted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let host_id = Uuid::new_v4();
    let mut config = node.config();
    config.session_sink = Some(session_sink);
    config.host_id = Some(host_id);
    config.reconnection_policy = Box::new(CountingPolicy {
        delay: Duration::from_secs(600),
        consulted: consulted.clone(),
    });

    let connection = Connection::connect(config).await.unwrap();
    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionOpened { .. })
    );

    let (first, second, third) = tokio::join!(
        connection.send_with_timeout(Query::new("SELECT pk FROM tab"), None),
        connection.send_with_timeout(Query::new("SELECT pk FROM tab"), None),
        connection.send_with_timeout(Query::new("SELECT pk FROM tab"), None),
    );
    assert_matches!(first, Err(RequestError::Closed));
    assert_matches!(second, Err(RequestError::Closed));
    assert_matches!(third, Err(RequestError::Closed));

    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionClosed { host_id: id }) if id == host_id
    );
    assert_eq!(consulted.load(Ordering::SeqCst), 1);

    // While waiting out the backoff, submissions are refused immediately.
    assert_matches!(
        connection.send(Query::new("SELECT pk FROM tab")).await,
        Err(RequestError::NotConnected)
    );
}

#[tokio::test]
async fn send_async_correlates_out_of_order_replies() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;

        let first = read_request(&mut socket).await;
        let second = read_request(&mut socket).await;
        // Answer in reverse submission order.
        write_response(&mut socket, second.stream, RESULT_OPCODE, &void_body()).await;
        write_response(
            &mut socket,
            first.stream,
            ERROR_OPCODE,
            &error_body(0x2200, "unconfigured table"),
        )
        .await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();

    let (reply_sink, mut replies) = mpsc::unbounded_channel();
    let first_id = connection.send_async(Query::new("SELECT pk FROM nope"), reply_sink.clone());
    let second_id = connection.send_async(Query::new("SELECT pk FROM tab"), reply_sink);
    assert_ne!(first_id, second_id);

    let (id, result) = replies.recv().await.unwrap();
    assert_eq!(id, second_id);
    assert_matches!(result, Ok(QueryResult::Void));

    let (id, result) = replies.recv().await.unwrap();
    assert_eq!(id, first_id);
    assert_matches!(result, Err(RequestError::Db { code: 0x2200, .. }));
}

#[tokio::test]
async fn undecodable_raw_request_is_invalid_and_local() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        // Only the well-formed query ever reaches the wire.
        let query = read_request(&mut socket).await;
        assert_eq!(query.opcode, QUERY_OPCODE);
        write_response(&mut socket, query.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();

    let result = connection
        .send(Request::Raw(bytes::Bytes::from_static(b"garbage")))
        .await;
    assert_matches!(result, Err(RequestError::Invalid));

    assert_matches!(
        connection.send(Query::new("INSERT INTO tab (pk) VALUES (1)")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn pre_encoded_request_gets_a_patched_stream_id() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let query = read_request(&mut socket).await;
        assert_eq!(query.stream, 2);
        assert_eq!(parse_query_body(&query.body).contents, "SELECT pk FROM tab");
        write_response(&mut socket, query.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();
    let result = connection
        .send(Request::Raw(raw_query_frame("SELECT pk FROM tab")))
        .await;
    assert_matches!(result, Ok(QueryResult::Void));
}

#[tokio::test]
async fn stop_wakes_pending_waiters_and_notifies_the_session() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let _pending = read_request(&mut socket).await;
        // Keep the socket open without ever replying.
        std::future::pending::<()>().await;
    })
    .await;

    let (session_sink, mut session_events) = mpsc::unbounded_channel();
    let host_id = Uuid::new_v4();
    let mut config = node.config();
    config.session_sink = Some(session_sink);
    config.host_id = Some(host_id);

    let connection = Connection::connect(config).await.unwrap();
    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionOpened { .. })
    );

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .send_with_timeout(Query::new("SELECT pk FROM tab"), None)
                .await
        })
    };
    // Let the request reach the wire before stopping.
    tokio::time::sleep(Duration::from_millis(50)).await;

    connection.stop().await;

    assert_matches!(pending.await.unwrap(), Err(RequestError::Closed));
    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionStopped { host_id: id }) if id == host_id
    );

    // The connection is gone for good.
    assert_matches!(
        connection.send(Query::new("SELECT pk FROM tab")).await,
        Err(RequestError::Closed)
    );
}

#[tokio::test]
async fn caller_timeout_leaves_the_request_in_flight() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;

        let slow = read_request(&mut socket).await;
        let fast = read_request(&mut socket).await;
        write_response(&mut socket, fast.stream, RESULT_OPCODE, &void_body()).await;
        // The late reply lands in a dead waiter and gets dropped.
        write_response(&mut socket, slow.stream, RESULT_OPCODE, &void_body()).await;

        let after = read_request(&mut socket).await;
        write_response(&mut socket, after.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();

    let timed_out = connection
        .send_with_timeout(
            Query::new("SELECT pk FROM slow"),
            Some(Duration::from_millis(30)),
        )
        .await;
    assert_matches!(timed_out, Err(RequestError::Timeout));

    // The connection keeps serving; the stale response does not disturb it.
    assert_matches!(
        connection.send(Query::new("SELECT pk FROM fast")).await,
        Ok(QueryResult::Void)
    );
    assert_matches!(
        connection.send(Query::new("SELECT pk FROM after")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn reconnects_with_backoff_after_a_drop() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        // First connection: handshake, then drop immediately.
        let socket = accept_and_handshake(&listener).await;
        drop(socket);

        // Second connection: serve one query.
        let mut socket = accept_and_handshake(&listener).await;
        let query = read_request(&mut socket).await;
        write_response(&mut socket, query.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let (session_sink, mut session_events) = mpsc::unbounded_channel();
    let mut config = node.config();
    config.session_sink = Some(session_sink);
    config.host_id = Some(Uuid::new_v4());

    let connection = Connection::connect(config).await.unwrap();

    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionOpened { .. })
    );
    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionClosed { .. })
    );
    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionOpened { .. })
    );

    // The fresh socket serves requests again.
    assert_matches!(
        connection.send(Query::new("SELECT pk FROM tab")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn event_body_on_a_user_stream_is_passed_through() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let query = read_request(&mut socket).await;
        write_response(
            &mut socket,
            query.stream,
            EVENT_OPCODE,
            &status_change_up_body("10.0.0.7:9042".parse().unwrap()),
        )
        .await;

        let next = read_request(&mut socket).await;
        write_response(&mut socket, next.stream, RESULT_OPCODE, &void_body()).await;
    })
    .await;

    let connection = Connection::connect(node.config()).await.unwrap();

    let result = connection.send(Query::new("SELECT pk FROM tab")).await;
    assert_matches!(
        result,
        Ok(QueryResult::Other(Event::StatusChange(
            StatusChangeEvent::Up(_)
        )))
    );

    // An odd body is a reply like any other; the connection keeps serving.
    assert_matches!(
        connection.send(Query::new("INSERT INTO tab (pk) VALUES (1)")).await,
        Ok(QueryResult::Void)
    );
}

#[tokio::test]
async fn non_event_body_on_the_event_stream_disconnects() {
    setup_tracing();
    let node = MockNode::spawn(|listener| async move {
        let mut socket = accept_and_handshake(&listener).await;
        let _pending = read_request(&mut socket).await;
        // A READY body where only server events belong.
        write_response(&mut socket, -1, READY_OPCODE, &[]).await;
        // Keep the socket open so the close observed by the client is the
        // connection's own doing.
        std::future::pending::<()>().await;
    })
    .await;

    let (session_sink, mut session_events) = mpsc::unbounded_channel();
    let host_id = Uuid::new_v4();
    let mut config = node.config();
    config.session_sink = Some(session_sink);
    config.host_id = Some(host_id);

    let connection = Connection::connect(config).await.unwrap();
    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionOpened { .. })
    );

    let pending = connection
        .send_with_timeout(Query::new("SELECT pk FROM tab"), None)
        .await;
    assert_matches!(pending, Err(RequestError::Closed));

    assert_matches!(
        session_events.recv().await,
        Some(SessionEvent::ConnectionClosed { host_id: id }) if id == host_id
    );
}
