//! A scripted, in-process Cassandra node.
//!
//! Tests drive the real connection against a `TcpListener` whose handler
//! follows a fixed script: read request frames, reply with hand-built
//! response frames, push events, or drop the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use cql_mux::frame::types;
use cql_mux::{ConnectionConfig, Endpoint, ReconnectionPolicy};

pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

pub const STARTUP_OPCODE: u8 = 0x01;
pub const READY_OPCODE: u8 = 0x02;
pub const QUERY_OPCODE: u8 = 0x07;
pub const PREPARE_OPCODE: u8 = 0x09;
pub const ERROR_OPCODE: u8 = 0x00;
pub const RESULT_OPCODE: u8 = 0x08;
pub const EVENT_OPCODE: u8 = 0x0C;

pub struct RequestFrame {
    pub stream: i16,
    pub opcode: u8,
    pub body: Vec<u8>,
}

pub async fn read_request(socket: &mut TcpStream) -> RequestFrame {
    let mut header = [0u8; 9];
    socket.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x04, "expected a v4 client frame");

    let stream = i16::from_be_bytes([header[2], header[3]]);
    let opcode = header[4];
    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;

    let mut body = vec![0u8; length];
    socket.read_exact(&mut body).await.unwrap();

    RequestFrame {
        stream,
        opcode,
        body,
    }
}

pub async fn write_response(socket: &mut TcpStream, stream: i16, opcode: u8, body: &[u8]) {
    let mut frame = Vec::with_capacity(9 + body.len());
    frame.put_u8(0x84);
    frame.put_u8(0x00);
    frame.put_i16(stream);
    frame.put_u8(opcode);
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    socket.write_all(&frame).await.unwrap();
}

pub fn error_body(code: i32, reason: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(code, &mut body);
    types::write_string(reason, &mut body).unwrap();
    body
}

pub fn void_body() -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0001, &mut body);
    body
}

pub fn set_keyspace_body(keyspace: &str) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0003, &mut body);
    types::write_string(keyspace, &mut body).unwrap();
    body
}

pub fn prepared_body(id: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0004, &mut body);
    types::write_short_bytes(id, &mut body).unwrap();
    body
}

/// A Rows result with a single int column `pk` and one cell per value.
pub fn rows_body(values: &[i32], paging_state: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_int(0x0002, &mut body);

    let mut flags = 0x0001; // global table spec
    if paging_state.is_some() {
        flags |= 0x0002; // has more pages
    }
    types::write_int(flags, &mut body);
    types::write_int(1, &mut body);
    if let Some(token) = paging_state {
        types::write_bytes(token, &mut body).unwrap();
    }
    types::write_string("ks", &mut body).unwrap();
    types::write_string("tab", &mut body).unwrap();
    types::write_string("pk", &mut body).unwrap();
    types::write_short(0x0009, &mut body); // int

    types::write_int(values.len() as i32, &mut body);
    for value in values {
        types::write_bytes(&value.to_be_bytes(), &mut body).unwrap();
    }
    body
}

pub fn status_change_up_body(addr: SocketAddr) -> Vec<u8> {
    let mut body = Vec::new();
    types::write_string("STATUS_CHANGE", &mut body).unwrap();
    types::write_string("UP", &mut body).unwrap();
    types::write_inet(addr, &mut body);
    body
}

/// A QUERY frame encoded the way a caller would, for the pre-encoded
/// submission path.
pub fn raw_query_frame(contents: &str) -> Bytes {
    let mut body = Vec::new();
    types::write_long_string(contents, &mut body).unwrap();
    types::write_short(0x0001, &mut body); // consistency ONE
    body.put_u8(0x00); // no flags

    let mut frame = Vec::with_capacity(9 + body.len());
    frame.put_u8(0x04);
    frame.put_u8(0x00);
    frame.put_i16(0);
    frame.put_u8(QUERY_OPCODE);
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    frame.into()
}

pub struct QueryBody {
    pub contents: String,
    pub paging_state: Option<Vec<u8>>,
}

pub fn parse_query_body(body: &[u8]) -> QueryBody {
    let buf = &mut &body[..];
    let contents = types::read_long_string(buf).unwrap().to_owned();
    let _consistency = types::read_short(buf).unwrap();
    let flags = buf.get_u8();

    if flags & 0x01 != 0 {
        let values_count = types::read_short(buf).unwrap();
        for _ in 0..values_count {
            let _ = types::read_bytes_opt(buf).unwrap();
        }
    }
    if flags & 0x04 != 0 {
        let _page_size = types::read_int(buf).unwrap();
    }
    let paging_state = if flags & 0x08 != 0 {
        Some(types::read_bytes(buf).unwrap().to_vec())
    } else {
        None
    };

    QueryBody {
        contents,
        paging_state,
    }
}

pub async fn serve_handshake(socket: &mut TcpStream) {
    let startup = read_request(socket).await;
    assert_eq!(startup.opcode, STARTUP_OPCODE);
    assert_eq!(startup.stream, 0);
    write_response(socket, 0, READY_OPCODE, &[]).await;
}

pub async fn accept(listener: &TcpListener) -> TcpStream {
    let (socket, _) = listener.accept().await.unwrap();
    socket
}

pub async fn accept_and_handshake(listener: &TcpListener) -> TcpStream {
    let mut socket = accept(listener).await;
    serve_handshake(&mut socket).await;
    socket
}

pub struct MockNode {
    pub addr: SocketAddr,
}

impl MockNode {
    pub async fn spawn<F, Fut>(handler: F) -> MockNode
    where
        F: FnOnce(TcpListener) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(handler(listener));
        MockNode { addr }
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            endpoint: Endpoint::Address(self.addr.ip()),
            port: self.addr.port(),
            async_init: false,
            ..Default::default()
        }
    }
}

/// Fixed-delay policy that counts how many times it was consulted.
pub struct CountingPolicy {
    pub delay: Duration,
    pub consulted: Arc<AtomicUsize>,
}

impl ReconnectionPolicy for CountingPolicy {
    fn next_delay(&mut self) -> Option<Duration> {
        self.consulted.fetch_add(1, Ordering::SeqCst);
        Some(self.delay)
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}

pub fn int_cell(row: &cql_mux::frame::response::result::Row, column: usize) -> i32 {
    let cell = row.columns[column].as_ref().unwrap();
    i32::from_be_bytes(cell.as_ref().try_into().unwrap())
}
