//! The connection core: one socket, one owner task, multiplexed requests.
//!
//! Callers talk to [`Connection`], a cheap cloneable handle. All mutable
//! state (the socket, the partial-frame buffer, the table of in-flight
//! stream ids) lives inside a single worker task which the handle feeds
//! through a submission channel. The worker serves the socket while it is
//! ready, and drives reconnection with backoff when it is not.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::errors::{ConnectionError, HandshakeError, KeyspaceError, RequestError};
use crate::frame::frame_errors::{FrameError, ParseError};
use crate::frame::request::query::PagingState;
use crate::frame::request::{Query, Request, Startup};
use crate::frame::response::{result, Event, Response};
use crate::frame::{read_response, FrameBuffer, ResponseFrame, SerializedRequest, EVENT_STREAM_ID};
use crate::network::{ConnectionConfig, Endpoint, SessionEvent};

/// Default caller-side wait applied by [`Connection::send`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// Stream id 0 is used by the handshake, stream id 1 carries server-side
// informational frames. Neither is ever assigned to a user request.
const HANDSHAKE_STREAM_ID: i16 = 0;
const RESERVED_STREAM_ID: i16 = 1;
const MIN_STREAM_ID: i16 = 2;
const MAX_STREAM_ID: i16 = 32000;

const READ_CHUNK_SIZE: usize = 8192;

/// Correlation token handed out by [`Connection::send_async`].
pub type RequestId = u64;

pub type RequestResult = Result<QueryResult, RequestError>;

/// Sink that `send_async` replies are delivered to, tagged with the
/// correlation token of the request they answer.
pub type AsyncReplySink = mpsc::UnboundedSender<(RequestId, RequestResult)>;

/// A successful reply; every accepted request produces exactly one.
#[derive(Debug)]
pub enum QueryResult {
    Void,
    Ready,
    /// A complete, single-page Rows result.
    Rows(result::Rows),
    /// A paged Rows result: rows arrive through the stream as the connection
    /// fetches successive pages behind the scenes.
    RowStream(RowStream),
    SetKeyspace(String),
    Prepared(result::Prepared),
    SchemaChange(result::SchemaChange),
    /// Any other well-formed body correlated to the request, passed through
    /// as-is.
    Other(Event),
}

/// Rows of a paged query.
///
/// Yields the concatenation of all pages' rows in wire order and ends after
/// the page that carried no continuation token. If the connection breaks
/// mid-query, the stream yields one `Err` and ends.
#[derive(Debug)]
pub struct RowStream {
    metadata: result::ResultMetadata,
    receiver: mpsc::UnboundedReceiver<Result<result::Row, RequestError>>,
}

impl RowStream {
    /// Column specs of the first page.
    pub fn column_specs(&self) -> &[result::ColumnSpec] {
        &self.metadata.col_specs
    }

    pub async fn next_row(&mut self) -> Option<Result<result::Row, RequestError>> {
        self.receiver.recv().await
    }
}

impl Stream for RowStream {
    type Item = Result<result::Row, RequestError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

type RowSink = mpsc::UnboundedSender<Result<result::Row, RequestError>>;

/// Where a response gets delivered.
enum ResponseWaiter {
    /// A caller blocked in `send`.
    Sync(oneshot::Sender<RequestResult>),
    /// A `send_async` caller; the reply goes to its sink, tagged.
    Async {
        correlation: RequestId,
        sink: AsyncReplySink,
    },
    /// An open row stream fed by successive pages.
    Paging(RowSink),
}

impl ResponseWaiter {
    fn complete(self, result: RequestResult) {
        match self {
            // The receiving side may have given up waiting; that is fine.
            ResponseWaiter::Sync(sender) => {
                let _ = sender.send(result);
            }
            ResponseWaiter::Async { correlation, sink } => {
                let _ = sink.send((correlation, result));
            }
            ResponseWaiter::Paging(sink) => {
                if let Err(err) = result {
                    let _ = sink.send(Err(err));
                }
                // Dropping the sink ends the stream.
            }
        }
    }
}

struct PendingRequest {
    request: Request,
    waiter: ResponseWaiter,
}

/// In-flight requests keyed by stream id.
///
/// Ids are handed out sequentially from a `last_stream_id` hint, wrapping
/// from 32000 back to 2. A wrap-around that lands on a still-occupied id is
/// reported instead of evicting the older request.
struct StreamTable {
    last_stream_id: i16,
    streams: HashMap<i16, PendingRequest>,
}

impl StreamTable {
    fn new() -> Self {
        Self {
            // First allocation wraps to MIN_STREAM_ID.
            last_stream_id: MAX_STREAM_ID,
            streams: HashMap::new(),
        }
    }

    fn next_id(&self) -> i16 {
        if self.last_stream_id == MAX_STREAM_ID {
            MIN_STREAM_ID
        } else {
            self.last_stream_id + 1
        }
    }

    fn is_free(&self, stream_id: i16) -> bool {
        !self.streams.contains_key(&stream_id)
    }

    fn occupy(&mut self, stream_id: i16, pending: PendingRequest) {
        let prev = self.streams.insert(stream_id, pending);
        debug_assert!(prev.is_none());
        self.last_stream_id = stream_id;
    }

    fn release(&mut self, stream_id: i16) -> Option<PendingRequest> {
        self.streams.remove(&stream_id)
    }

    fn drain(&mut self) -> Vec<PendingRequest> {
        self.streams.drain().map(|(_, pending)| pending).collect()
    }

    fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

enum Command {
    Request {
        request: Request,
        waiter: ResponseWaiter,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a single-node connection.
///
/// Cloning is cheap; all clones feed the same worker. The worker stops when
/// [`Connection::stop`] is called or the last handle is dropped.
#[derive(Clone, Debug)]
pub struct Connection {
    submit_channel: mpsc::UnboundedSender<Command>,
    request_id_generator: Arc<AtomicU64>,
    request_timeout: Option<Duration>,
}

impl Connection {
    /// Opens a connection per `config`.
    ///
    /// With `async_init` set, this returns immediately and the first connect
    /// attempt runs in the background, retried per the reconnection policy.
    /// Otherwise the connect and handshake run inline, and their failure is
    /// returned here with nothing left running.
    pub async fn connect(config: ConnectionConfig) -> Result<Connection, ConnectionError> {
        let initial_socket = if config.async_init {
            None
        } else {
            Some(open_and_handshake(&config).await?)
        };

        let (submit_channel, command_receiver) = mpsc::unbounded_channel();
        let connection = Connection {
            submit_channel,
            request_id_generator: Arc::new(AtomicU64::new(0)),
            request_timeout: config.request_timeout,
        };

        let worker = Worker::new(config, command_receiver);
        tokio::spawn(worker.run(initial_socket));

        Ok(connection)
    }

    /// Submits `request` and waits for its reply.
    ///
    /// The wait is bounded by the configured request timeout (5 s unless
    /// overridden). A timed-out wait abandons the reply but does not cancel
    /// the request: the stream id stays occupied until the response arrives
    /// or the socket dies.
    pub async fn send(&self, request: impl Into<Request>) -> RequestResult {
        let timeout = self.request_timeout.or(Some(DEFAULT_REQUEST_TIMEOUT));
        self.send_with_timeout(request, timeout).await
    }

    /// Like [`Connection::send`], with an explicit wait bound. `None` waits
    /// forever.
    pub async fn send_with_timeout(
        &self,
        request: impl Into<Request>,
        timeout: Option<Duration>,
    ) -> RequestResult {
        let (sender, receiver) = oneshot::channel();
        let command = Command::Request {
            request: request.into(),
            waiter: ResponseWaiter::Sync(sender),
        };
        if self.submit_channel.send(command).is_err() {
            return Err(RequestError::Closed);
        }

        let wait = async { receiver.await.unwrap_or(Err(RequestError::Closed)) };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .unwrap_or(Err(RequestError::Timeout)),
            None => wait.await,
        }
    }

    /// Submits `request` without waiting.
    ///
    /// Returns a fresh correlation token; once the response is routed, a
    /// `(token, result)` pair is delivered to `sink`.
    pub fn send_async(&self, request: impl Into<Request>, sink: AsyncReplySink) -> RequestId {
        let correlation = self.request_id_generator.fetch_add(1, Ordering::Relaxed);
        let command = Command::Request {
            request: request.into(),
            waiter: ResponseWaiter::Async {
                correlation,
                sink: sink.clone(),
            },
        };
        if self.submit_channel.send(command).is_err() {
            let _ = sink.send((correlation, Err(RequestError::Closed)));
        }
        correlation
    }

    /// Orderly shutdown: every pending waiter is woken with
    /// [`RequestError::Closed`], the session sink is notified, the socket is
    /// closed. Waits until the worker has acknowledged.
    pub async fn stop(&self) {
        let (done, acked) = oneshot::channel();
        if self.submit_channel.send(Command::Stop { done }).is_ok() {
            let _ = acked.await;
        }
    }
}

/// Why the worker left the ready state.
#[derive(Error, Debug)]
enum Disconnect {
    #[error("Connection closed by the peer")]
    PeerClosed,
    #[error("Socket send stalled past the send timeout")]
    SendTimeout,
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Received response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),
    #[error("Received a non-EVENT body on the event stream id")]
    UnexpectedEventBody,
}

enum Flow {
    /// Keep running; sleep `Backoff` before the next connect attempt.
    Continue,
    Backoff(Duration),
    Exit(Exit),
}

enum Exit {
    /// `stop()` was called; acknowledge through the sender.
    Stopped(oneshot::Sender<()>),
    /// Every `Connection` handle is gone.
    HandlesDropped,
    /// The reconnection policy told us to stop retrying.
    GaveUp,
}

enum Wake {
    Command(Option<Command>),
    Read(std::io::Result<usize>),
}

struct Worker {
    config: ConnectionConfig,
    command_receiver: mpsc::UnboundedReceiver<Command>,
    socket: Option<TcpStream>,
    buffer: FrameBuffer,
    streams: StreamTable,
}

impl Worker {
    fn new(config: ConnectionConfig, command_receiver: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            config,
            command_receiver,
            socket: None,
            buffer: FrameBuffer::new(),
            streams: StreamTable::new(),
        }
    }

    async fn run(mut self, initial_socket: Option<TcpStream>) {
        if let Some(socket) = initial_socket {
            self.install_socket(socket);
        }

        let mut backoff = Duration::ZERO;
        let exit = loop {
            let flow = if self.socket.is_some() {
                self.serve().await
            } else {
                self.reconnect(backoff).await
            };
            match flow {
                Flow::Continue => {}
                Flow::Backoff(delay) => backoff = delay,
                Flow::Exit(exit) => break exit,
            }
        };

        self.shutdown(exit);
    }

    fn install_socket(&mut self, socket: TcpStream) {
        debug_assert!(self.streams.is_empty());
        self.socket = Some(socket);
        self.buffer = FrameBuffer::new();
        self.config.reconnection_policy.reset();
        self.notify_session(|host_id| SessionEvent::ConnectionOpened { host_id });
    }

    /// Ready state: multiplex submissions and socket reads until something
    /// breaks or the connection is stopped.
    async fn serve(&mut self) -> Flow {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let wake = {
                let socket = match self.socket.as_mut() {
                    Some(socket) => socket,
                    None => return Flow::Continue,
                };
                tokio::select! {
                    command = self.command_receiver.recv() => Wake::Command(command),
                    read = socket.read(&mut chunk) => Wake::Read(read),
                }
            };

            match wake {
                Wake::Command(None) => return Flow::Exit(Exit::HandlesDropped),
                Wake::Command(Some(Command::Stop { done })) => {
                    return Flow::Exit(Exit::Stopped(done));
                }
                Wake::Command(Some(Command::Request { request, waiter })) => {
                    if let Err(reason) = self.dispatch(request, waiter).await {
                        return self.disconnect(reason);
                    }
                }
                Wake::Read(Ok(0)) => return self.disconnect(Disconnect::PeerClosed),
                Wake::Read(Ok(n)) => {
                    self.buffer.append(&chunk[..n]);
                    if let Err(reason) = self.drain_frames().await {
                        return self.disconnect(reason);
                    }
                }
                Wake::Read(Err(err)) => return self.disconnect(Disconnect::Io(Arc::new(err))),
            }
        }
    }

    async fn drain_frames(&mut self) -> Result<(), Disconnect> {
        loop {
            match self.buffer.try_pull()? {
                Some(frame) => self.route_frame(frame).await?,
                None => return Ok(()),
            }
        }
    }

    /// Assign a stream id, encode, write to the socket, park the waiter.
    async fn dispatch(
        &mut self,
        request: Request,
        waiter: ResponseWaiter,
    ) -> Result<(), Disconnect> {
        let socket = match self.socket.as_mut() {
            None => {
                waiter.complete(Err(RequestError::NotConnected));
                return Ok(());
            }
            Some(socket) => socket,
        };

        let stream_id = self.streams.next_id();
        if !self.streams.is_free(stream_id) {
            // Wrap-around landed on a request that is still in flight. The id
            // space is the CQL layer's contract; refuse rather than evict.
            warn!(stream_id, "Stream id wrapped onto an in-flight request");
            waiter.complete(Err(RequestError::Invalid));
            return Ok(());
        }

        let mut serialized = match request.to_serialized() {
            Ok(serialized) => serialized,
            Err(parse_error) => {
                debug!(%parse_error, "Request rejected by the codec");
                waiter.complete(Err(RequestError::Invalid));
                return Ok(());
            }
        };
        serialized.set_stream(stream_id);

        let write = socket.write_all(serialized.get_data());
        let written = match self.config.send_timeout {
            Some(send_timeout) => match tokio::time::timeout(send_timeout, write).await {
                Ok(written) => written,
                Err(_elapsed) => {
                    waiter.complete(Err(RequestError::Timeout));
                    return Err(Disconnect::SendTimeout);
                }
            },
            None => write.await,
        };
        if let Err(err) = written {
            let err = Arc::new(err);
            waiter.complete(Err(RequestError::Io(err.clone())));
            return Err(Disconnect::Io(err));
        }

        trace!(stream_id, "Request dispatched");
        self.streams.occupy(stream_id, PendingRequest { request, waiter });
        Ok(())
    }

    /// Deliver one whole frame to whoever it belongs to.
    async fn route_frame(&mut self, frame: ResponseFrame) -> Result<(), Disconnect> {
        let stream_id = frame.params.stream;

        if stream_id < EVENT_STREAM_ID {
            // The protocol reserves negative stream ids for the server; only
            // -1 is in use. Ignore the rest.
            trace!(stream_id, "Ignoring frame with negative stream id");
            return Ok(());
        }
        if stream_id == EVENT_STREAM_ID {
            return self.handle_event(frame);
        }
        if stream_id == HANDSHAKE_STREAM_ID {
            // Leftover from the handshake exchange; nothing waits for it.
            trace!("Ignoring frame on the handshake stream id");
            return Ok(());
        }
        if stream_id == RESERVED_STREAM_ID {
            match decode_response(&frame) {
                Ok(Response::Error(err)) => {
                    error!(code = err.code, reason = %err.reason, "Server error on reserved stream id 1");
                }
                Ok(response) => debug!(?response, "Server message on reserved stream id 1"),
                Err(parse_error) => {
                    warn!(%parse_error, "Undecodable frame on reserved stream id 1");
                }
            }
            return Ok(());
        }

        let pending = match self.streams.release(stream_id) {
            Some(pending) => pending,
            None => {
                // Unsolicited frame. This should not happen and indicates a
                // bug either in this driver or in the database.
                debug!(stream_id, "Received response with unexpected stream id");
                return Err(Disconnect::UnexpectedStreamId(stream_id));
            }
        };

        let response = match decode_response(&frame) {
            Ok(response) => response,
            Err(parse_error) => {
                // The mux can no longer be trusted; this waiter gets the same
                // answer the disconnect is about to give everyone else.
                pending.waiter.complete(Err(RequestError::Closed));
                return Err(FrameError::Parse(parse_error).into());
            }
        };
        self.deliver(pending, response).await
    }

    fn handle_event(&mut self, frame: ResponseFrame) -> Result<(), Disconnect> {
        let response = decode_response(&frame).map_err(FrameError::Parse)?;
        let event = match response {
            Response::Event(event) => event,
            other => {
                // Only the server writes to this stream id; anything but an
                // EVENT body here means the mux can no longer be trusted.
                debug!(?other, "Expected an EVENT body on the event stream id");
                return Err(Disconnect::UnexpectedEventBody);
            }
        };
        match self.config.event_sink.as_ref() {
            Some(sink) => {
                let _ = sink.send(event);
            }
            None => warn!(?event, "No event sink configured, dropping server event"),
        }
        Ok(())
    }

    /// Dispatch on the body of a response correlated to a user stream.
    async fn deliver(
        &mut self,
        pending: PendingRequest,
        response: Response,
    ) -> Result<(), Disconnect> {
        let PendingRequest { request, waiter } = pending;

        // An open row stream only ever expects further pages.
        let waiter = match waiter {
            ResponseWaiter::Paging(sink) => {
                match response {
                    Response::Result(result::Result::Rows(rows)) => {
                        return self.deliver_page(request, rows, sink).await;
                    }
                    Response::Error(err) => {
                        let _ = sink.send(Err(RequestError::Db {
                            code: err.code,
                            message: err.reason,
                        }));
                    }
                    other => warn!(?other, "Unexpected response to a page fetch"),
                }
                return Ok(());
            }
            waiter => waiter,
        };

        match response {
            Response::Ready => waiter.complete(Ok(QueryResult::Ready)),
            Response::Error(err) => waiter.complete(Err(RequestError::Db {
                code: err.code,
                message: err.reason,
            })),
            Response::Result(result::Result::Void) => waiter.complete(Ok(QueryResult::Void)),
            Response::Result(result::Result::Rows(rows)) => {
                match rows.metadata.paging_state {
                    None => waiter.complete(Ok(QueryResult::Rows(rows))),
                    Some(_) => {
                        // First page of a paged result: hand the caller a
                        // stream in place of the rows, then keep feeding it.
                        let (sink, receiver) = mpsc::unbounded_channel();
                        let mut metadata = rows.metadata.clone();
                        metadata.paging_state = None;
                        waiter.complete(Ok(QueryResult::RowStream(RowStream {
                            metadata,
                            receiver,
                        })));
                        return self.deliver_page(request, rows, sink).await;
                    }
                }
            }
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                waiter.complete(Ok(QueryResult::SetKeyspace(set_keyspace.keyspace_name)))
            }
            Response::Result(result::Result::Prepared(prepared)) => {
                self.notify_prepared(&request, &prepared);
                waiter.complete(Ok(QueryResult::Prepared(prepared)));
            }
            Response::Result(result::Result::SchemaChange(schema_change)) => {
                waiter.complete(Ok(QueryResult::SchemaChange(schema_change)))
            }
            Response::Event(event) => {
                // Odd, but well-formed; hand it to the caller unchanged.
                debug!(?event, "EVENT body correlated to a user stream");
                waiter.complete(Ok(QueryResult::Other(event)));
            }
        }
        Ok(())
    }

    /// Push one page of rows into `sink`; if the server indicated more pages,
    /// re-dispatch the original request with the continuation token.
    async fn deliver_page(
        &mut self,
        request: Request,
        rows: result::Rows,
        sink: RowSink,
    ) -> Result<(), Disconnect> {
        let continuation = rows.metadata.paging_state.clone();
        for row in rows.rows {
            let _ = sink.send(Ok(row));
        }

        let token = match continuation {
            Some(token) => token,
            None => return Ok(()), // last page; dropping the sink ends the stream
        };
        if sink.is_closed() {
            debug!("Row stream dropped by the caller, not fetching further pages");
            return Ok(());
        }

        match request {
            Request::Query(mut query) => {
                query.parameters.paging_state = PagingState::new_from_raw_bytes(&token);
                self.dispatch(Request::Query(query), ResponseWaiter::Paging(sink))
                    .await
            }
            _ => {
                // A continuation token cannot be spliced into a frame the
                // caller encoded themselves.
                warn!("Paged result for a pre-encoded request, closing the row stream early");
                Ok(())
            }
        }
    }

    fn notify_prepared(&self, request: &Request, prepared: &result::Prepared) {
        let (sink, host_id) = match (&self.config.session_sink, self.config.host_id) {
            (Some(sink), Some(host_id)) => (sink, host_id),
            _ => return,
        };
        // Hash the request as encoded on the wire, before stream id
        // assignment, so equal requests map to equal digests.
        let serialized = match request.to_serialized() {
            Ok(serialized) => serialized,
            Err(_) => return,
        };
        let hash: [u8; 16] = Md5::digest(serialized.get_data()).into();
        let _ = sink.send(SessionEvent::Prepared {
            host_id,
            hash,
            prepared: prepared.clone(),
        });
    }

    /// Ready → Disconnected: close the socket, wake everyone, consult the
    /// reconnection policy.
    fn disconnect(&mut self, reason: Disconnect) -> Flow {
        warn!(error = %reason, "Connection broken");
        self.socket = None;
        self.buffer = FrameBuffer::new();
        self.wake_all(RequestError::Closed);
        self.notify_session(|host_id| SessionEvent::ConnectionClosed { host_id });

        match self.config.reconnection_policy.next_delay() {
            Some(delay) => Flow::Backoff(delay),
            None => Flow::Exit(Exit::GaveUp),
        }
    }

    /// Reconnecting state: wait out the backoff (answering submissions with
    /// `NotConnected` meanwhile), then try to connect and handshake.
    async fn reconnect(&mut self, backoff: Duration) -> Flow {
        if !backoff.is_zero() {
            debug!(?backoff, "Waiting before the next connect attempt");
            let sleep = tokio::time::sleep(backoff);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    command = self.command_receiver.recv() => match command {
                        None => return Flow::Exit(Exit::HandlesDropped),
                        Some(Command::Stop { done }) => return Flow::Exit(Exit::Stopped(done)),
                        Some(Command::Request { waiter, .. }) => {
                            waiter.complete(Err(RequestError::NotConnected));
                        }
                    },
                    _ = &mut sleep => break,
                }
            }
        }

        match open_and_handshake(&self.config).await {
            Ok(socket) => {
                self.install_socket(socket);
                Flow::Continue
            }
            Err(err) => {
                warn!(error = %err, "Connect attempt failed");
                match self.config.reconnection_policy.next_delay() {
                    Some(delay) => Flow::Backoff(delay),
                    None => Flow::Exit(Exit::GaveUp),
                }
            }
        }
    }

    fn wake_all(&mut self, error: RequestError) {
        for pending in self.streams.drain() {
            pending.waiter.complete(Err(error.clone()));
        }
    }

    fn notify_session(&self, event: impl FnOnce(Uuid) -> SessionEvent) {
        if let (Some(sink), Some(host_id)) = (&self.config.session_sink, self.config.host_id) {
            let _ = sink.send(event(host_id));
        }
    }

    fn shutdown(mut self, exit: Exit) {
        self.socket = None;
        self.wake_all(RequestError::Closed);

        // Submissions that raced with the shutdown still get an answer.
        self.command_receiver.close();
        while let Ok(command) = self.command_receiver.try_recv() {
            match command {
                Command::Request { waiter, .. } => waiter.complete(Err(RequestError::Closed)),
                Command::Stop { done } => {
                    let _ = done.send(());
                }
            }
        }

        match exit {
            Exit::Stopped(done) => {
                debug!("Connection stopped");
                self.notify_session(|host_id| SessionEvent::ConnectionStopped { host_id });
                let _ = done.send(());
            }
            Exit::HandlesDropped => {
                debug!("All connection handles dropped, stopping");
                self.notify_session(|host_id| SessionEvent::ConnectionStopped { host_id });
            }
            Exit::GaveUp => {
                error!("Reconnection policy exhausted, giving up");
                self.notify_session(|host_id| SessionEvent::ConnectionStopped { host_id });
            }
        }
    }
}

fn decode_response(frame: &ResponseFrame) -> Result<Response, ParseError> {
    let mut body = &frame.body[..];
    Response::deserialize(frame.opcode, &mut body)
}

async fn resolve(config: &ConnectionConfig) -> Result<SocketAddr, ConnectionError> {
    match &config.endpoint {
        Endpoint::Address(ip) => Ok(SocketAddr::new(*ip, config.port)),
        Endpoint::Hostname(hostname) => {
            let mut addrs = lookup_host((hostname.as_str(), config.port)).await?;
            addrs.next().ok_or_else(|| {
                ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Hostname {} resolved to no addresses", hostname),
                ))
            })
        }
    }
}

/// Opens the socket and runs the blocking startup exchange on stream id 0,
/// plus the optional `USE <keyspace>`.
async fn open_and_handshake(config: &ConnectionConfig) -> Result<TcpStream, ConnectionError> {
    let addr = resolve(config).await?;
    let mut socket = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;
    socket.set_nodelay(true)?;

    startup(&mut socket, config.connect_timeout).await?;
    if let Some(keyspace) = &config.keyspace {
        use_keyspace(&mut socket, config.connect_timeout, keyspace).await?;
    }

    debug!(%addr, "Connection ready");
    Ok(socket)
}

async fn handshake_roundtrip(
    socket: &mut TcpStream,
    timeout: Duration,
    request: SerializedRequest,
) -> Result<Response, HandshakeTransportError> {
    socket.write_all(request.get_data()).await?;
    let frame = tokio::time::timeout(timeout, read_response(socket))
        .await
        .map_err(|_| HandshakeTransportError::Timeout)??;
    let response = decode_response(&frame).map_err(FrameError::Parse)?;
    Ok(response)
}

enum HandshakeTransportError {
    Timeout,
    Frame(FrameError),
}

impl From<std::io::Error> for HandshakeTransportError {
    fn from(err: std::io::Error) -> Self {
        HandshakeTransportError::Frame(FrameError::StdIoError(err))
    }
}

impl From<FrameError> for HandshakeTransportError {
    fn from(err: FrameError) -> Self {
        HandshakeTransportError::Frame(err)
    }
}

async fn startup(socket: &mut TcpStream, timeout: Duration) -> Result<(), ConnectionError> {
    let request = SerializedRequest::make(&Startup::default())
        .map_err(|e| HandshakeError::Frame(e.into()))?;
    // Stream id 0 is implicit: `make` leaves it zeroed.
    debug_assert_eq!(request.stream(), HANDSHAKE_STREAM_ID);

    let response = handshake_roundtrip(socket, timeout, request)
        .await
        .map_err(|err| match err {
            HandshakeTransportError::Timeout => HandshakeError::Timeout,
            HandshakeTransportError::Frame(frame) => HandshakeError::Frame(frame),
        })?;

    match response {
        Response::Ready => Ok(()),
        Response::Error(err) => Err(HandshakeError::Db {
            code: err.code,
            message: err.reason,
        }
        .into()),
        _ => Err(HandshakeError::UnexpectedResponse.into()),
    }
}

async fn use_keyspace(
    socket: &mut TcpStream,
    timeout: Duration,
    keyspace: &str,
) -> Result<(), ConnectionError> {
    let query = Query::new(format!("USE {}", keyspace));
    let request =
        SerializedRequest::make(&query).map_err(|e| KeyspaceError::Frame(e.into()))?;

    let response = handshake_roundtrip(socket, timeout, request)
        .await
        .map_err(|err| match err {
            HandshakeTransportError::Timeout => KeyspaceError::Timeout,
            HandshakeTransportError::Frame(frame) => KeyspaceError::Frame(frame),
        })?;

    match response {
        Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
            if set_keyspace.keyspace_name == keyspace {
                Ok(())
            } else {
                Err(KeyspaceError::Mismatch {
                    requested: keyspace.to_owned(),
                    actual: set_keyspace.keyspace_name,
                }
                .into())
            }
        }
        Response::Error(err) => Err(KeyspaceError::Db {
            code: err.code,
            message: err.reason,
        }
        .into()),
        _ => Err(KeyspaceError::UnexpectedResponse.into()),
    }
}
