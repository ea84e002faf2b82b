pub mod connection;

pub use connection::{
    AsyncReplySink, Connection, QueryResult, RequestId, RequestResult, RowStream,
    DEFAULT_REQUEST_TIMEOUT,
};

use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::frame::response::event::Event;
use crate::frame::response::result::Prepared;
use crate::policies::{ExponentialReconnectionPolicy, ReconnectionPolicy};

pub const DEFAULT_PORT: u16 = 9042;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the node lives: an already-resolved address, or a hostname to
/// resolve at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Address(IpAddr),
    Hostname(String),
}

/// Lifecycle notifications delivered to the optional session sink.
///
/// Each notification carries the `host_id` the connection was configured
/// with; none are emitted when either the sink or the `host_id` is absent.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionOpened {
        host_id: Uuid,
    },
    ConnectionClosed {
        host_id: Uuid,
    },
    ConnectionStopped {
        host_id: Uuid,
    },
    /// A request got a PREPARED response; `hash` is the MD5 digest of the
    /// encoded request, usable as a cache key by the session.
    Prepared {
        host_id: Uuid,
        hash: [u8; 16],
        prepared: Prepared,
    },
}

/// Configuration of a single connection, immutable after construction.
pub struct ConnectionConfig {
    pub endpoint: Endpoint,
    pub port: u16,
    /// Identity of the node, attached to session notifications.
    pub host_id: Option<Uuid>,
    pub connect_timeout: Duration,
    /// Default wait applied by [`Connection::send`]; `None` falls back to
    /// [`DEFAULT_REQUEST_TIMEOUT`](connection::DEFAULT_REQUEST_TIMEOUT).
    pub request_timeout: Option<Duration>,
    /// How long a socket write may stall before the connection is declared
    /// broken. `None` waits forever.
    pub send_timeout: Option<Duration>,
    /// Keyspace to bind with `USE` right after the handshake.
    pub keyspace: Option<String>,
    pub session_sink: Option<mpsc::UnboundedSender<SessionEvent>>,
    /// Sink for server-pushed events. Events are logged and dropped when
    /// absent.
    pub event_sink: Option<mpsc::UnboundedSender<Event>>,
    /// When true (the default), `Connection::connect` returns at once and the
    /// first connect attempt happens in the background, retried per the
    /// reconnection policy. When false, the first connect and handshake run
    /// inline and their failure is returned to the caller.
    pub async_init: bool,
    pub reconnection_policy: Box<dyn ReconnectionPolicy>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Address(IpAddr::from([127, 0, 0, 1])),
            port: DEFAULT_PORT,
            host_id: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
            keyspace: None,
            session_sink: None,
            event_sink: None,
            async_init: true,
            reconnection_policy: Box::new(ExponentialReconnectionPolicy::new()),
        }
    }
}
