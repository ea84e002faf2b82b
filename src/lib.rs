//! Single-host connection core for the Cassandra native protocol.
//!
//! This crate owns exactly one TCP connection to one Cassandra node and
//! multiplexes requests over it: callers submit CQL frames, the connection
//! assigns stream ids, correlates responses back to their callers, streams
//! paged results row by row, forwards server-pushed events, and reconnects
//! with backoff when the socket breaks.
//!
//! It is deliberately not a full driver: no pooling, no load balancing, no
//! token-aware routing and no typed value mapping. A session layer is
//! expected to own those concerns and consume this crate per node.
//!
//! # Example
//! ```rust,no_run
//! use cql_mux::{Connection, ConnectionConfig, Query, QueryResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::connect(ConnectionConfig {
//!         keyspace: Some("ks".to_owned()),
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     match connection.send(Query::new("SELECT pk FROM tab")).await? {
//!         QueryResult::Rows(rows) => println!("{} rows", rows.rows_count),
//!         QueryResult::RowStream(mut rows) => {
//!             while let Some(row) = rows.next_row().await {
//!                 println!("{:?}", row?);
//!             }
//!         }
//!         other => println!("{:?}", other),
//!     }
//!
//!     connection.stop().await;
//!     Ok(())
//! }
//! ```

pub mod errors;
pub mod frame;
pub mod network;
pub mod policies;

pub use errors::{ConnectionError, HandshakeError, KeyspaceError, RequestError};
pub use frame::request::{PagingState, Prepare, Query, Request, Value};
pub use network::connection::{
    AsyncReplySink, Connection, QueryResult, RequestId, RequestResult, RowStream,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use network::{ConnectionConfig, Endpoint, SessionEvent};
pub use policies::{ExponentialReconnectionPolicy, ReconnectionPolicy};
