//! CQL requests sent by the client.

pub mod prepare;
pub mod query;
pub mod startup;

pub use prepare::Prepare;
pub use query::{PagingState, Query, QueryParameters, Value};
pub use startup::Startup;

use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::ParseError;
use crate::frame::SerializedRequest;

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Query = 0x07,
    Prepare = 0x09,
}

pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError>;
}

/// A request as submitted by a caller.
///
/// Structured variants are encoded by the connection; `Raw` carries a frame
/// the caller encoded themselves, whose stream id gets patched in before the
/// frame hits the socket.
#[derive(Debug, Clone)]
pub enum Request {
    Query(Query),
    Prepare(Prepare),
    Raw(Bytes),
}

impl Request {
    pub(crate) fn to_serialized(&self) -> Result<SerializedRequest, ParseError> {
        match self {
            Request::Query(query) => SerializedRequest::make(query),
            Request::Prepare(prepare) => SerializedRequest::make(prepare),
            Request::Raw(frame) => SerializedRequest::from_bytes(frame.clone()),
        }
    }
}

impl From<Query> for Request {
    fn from(query: Query) -> Self {
        Request::Query(query)
    }
}

impl From<Prepare> for Request {
    fn from(prepare: Prepare) -> Self {
        Request::Prepare(prepare)
    }
}
