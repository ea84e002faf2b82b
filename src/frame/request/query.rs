use bytes::{BufMut, Bytes};

use crate::frame::{
    frame_errors::ParseError,
    request::{RequestOpcode, SerializableRequest},
    types,
};

const FLAG_VALUES: u8 = 0x01;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;

/// A bound value in a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Val(Vec<u8>),
    Null,
    NotSet,
}

/// Opaque continuation token handed back by the server along with a partial
/// Rows result. Resubmitting the query with the token fetches the next page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagingState(Option<Bytes>);

impl PagingState {
    /// State corresponding to the first page of a query.
    pub fn start() -> Self {
        Self(None)
    }

    pub fn new_from_raw_bytes(raw: &[u8]) -> Self {
        Self(Some(Bytes::copy_from_slice(raw)))
    }

    pub fn as_bytes_slice(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    pub contents: String,
    pub parameters: QueryParameters,
}

impl Query {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            parameters: QueryParameters::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.parameters.page_size = Some(page_size);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueryParameters {
    pub consistency: i16,
    pub page_size: Option<i32>,
    pub paging_state: PagingState,
    pub values: Vec<Value>,
}

impl Default for QueryParameters {
    fn default() -> Self {
        Self {
            consistency: 0x0001, // ONE
            page_size: None,
            paging_state: PagingState::start(),
            values: Vec::new(),
        }
    }
}

impl SerializableRequest for Query {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl QueryParameters {
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_short(self.consistency, buf);

        let paging_state_bytes = self.paging_state.as_bytes_slice();

        let mut flags = 0u8;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        if paging_state_bytes.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            if self.values.len() > i16::MAX as usize {
                return Err(ParseError::BadDataToSerialize(format!(
                    "Too many values for 16-bits: {}",
                    self.values.len()
                )));
            }
            buf.put_i16(self.values.len() as i16);

            for value in &self.values {
                match value {
                    Value::Val(v) => {
                        types::write_int(v.len() as i32, buf);
                        buf.put_slice(&v[..]);
                    }
                    Value::Null => types::write_int(-1, buf),
                    Value::NotSet => types::write_int(-2, buf),
                }
            }
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state_bytes) = paging_state_bytes {
            types::write_bytes(paging_state_bytes, buf)?;
        }

        Ok(())
    }
}
