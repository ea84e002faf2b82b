use bytes::BufMut;

use crate::frame::{
    frame_errors::ParseError,
    request::{RequestOpcode, SerializableRequest},
    types,
};

#[derive(Debug, Clone)]
pub struct Prepare {
    pub query: String,
}

impl SerializableRequest for Prepare {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_long_string(&self.query, buf)?;
        Ok(())
    }
}
