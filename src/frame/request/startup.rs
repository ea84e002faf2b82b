use bytes::BufMut;

use std::collections::HashMap;

use crate::frame::{
    frame_errors::ParseError,
    request::{RequestOpcode, SerializableRequest},
    types,
};

pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "3.0.0";

pub struct Startup {
    pub options: HashMap<String, String>,
}

impl Default for Startup {
    fn default() -> Self {
        let mut options = HashMap::new();
        options.insert(
            CQL_VERSION.to_owned(),
            DEFAULT_CQL_PROTOCOL_VERSION.to_owned(),
        );
        Self { options }
    }
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}
