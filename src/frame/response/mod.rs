pub mod error;
pub mod event;
pub mod result;

pub use error::Error;
pub use event::Event;

use crate::frame::frame_errors::{FrameError, ParseError};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Result = 0x08,
    Event = 0x0C,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            _ => Err(FrameError::UnknownResponseOpcode(value)),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Event(Event),
}

impl Response {
    pub fn deserialize(opcode: ResponseOpcode, buf: &mut &[u8]) -> Result<Response, ParseError> {
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Result => Response::Result(result::deserialize(buf)?),
            ResponseOpcode::Event => Response::Event(Event::deserialize(buf)?),
        };

        Ok(response)
    }
}
