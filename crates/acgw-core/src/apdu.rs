//! Backend APDU frames
//!
//! The backend core speaks protobuf. The gateway only relies on two facts
//! about a frame: its opcode and whether that opcode marks a reply. The
//! payload is handed to the translator untouched.

use bytes::Bytes;
use prost::Message;

use crate::error::Result;

/// Bit 31 of `message_id` marks a reply
pub const REPLY_FLAG: u32 = 0x8000_0000;

/// Sentinel opcode of a [`MessageError`] frame
pub const MESSAGE_ERROR: u32 = 0x7FFF_FFFF;

/// Application protocol data unit exchanged with the backend
#[derive(Clone, PartialEq, Message)]
pub struct Apdu {
    #[prost(uint32, tag = "1")]
    pub message_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Error report carried inside an APDU with opcode [`MESSAGE_ERROR`]
#[derive(Clone, PartialEq, Message)]
pub struct MessageError {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub description: String,
    /// Opcode of the request that failed
    #[prost(uint32, tag = "3")]
    pub request_id: u32,
}

impl Apdu {
    pub fn new(message_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id,
            payload: payload.into(),
        }
    }

    /// Decode an APDU from an MQTT payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self::decode(data)?)
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.encode_to_vec())
    }

    /// Request frames expect a reply; replies never do.
    pub fn is_request(&self) -> bool {
        self.message_id & REPLY_FLAG == 0
    }

    pub fn is_reply(&self) -> bool {
        !self.is_request()
    }

    pub fn is_error(&self) -> bool {
        self.message_id == MESSAGE_ERROR
    }

    /// Opcode of the reply that answers this request
    pub fn reply_id(&self) -> u32 {
        self.message_id | REPLY_FLAG
    }

    /// Build a `MessageError` frame reporting a failure on this request
    pub fn error_reply(&self, code: i32, description: impl Into<String>) -> Apdu {
        let err = MessageError {
            code,
            description: description.into(),
            request_id: self.message_id,
        };
        Apdu::new(MESSAGE_ERROR, err.encode_to_vec())
    }

    /// Decode the embedded error when this is a `MessageError` frame
    pub fn as_error(&self) -> Option<MessageError> {
        if !self.is_error() {
            return None;
        }
        MessageError::decode(self.payload.as_slice()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_reply_bit() {
        let req = Apdu::new(0x0102, vec![1, 2, 3]);
        assert!(req.is_request());
        assert!(!req.is_reply());

        let reply = Apdu::new(req.reply_id(), vec![]);
        assert!(reply.is_reply());
        assert_eq!(reply.message_id, 0x8000_0102);
    }

    #[test]
    fn test_error_frame_is_request_shaped() {
        let req = Apdu::new(7, vec![]);
        let err = req.error_reply(2, "bad frame");

        assert!(err.is_error());
        assert!(err.is_request());

        let decoded = err.as_error().unwrap();
        assert_eq!(decoded.code, 2);
        assert_eq!(decoded.description, "bad frame");
        assert_eq!(decoded.request_id, 7);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Apdu::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_as_error_on_plain_frame() {
        assert!(Apdu::new(1, b"x".to_vec()).as_error().is_none());
    }
}
