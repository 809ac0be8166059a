//! Payload encryption hook
//!
//! Sessions with a key run every outbound frame through [`Encrypt::encode`]
//! and every inbound frame through [`Encrypt::decode`]. Concrete algorithms
//! (AES-CBC, DES, 3DES) live with the device protocol integrations.

use std::sync::Arc;

use crate::Result;

pub trait Encrypt: Send + Sync {
    fn encode(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    fn decode(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;
}

/// Shared cipher handle
pub type SharedEncrypt = Arc<dyn Encrypt>;
