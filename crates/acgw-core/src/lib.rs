//! acgw Core
//!
//! Shared primitives for the acgw device gateway:
//! - Backend frames ([`Apdu`], [`MessageError`])
//! - Per-call translation state ([`TrData`]) and MQTT envelopes
//! - Topic grammar ([`topic`])
//! - Payload encryption hook ([`Encrypt`])
//! - Request correlation ([`Correlators`])
//! - Bounded worker pools ([`WorkerPool`])

pub mod apdu;
pub mod correlator;
pub mod encrypt;
pub mod error;
pub mod pool;
pub mod topic;
pub mod types;

pub use apdu::{Apdu, MessageError, MESSAGE_ERROR, REPLY_FLAG};
pub use correlator::{Correlator, Correlators};
pub use encrypt::{Encrypt, SharedEncrypt};
pub use error::{Error, Result, TranslateError};
pub use pool::WorkerPool;
pub use topic::{TopicInfo, TopicKind, DEFAULT_BACKEND_ALIAS};
pub use types::*;

/// Default depth of per-session queues
pub const SESSION_QUEUE_DEPTH: usize = 5;

/// Default depth of the hub's outbound publish queue
pub const OUTBOUND_QUEUE_DEPTH: usize = 1000;

/// Default number of publish workers
pub const PUBLISH_WORKERS: usize = 10;
