//! Device protocol translator contract
//!
//! A translator converts between one device wire protocol and backend
//! [`Apdu`] frames. The hub calls it from the session's pumps with a
//! [`TrContext`] that carries the session handle and a fresh [`TrData`] for
//! every frame. Translators steer the session through that context: they
//! can register or activate the session, set a cipher key, suppress the
//! result (`tr.ignore`), mark an uplink as telemetry or override its topic.

use acgw_core::{Apdu, TopicKind, TrData, TranslateError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::session::DeviceSession;

/// Per-frame translation context
pub struct TrContext {
    pub session: Arc<DeviceSession>,
    pub tr: TrData,
    /// Topic kind a backend frame arrived on; `None` for device frames
    pub kind: Option<TopicKind>,
}

impl TrContext {
    /// Context for a frame received from the device
    pub fn uplink(session: Arc<DeviceSession>) -> Self {
        Self {
            session,
            tr: TrData::default(),
            kind: None,
        }
    }

    /// Context for a backend frame headed to the device
    pub fn downlink(session: Arc<DeviceSession>, kind: TopicKind, apdu: &Apdu) -> Self {
        Self {
            session,
            tr: TrData::for_apdu(apdu),
            kind: Some(kind),
        }
    }
}

/// Converts between device frames and backend frames
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    /// Device frame to backend frame. `Ok(None)` means nothing to publish.
    async fn to_apdu(&self, ctx: &mut TrContext, frame: Bytes)
        -> Result<Option<Apdu>, TranslateError>;

    /// Backend frame to device frame. `Ok(None)` means nothing to send.
    async fn from_apdu(
        &self,
        ctx: &mut TrContext,
        apdu: &Apdu,
    ) -> Result<Option<Bytes>, TranslateError>;

    /// Device-protocol reply for a device frame that failed to translate
    fn error_reply(&self, _ctx: &TrContext, _error: &TranslateError) -> Option<Bytes> {
        None
    }
}

pub type SharedTranslator = Arc<dyn Translator>;

/// Carries device frames opaquely inside a fixed message id.
///
/// On connections without a device id (raw TCP) the first frame is taken as
/// the device id and published as the registration request. A backend reply
/// on the registration topic activates the session. Backend error frames are
/// never forwarded to the device.
#[derive(Debug, Clone)]
pub struct PassthroughTranslator {
    pub register_id: u32,
    pub message_id: u32,
}

impl Default for PassthroughTranslator {
    fn default() -> Self {
        Self {
            register_id: 0x0000_0001,
            message_id: 0x0000_0100,
        }
    }
}

#[async_trait]
impl Translator for PassthroughTranslator {
    async fn to_apdu(
        &self,
        ctx: &mut TrContext,
        frame: Bytes,
    ) -> Result<Option<Apdu>, TranslateError> {
        if ctx.session.device_id().is_none() {
            let id = std::str::from_utf8(&frame)
                .map(str::trim)
                .map_err(|e| TranslateError::Decode(e.to_string()))?;
            if id.is_empty() || id.contains('/') {
                return Err(TranslateError::Decode(format!("bad device id {:?}", id)));
            }
            ctx.session
                .register(id)
                .map_err(|e| TranslateError::Other(e.to_string()))?;
            ctx.tr.action_name = "login".to_string();
            return Ok(Some(Apdu::new(self.register_id, frame.to_vec())));
        }

        Ok(Some(Apdu::new(self.message_id, frame.to_vec())))
    }

    async fn from_apdu(
        &self,
        ctx: &mut TrContext,
        apdu: &Apdu,
    ) -> Result<Option<Bytes>, TranslateError> {
        if ctx.tr.is_error {
            if let Some(err) = apdu.as_error() {
                debug!(
                    "Backend rejected request 0x{:08x}: {} ({})",
                    err.request_id, err.description, err.code
                );
            }
            ctx.tr.ignore = true;
            return Ok(None);
        }

        if ctx.kind == Some(TopicKind::Register) && apdu.is_reply() {
            ctx.session
                .activate()
                .map_err(|e| TranslateError::Other(e.to_string()))?;
        }

        Ok(Some(Bytes::from(apdu.payload.clone())))
    }
}
