//! Envelope codecs and the stream frame decoder.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Envelope, Notification, Reply, Request};
use bytes::{Bytes, BytesMut};

/// Translates envelopes to and from wire bytes.
///
/// The client uses `encode_request` and `decode_envelope`; servers (the fake
/// server in this workspace) use the other half.
pub trait Codec: Send + Sync + 'static {
    /// Name advertised during the transport handshake, e.g. the WebSocket subprotocol.
    fn name(&self) -> &'static str;

    fn encode_request(&self, request: &Request) -> Result<Bytes, ProtocolError>;

    fn decode_envelope(&self, data: &[u8]) -> Result<Envelope, ProtocolError>;

    fn decode_request(&self, data: &[u8]) -> Result<Request, ProtocolError>;

    fn encode_reply(&self, reply: &Reply) -> Result<Bytes, ProtocolError>;

    fn encode_notification(&self, notification: &Notification) -> Result<Bytes, ProtocolError>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(request)?))
    }

    fn decode_envelope(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    fn decode_request(&self, data: &[u8]) -> Result<Request, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode_reply(&self, reply: &Reply) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(reply)?))
    }

    /// Notifications are sent nested in `result`, without a top-level id.
    fn encode_notification(&self, notification: &Notification) -> Result<Bytes, ProtocolError> {
        let wrapped = serde_json::json!({ "result": notification.to_value() });
        Ok(Bytes::from(serde_json::to_vec(&wrapped)?))
    }
}

/// Accumulates bytes read from a stream and yields complete frame payloads.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Action, Method, ReplyError};
    use crate::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_json_request_roundtrip() {
        let codec = JsonCodec;
        let request = Request::new("aZ09", Method::Select).with_params(vec![json!("person:1")]);
        let bytes = codec.encode_request(&request).unwrap();
        assert_eq!(codec.decode_request(&bytes).unwrap(), request);
    }

    #[test]
    fn test_json_reply_decodes_as_envelope() {
        let codec = JsonCodec;
        let bytes = codec
            .encode_reply(&Reply::error(
                "r",
                ReplyError::new(ErrorCode::MethodNotFound, "no"),
            ))
            .unwrap();

        let envelope = codec.decode_envelope(&bytes).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("r"));
        assert_eq!(envelope.error.unwrap().code, ErrorCode::MethodNotFound);
    }

    #[test]
    fn test_json_notification_is_nested() {
        let codec = JsonCodec;
        let n = Notification::new("lq", Action::Create, json!({"id": "a:1"}));
        let bytes = codec.encode_notification(&n).unwrap();

        let envelope = codec.decode_envelope(&bytes).unwrap();
        assert!(envelope.id.is_none());
        assert!(envelope.is_notification());
        assert_eq!(envelope.into_notification().unwrap(), n);
    }

    #[test]
    fn test_decode_garbage() {
        let codec = JsonCodec;
        assert!(matches!(
            codec.decode_envelope(b"\xff\x00not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_partial_frame_decoding() {
        let encoded = Frame::new(Bytes::from_static(br#"{"id":"1"}"#))
            .encode()
            .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&encoded[..10]);
        assert!(decoder.decode_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), 10);

        decoder.extend(&encoded[10..]);
        let frame = decoder.decode_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), br#"{"id":"1"}"#);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_clear() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(b"some data");
        assert_eq!(decoder.buffered(), 9);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);
    }
}
