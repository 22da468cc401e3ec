//! Length-prefixed framing and the connector wire protocol.
//!
//! A connector transport exchanges `EngineMessage`s (sent by this engine)
//! and `RemoteMessage`s (sent by the external authoritative system) as
//! 4-byte big-endian length-prefixed JSON frames, each preceded once per
//! connection by the protocol magic number.

use facet::Facet;
use std::fmt;
use tessera_core::{ConnectorId, PullChangesRequest, PullChangesResponse, WireChange};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
pub const PROTOCOL_MAGIC: u32 = 0x54455353; // "TESS"

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCodecError {
    PayloadTooLarge { len: usize, max: usize },
    FrameTooShort { len: usize },
    FrameTooLarge { len: usize, max: usize },
    FrameTruncated { expected: usize, actual: usize },
}

impl fmt::Display for FrameCodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => write!(f, "payload too large: {len} > {max}"),
            Self::FrameTooShort { len } => write!(f, "frame too short: {len}"),
            Self::FrameTooLarge { len, max } => write!(f, "frame too large: {len} > {max}"),
            Self::FrameTruncated { expected, actual } => {
                write!(
                    f,
                    "truncated frame payload: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for FrameCodecError {}

#[derive(Debug)]
pub enum WireError {
    Frame(FrameCodecError),
    Json(String),
    MagicMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
            Self::MagicMismatch { expected, actual } => write!(
                f,
                "protocol magic mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
        }
    }
}

impl std::error::Error for WireError {}

impl From<FrameCodecError> for WireError {
    fn from(value: FrameCodecError) -> Self {
        Self::Frame(value)
    }
}

pub fn encode_frame(payload: &[u8], max_payload_bytes: usize) -> Result<Vec<u8>, FrameCodecError> {
    if payload.len() > max_payload_bytes {
        return Err(FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: max_payload_bytes,
        });
    }

    let payload_len =
        u32::try_from(payload.len()).map_err(|_| FrameCodecError::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn encode_frame_default(payload: &[u8]) -> Result<Vec<u8>, FrameCodecError> {
    encode_frame(payload, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_frame(frame: &[u8], max_payload_bytes: usize) -> Result<&[u8], FrameCodecError> {
    if frame.len() < 4 {
        return Err(FrameCodecError::FrameTooShort { len: frame.len() });
    }

    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&frame[..4]);
    let payload_len = u32::from_be_bytes(prefix) as usize;
    if payload_len > max_payload_bytes {
        return Err(FrameCodecError::FrameTooLarge {
            len: payload_len,
            max: max_payload_bytes,
        });
    }

    let actual_payload_len = frame.len() - 4;
    if actual_payload_len != payload_len {
        return Err(FrameCodecError::FrameTruncated {
            expected: payload_len,
            actual: actual_payload_len,
        });
    }

    Ok(&frame[4..])
}

pub fn decode_frame_default(frame: &[u8]) -> Result<&[u8], FrameCodecError> {
    decode_frame(frame, DEFAULT_MAX_FRAME_BYTES)
}

pub fn encode_protocol_magic() -> [u8; 4] {
    PROTOCOL_MAGIC.to_be_bytes()
}

pub fn decode_protocol_magic(bytes: [u8; 4]) -> Result<(), WireError> {
    let actual = u32::from_be_bytes(bytes);
    if actual != PROTOCOL_MAGIC {
        return Err(WireError::MagicMismatch {
            expected: PROTOCOL_MAGIC,
            actual,
        });
    }
    Ok(())
}

/// Sent once, immediately after the protocol magic, when a connector
/// transport is established.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct Handshake {
    pub connector_id: ConnectorId,
    pub protocol_version: u32,
}

pub const PROTOCOL_VERSION: u32 = 1;

/// A batch of changes the remote side is asking the engine to apply
/// locally (an inbound push, e.g. the OPC UA server notifying of a
/// server-side write).
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct WriteBatch {
    pub changes: Vec<WireChange>,
}

/// The result of applying (or attempting to apply) an inbound `WriteBatch`.
#[derive(Facet, Clone, Debug, PartialEq)]
pub struct WriteResult {
    pub failed_changes: Vec<WireChange>,
    pub error: Option<String>,
}

impl WriteResult {
    pub fn success() -> Self {
        Self {
            failed_changes: Vec::new(),
            error: None,
        }
    }

    pub fn is_full_success(&self) -> bool {
        self.failed_changes.is_empty() && self.error.is_none()
    }
}

#[derive(Facet, Clone, Debug, PartialEq)]
pub struct ConnectorErrorReport {
    pub connector_id: ConnectorId,
    pub stage: String,
    pub error: String,
}

/// Sent by this engine over the connector's transport.
#[derive(Facet, Clone, Debug, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum EngineMessage {
    Handshake(Handshake),
    DeltaBatch(PullChangesResponse),
    WriteResult(WriteResult),
    Error(ConnectorErrorReport),
}

/// Sent by the external authoritative system over the connector's transport.
#[derive(Facet, Clone, Debug, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum RemoteMessage {
    PullRequest(PullChangesRequest),
    WriteBatch(WriteBatch),
}

pub fn encode_engine_message(
    message: &EngineMessage,
    max_payload_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    let payload = facet_json::to_vec(message).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

pub fn encode_engine_message_default(message: &EngineMessage) -> Result<Vec<u8>, WireError> {
    encode_engine_message(message, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_engine_message(
    frame: &[u8],
    max_payload_bytes: usize,
) -> Result<EngineMessage, WireError> {
    let payload = decode_frame(frame, max_payload_bytes)?;
    facet_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

pub fn decode_engine_message_default(frame: &[u8]) -> Result<EngineMessage, WireError> {
    decode_engine_message(frame, DEFAULT_MAX_FRAME_BYTES)
}

pub fn encode_remote_message(
    message: &RemoteMessage,
    max_payload_bytes: usize,
) -> Result<Vec<u8>, WireError> {
    let payload = facet_json::to_vec(message).map_err(|e| WireError::Json(e.to_string()))?;
    Ok(encode_frame(&payload, max_payload_bytes)?)
}

pub fn encode_remote_message_default(message: &RemoteMessage) -> Result<Vec<u8>, WireError> {
    encode_remote_message(message, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_remote_message(
    frame: &[u8],
    max_payload_bytes: usize,
) -> Result<RemoteMessage, WireError> {
    let payload = decode_frame(frame, max_payload_bytes)?;
    facet_json::from_slice(payload).map_err(|e| WireError::Json(e.to_string()))
}

pub fn decode_remote_message_default(frame: &[u8]) -> Result<RemoteMessage, WireError> {
    decode_remote_message(frame, DEFAULT_MAX_FRAME_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{SeqNo, StreamId};

    fn engine_payload_json(message: &EngineMessage) -> String {
        let frame = encode_engine_message_default(message).expect("engine frame should encode");
        let payload = decode_frame_default(&frame).expect("frame should decode");
        std::str::from_utf8(payload)
            .expect("payload should be utf8 json")
            .to_string()
    }

    fn remote_payload_json(message: &RemoteMessage) -> String {
        let frame = encode_remote_message_default(message).expect("remote frame should encode");
        let payload = decode_frame_default(&frame).expect("frame should decode");
        std::str::from_utf8(payload)
            .expect("payload should be utf8 json")
            .to_string()
    }

    #[test]
    fn protocol_magic_roundtrip() {
        let bytes = encode_protocol_magic();
        decode_protocol_magic(bytes).expect("protocol magic should decode");
    }

    #[test]
    fn protocol_magic_rejects_foreign_bytes() {
        let err = decode_protocol_magic([0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, WireError::MagicMismatch { .. }));
    }

    #[test]
    fn frame_roundtrip_rejects_truncation() {
        let frame = encode_frame_default(b"hello").unwrap();
        let truncated = &frame[..frame.len() - 1];
        let err = decode_frame_default(truncated).unwrap_err();
        assert!(matches!(err, FrameCodecError::FrameTruncated { .. }));
    }

    #[test]
    fn engine_delta_batch_wire_shape() {
        let json = engine_payload_json(&EngineMessage::DeltaBatch(PullChangesResponse {
            stream_id: StreamId::new("opcua-primary"),
            from_seq_no: SeqNo::ZERO,
            next_seq_no: SeqNo::ZERO,
            changes: vec![],
            truncated: false,
        }));
        assert_eq!(
            json,
            r#"{"delta_batch":{"stream_id":"opcua-primary","from_seq_no":0,"next_seq_no":0,"changes":[],"truncated":false}}"#
        );
    }

    #[test]
    fn remote_pull_request_wire_shape() {
        let json = remote_payload_json(&RemoteMessage::PullRequest(PullChangesRequest {
            stream_id: StreamId::new("opcua-primary"),
            from_seq_no: SeqNo::ZERO,
            max_changes: 512,
        }));
        assert_eq!(
            json,
            r#"{"pull_request":{"stream_id":"opcua-primary","from_seq_no":0,"max_changes":512}}"#
        );
    }

    #[test]
    fn write_result_success_has_no_failures() {
        assert!(WriteResult::success().is_full_success());
    }
}
