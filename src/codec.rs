//! Wire contract and reference codec (spec §6).
//!
//! The contract is abstract: framed, length-prefixed messages where each
//! frame carries a request id, a direction, flags, and an opaque payload.
//! [`LengthPrefixedJsonCodec`] is the one concrete implementation this crate
//! ships — the "one compatible protocol" spec.md §1 allows a reimplementation
//! to pick, not a stand-in for JSF/gRPC/Dubbo/etc, which remain out of scope.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::request::{Request, Response};

/// What a frame carries, per spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request = 0,
    Response = 1,
    Heartbeat = 2,
    HeartbeatAck = 3,
}

impl Direction {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Direction::Request),
            1 => Ok(Direction::Response),
            2 => Ok(Direction::Heartbeat),
            3 => Ok(Direction::HeartbeatAck),
            other => Err(RpcError::Serialization(format!("unknown frame direction {other}"))),
        }
    }
}

pub const FLAG_NONE: u8 = 0;

/// One length-prefixed wire frame. Request-id uniqueness scope is one
/// Channel (spec §6).
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub direction: Direction,
    pub flags: u8,
    pub payload: Bytes,
}

/// Codec plugin contract (spec §6): `encode`/`decode` named via the Plugin
/// Registry. `decode` is incremental — it returns `None` when `buf` does not
/// yet contain a full frame, leaving unread bytes in place for the next call.
pub trait Codec: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<()>;
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>>;
}

/// `[u32 total_len][u8 direction][u8 flags][u64 request_id][payload]`.
/// `total_len` counts everything after itself.
#[derive(Default)]
pub struct LengthPrefixedJsonCodec;

const HEADER_LEN: usize = 1 + 1 + 8;

impl Codec for LengthPrefixedJsonCodec {
    fn name(&self) -> &str {
        "length-prefixed-json"
    }

    fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<()> {
        let total_len = HEADER_LEN + frame.payload.len();
        buf.put_u32(total_len as u32);
        buf.put_u8(frame.direction as u8);
        buf.put_u8(frame.flags);
        buf.put_u64(frame.id);
        buf.put_slice(&frame.payload);
        Ok(())
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + total_len {
            return Ok(None);
        }

        let mut frame_buf = buf.split_to(4 + total_len);
        frame_buf.advance(4);

        let direction = Direction::from_u8(frame_buf.get_u8())?;
        let flags = frame_buf.get_u8();
        let id = frame_buf.get_u64();
        let payload = frame_buf.freeze();

        Ok(Some(Frame { id, direction, flags, payload }))
    }
}

/// Payload cap check (spec §4.1): one byte over fails locally, never touching
/// the network.
pub fn check_payload_cap(payload_len: usize, cap: usize) -> Result<()> {
    if payload_len > cap {
        Err(RpcError::OverPayload { size: payload_len, cap })
    } else {
        Ok(())
    }
}

pub fn encode_request(req: &Request) -> Result<Frame> {
    let payload = serde_json::to_vec(req).map_err(|e| RpcError::Serialization(e.to_string()))?;
    Ok(Frame { id: req.id, direction: Direction::Request, flags: FLAG_NONE, payload: Bytes::from(payload) })
}

pub fn decode_request(frame: &Frame) -> Result<Request> {
    serde_json::from_slice(&frame.payload).map_err(|e| RpcError::Serialization(e.to_string()))
}

pub fn encode_response(resp: &Response) -> Result<Frame> {
    let payload = serde_json::to_vec(resp).map_err(|e| RpcError::Serialization(e.to_string()))?;
    Ok(Frame { id: resp.id, direction: Direction::Response, flags: FLAG_NONE, payload: Bytes::from(payload) })
}

pub fn decode_response(frame: &Frame) -> Result<Response> {
    serde_json::from_slice(&frame.payload).map_err(|e| RpcError::Serialization(e.to_string()))
}

pub fn heartbeat_frame(id: u64, ack: bool) -> Frame {
    Frame {
        id,
        direction: if ack { Direction::HeartbeatAck } else { Direction::Heartbeat },
        flags: FLAG_NONE,
        payload: Bytes::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_request_frame() {
        let codec = LengthPrefixedJsonCodec;
        let req = Request::new("Echo", "echo", vec![serde_json::json!("abc")]);
        let frame = encode_request(&req).unwrap();

        let mut buf = BytesMut::new();
        codec.encode(&frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.direction, Direction::Request);

        let decoded_req = decode_request(&decoded).unwrap();
        assert_eq!(decoded_req.method, "echo");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let codec = LengthPrefixedJsonCodec;
        let frame = heartbeat_frame(5, false);
        let mut full = BytesMut::new();
        codec.encode(&frame, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn payload_cap_boundary() {
        assert!(check_payload_cap(100, 100).is_ok());
        assert!(check_payload_cap(101, 100).is_err());
    }

    #[test]
    fn decode_leaves_trailing_bytes_for_next_frame() {
        let codec = LengthPrefixedJsonCodec;
        let mut buf = BytesMut::new();
        codec.encode(&heartbeat_frame(1, false), &mut buf).unwrap();
        codec.encode(&heartbeat_frame(2, false), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, 1);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.id, 2);
        assert!(buf.is_empty());
    }
}
