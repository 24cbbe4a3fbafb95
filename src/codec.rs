//! Deterministic binary encode/decode of the small set of tagged frames the
//! session runtime speaks. The codec is total: any well-formed input
//! decodes to a generic [`rmpv::Value`]; frame *typing* (is this an `init`?
//! an `rpc`?) is left to [`parse_incoming`], which inspects the decoded
//! map's `type` field — frame typing lives in the session runtime, not the
//! codec.
//!
//! Wire encoding is MessagePack (`rmp-serde`/`rmpv`). Because the transport
//! underneath is message-oriented (one WebSocket binary message is one
//! frame) there is no length-delimited framing layer here, unlike a raw
//! byte-stream transport — but the optional-compression wire shape still
//! carries a single flags byte (`0x00` raw, `0x01` Zstd) ahead of the
//! payload.

use std::collections::HashMap;
use std::io::{Read, Write};

use rmpv::Value;
use thiserror::Error;

/// Payloads larger than this (in raw MessagePack bytes) get Zstd-compressed
/// before going on the wire; smaller ones aren't, since compression
/// overhead would outweigh the savings.
const COMPRESS_THRESHOLD: usize = 1024;
const COMPRESS_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed MessagePack frame: {0}")]
    Malformed(String),
    #[error("frame is not a map")]
    NotAMap,
    #[error("frame missing required field {0:?}")]
    MissingField(&'static str),
    #[error("frame field {0:?} has the wrong type")]
    WrongType(&'static str),
    #[error("unknown frame flags byte {0}")]
    UnknownFlags(u8),
    #[error("(de)compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Encode a [`Value`] to raw bytes ready to hand to [`crate::transport::Transport::send`].
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut raw = Vec::new();
    rmpv::encode::write_value(&mut raw, value).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let out = if raw.len() > COMPRESS_THRESHOLD {
        let mut out = vec![1u8];
        let mut encoder = zstd::Encoder::new(&mut out, COMPRESS_LEVEL)?;
        encoder.write_all(&raw)?;
        encoder.finish()?;
        out
    } else {
        let mut out = Vec::with_capacity(1 + raw.len());
        out.push(0u8);
        out.append(&mut raw);
        out
    };

    Ok(out)
}

/// Decode raw bytes off the wire into a generic dynamic value.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let (flags, payload) = bytes.split_first().ok_or_else(|| CodecError::Malformed("empty frame".into()))?;

    match flags {
        0 => {
            let mut cursor = payload;
            rmpv::decode::read_value(&mut cursor).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        1 => {
            let mut buf = Vec::new();
            zstd::Decoder::new(payload)?.read_to_end(&mut buf)?;
            let mut cursor = buf.as_slice();
            rmpv::decode::read_value(&mut cursor).map_err(|e| CodecError::Malformed(e.to_string()))
        }
        other => Err(CodecError::UnknownFlags(*other)),
    }
}

// ---------------------------------------------------------------------
// Frame shapes
// ---------------------------------------------------------------------

pub fn str_value(s: impl Into<String>) -> Value {
    Value::String(s.into().into())
}

fn map_of(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(pairs.into_iter().map(|(k, v)| (str_value(k), v)).collect())
}

fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_map()?.iter().find(|(k, _)| k.as_str() == Some(key)).map(|(_, v)| v)
}

fn map_get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    map_get(value, key)?.as_str()
}

/// A client's first frame must decode to this.
#[derive(Debug, Clone)]
pub struct InitFrame {
    pub auth: Value,
}

/// A client's RPC call.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: Value,
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum IncomingFrame {
    Init(InitFrame),
    Rpc(RpcRequest),
    /// Decodes fine but doesn't carry a `type` this runtime understands;
    /// the caller decides whether that's an error.
    Unrecognized(Value),
}

pub fn parse_incoming(value: Value) -> Result<IncomingFrame, CodecError> {
    if value.as_map().is_none() {
        return Err(CodecError::NotAMap);
    }

    match map_get_str(&value, "type") {
        Some("init") => {
            let auth = map_get(&value, "auth").cloned().unwrap_or(Value::Nil);
            Ok(IncomingFrame::Init(InitFrame { auth }))
        }
        Some("rpc") => {
            let id = map_get(&value, "id").cloned().ok_or(CodecError::MissingField("id"))?;
            let name = map_get_str(&value, "name")
                .ok_or(CodecError::MissingField("name"))?
                .to_string();
            let args = map_get(&value, "args")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let kwargs = map_get(&value, "kwargs")
                .and_then(|v| v.as_map())
                .map(|pairs| {
                    pairs
                        .iter()
                        .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                        .collect()
                })
                .unwrap_or_default();
            Ok(IncomingFrame::Rpc(RpcRequest { id, name, args, kwargs }))
        }
        _ => Ok(IncomingFrame::Unrecognized(value)),
    }
}

/// `{id, result:<any>}`
pub fn reply_ok(id: Value, result: Value) -> Value {
    map_of(vec![("id", id), ("result", result)])
}

/// `{id, error:<string>}`
pub fn reply_error_flat(id: Value, message: impl Into<String>) -> Value {
    map_of(vec![("id", id), ("error", str_value(message))])
}

/// `{id, error:{code, message, data}}`
pub fn reply_error_structured(id: Value, code: &'static str, message: impl Into<String>, data: Value) -> Value {
    let error = map_of(vec![
        ("code", str_value(code)),
        ("message", str_value(message)),
        ("data", data),
    ]);
    map_of(vec![("id", id), ("error", error)])
}

/// `{type:"event", name, payload:{args, kwargs}}`
pub fn event_frame(name: &str, args: Vec<Value>, kwargs: HashMap<String, Value>) -> Value {
    let payload = map_of(vec![
        ("args", Value::Array(args)),
        ("kwargs", kwargs_to_value(kwargs)),
    ]);
    map_of(vec![
        ("type", str_value("event")),
        ("name", str_value(name)),
        ("payload", payload),
    ])
}

/// `{target_users, type:"event", name, payload:{args, kwargs}}`, published
/// on the `ephaptic:broadcast` pub/sub channel.
pub fn broadcast_envelope(
    target_users: &[String],
    name: &str,
    args: Vec<Value>,
    kwargs: HashMap<String, Value>,
) -> Value {
    let payload = map_of(vec![
        ("args", Value::Array(args)),
        ("kwargs", kwargs_to_value(kwargs)),
    ]);
    map_of(vec![
        ("target_users", Value::Array(target_users.iter().cloned().map(str_value).collect())),
        ("type", str_value("event")),
        ("name", str_value(name)),
        ("payload", payload),
    ])
}

pub fn kwargs_to_value(kwargs: HashMap<String, Value>) -> Value {
    Value::Map(kwargs.into_iter().map(|(k, v)| (str_value(k), v)).collect())
}

/// Parse a received broadcast envelope (the shape [`broadcast_envelope`]
/// produces) back into its parts.
pub fn parse_broadcast_envelope(value: &Value) -> Option<(Vec<String>, String, Vec<Value>, HashMap<String, Value>)> {
    let target_users = map_get(value, "target_users")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    let name = map_get_str(value, "name")?.to_string();
    let payload = map_get(value, "payload")?;
    let args = map_get(payload, "args").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let kwargs = map_get(payload, "kwargs")
        .and_then(|v| v.as_map())
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                .collect()
        })
        .unwrap_or_default();
    Some((target_users, name, args, kwargs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_and_large_frames() {
        let small = reply_ok(Value::from(1), Value::from("hi"));
        let bytes = encode(&small).unwrap();
        assert_eq!(bytes[0], 0, "small frames stay uncompressed");
        assert_eq!(decode(&bytes).unwrap(), small);

        let big_string: String = "x".repeat(COMPRESS_THRESHOLD * 4);
        let big = reply_ok(Value::from(2), Value::from(big_string.as_str()));
        let bytes = encode(&big).unwrap();
        assert_eq!(bytes[0], 1, "large frames get compressed");
        assert_eq!(decode(&bytes).unwrap(), big);
    }

    #[test]
    fn parses_init_and_rpc_frames() {
        let init = map_of(vec![("type", str_value("init")), ("auth", str_value("user123"))]);
        match parse_incoming(init).unwrap() {
            IncomingFrame::Init(InitFrame { auth }) => assert_eq!(auth.as_str(), Some("user123")),
            other => panic!("expected init, got {other:?}"),
        }

        let rpc = map_of(vec![
            ("type", str_value("rpc")),
            ("id", Value::from(1)),
            ("name", str_value("echo")),
            ("kwargs", map_of(vec![("message", str_value("hi"))])),
        ]);
        match parse_incoming(rpc).unwrap() {
            IncomingFrame::Rpc(req) => {
                assert_eq!(req.name, "echo");
                assert_eq!(req.kwargs.get("message").and_then(|v| v.as_str()), Some("hi"));
            }
            other => panic!("expected rpc, got {other:?}"),
        }
    }

    #[test]
    fn broadcast_envelope_round_trips() {
        let mut kwargs = HashMap::new();
        kwargs.insert("message".to_string(), str_value("hi"));
        let env = broadcast_envelope(&["user123".to_string()], "MyEvent", vec![], kwargs.clone());
        let (targets, name, args, parsed_kwargs) = parse_broadcast_envelope(&env).unwrap();
        assert_eq!(targets, vec!["user123".to_string()]);
        assert_eq!(name, "MyEvent");
        assert!(args.is_empty());
        assert_eq!(parsed_kwargs.get("message").and_then(|v| v.as_str()), Some("hi"));
    }
}
