//! Converts a session's value map and deadline to/from an opaque byte
//! string suitable for store persistence.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::value::Value;

/// Errors raised while encoding or decoding a session payload.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The payload was malformed and could not be decoded.
    #[error("corrupt session payload: {0}")]
    Corrupt(String),
}

/// The on-the-wire shape of a session, independent of the codec used to
/// serialize it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    pub values: HashMap<String, Value>,
}

/// Encodes and decodes a [`Payload`] to/from bytes for store persistence.
///
/// Implementations must preserve the exact set of scalar types
/// [`Value`] recognizes through a single round trip, and must fail with
/// [`Error::Corrupt`] rather than panicking on malformed input.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, Error>;
    fn decode(&self, bytes: &[u8]) -> Result<Payload, Error>;
}

/// The default codec: a direct `serde_json` encoding of [`Payload`].
///
/// Determinism is only guaranteed up to map ordering; callers comparing
/// encoded bytes across encodings should instead compare decoded content.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(payload).map_err(|e| Error::Corrupt(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corrupt(e.to_string()))
    }
}
