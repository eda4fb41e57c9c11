//! Bar array (de)serialization for snapshot payloads.
//!
//! Payloads are compact JSON arrays of `{time, open, high, low, close}`.
//! With compression on, the JSON is zlib-deflated and base64-encoded so the
//! field stays a plain string in the store.

use super::PersistError;
use crate::domain::Bar;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const ZLIB_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarCodec {
    pub compress: bool,
}

impl BarCodec {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    pub fn serialize(&self, bars: &[Bar]) -> Result<String, PersistError> {
        let json = serde_json::to_string(bars).map_err(|e| PersistError::Encode(e.to_string()))?;
        if !self.compress {
            return Ok(json);
        }
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::new(ZLIB_LEVEL));
        enc.write_all(json.as_bytes())
            .map_err(|e| PersistError::Encode(format!("zlib: {e}")))?;
        let packed = enc
            .finish()
            .map_err(|e| PersistError::Encode(format!("zlib: {e}")))?;
        Ok(STANDARD.encode(packed))
    }

    /// Decode a payload written by either codec setting.
    ///
    /// A payload starting with `[` is plain JSON; anything else is treated
    /// as base64 zlib. Absent or blank input is an empty list.
    pub fn deserialize(&self, payload: Option<&str>) -> Result<Vec<Bar>, PersistError> {
        let Some(text) = payload.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(Vec::new());
        };
        if text.starts_with('[') {
            return parse_json(text);
        }
        let packed = STANDARD
            .decode(text)
            .map_err(|e| PersistError::Decode(format!("base64: {e}")))?;
        let mut json = String::new();
        ZlibDecoder::new(packed.as_slice())
            .read_to_string(&mut json)
            .map_err(|e| PersistError::Decode(format!("zlib: {e}")))?;
        parse_json(&json)
    }
}

fn parse_json(text: &str) -> Result<Vec<Bar>, PersistError> {
    serde_json::from_str(text).map_err(|e| PersistError::Decode(format!("json: {e}")))
}
