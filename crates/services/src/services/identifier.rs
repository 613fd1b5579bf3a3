//! Compact identifiers: 128 random bits rendered as 22 URL-safe base64 characters.

use std::{fmt, sync::Arc};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const ID_LENGTH: usize = 22;

/// Byte layout used before encoding.
///
/// `LegacySwapped` reverses the first three UUID groups (4, 2 and 2 bytes), the
/// layout written by older little-endian generators. Only use it to stay
/// compatible with identifiers that already exist in that form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ByteOrder {
    #[default]
    Standard,
    LegacySwapped,
}

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("identifier '{0}' is not URL-safe base64")]
    Encoding(String),
    #[error("identifier '{id}' decodes to {len} bytes, expected 16")]
    Length { id: String, len: usize },
}

type RandomSource = Arc<dyn Fn() -> Uuid + Send + Sync>;

#[derive(Clone)]
pub struct IdGenerator {
    byte_order: ByteOrder,
    source: RandomSource,
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdGenerator")
            .field("byte_order", &self.byte_order)
            .finish_non_exhaustive()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(ByteOrder::Standard)
    }
}

impl IdGenerator {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            source: Arc::new(Uuid::new_v4),
        }
    }

    /// Generator drawing its 128 bits from `source` instead of the OS RNG.
    pub fn with_source<F>(byte_order: ByteOrder, source: F) -> Self
    where
        F: Fn() -> Uuid + Send + Sync + 'static,
    {
        Self {
            byte_order,
            source: Arc::new(source),
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn new_id(&self) -> String {
        encode_uuid((self.source)(), self.byte_order)
    }
}

pub fn encode_uuid(uuid: Uuid, byte_order: ByteOrder) -> String {
    let bytes = match byte_order {
        ByteOrder::Standard => *uuid.as_bytes(),
        ByteOrder::LegacySwapped => uuid.to_bytes_le(),
    };
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Inverse of [`encode_uuid`]; yields the canonical hyphenated form via `Uuid`.
pub fn decode_id(id: &str, byte_order: ByteOrder) -> Result<Uuid, IdentifierError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(id)
        .map_err(|_| IdentifierError::Encoding(id.to_string()))?;
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| IdentifierError::Length {
            id: id.to_string(),
            len: bytes.len(),
        })?;
    Ok(match byte_order {
        ByteOrder::Standard => Uuid::from_bytes(bytes),
        ByteOrder::LegacySwapped => Uuid::from_bytes_le(bytes),
    })
}
