//! Codec chain: optional compression composed with optional
//! authenticated encryption.
//!
//! Send path: stringify → compress when enabled and the text meets the
//! threshold → encrypt when enabled → text frame. Each applied stage
//! wraps the previous one in a small JSON envelope so the receive path
//! can mirror it in reverse:
//!
//! ```text
//! {"__encrypted":true,"data":"<base64(iv||ct)>"}
//!   └─ decrypts to either the plain text or
//!      {"__compressed":true,"algorithm":"gzip","data":"<base64>"}
//! ```
//!
//! Inbound text that is not valid JSON is handed back as a JSON string
//! value rather than an error; peers are allowed to send raw text.

mod compress;
mod crypto;

pub use compress::{algorithm_name, compress, decompress, is_gzip};
pub use crypto::{Encryptor, IV_LEN, KEY_LEN};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use crate::config::{CompressionConfig, EncryptionConfig};
use crate::error::{Result, WireError};

const ENV_COMPRESSED: &str = "__compressed";
const ENV_ENCRYPTED: &str = "__encrypted";

/// Composed compression + encryption codec.
pub struct CodecChain {
    compression: CompressionConfig,
    encryptor: Option<Encryptor>,
}

impl CodecChain {
    /// Build the chain, validating key material up front.
    pub fn new(compression: CompressionConfig, encryption: EncryptionConfig) -> Result<Self> {
        let encryptor = if encryption.enabled {
            Some(Encryptor::new(&encryption)?)
        } else {
            None
        };
        Ok(Self {
            compression,
            encryptor,
        })
    }

    /// Identity codec: no compression, no encryption.
    pub fn plain() -> Self {
        Self {
            compression: CompressionConfig::default(),
            encryptor: None,
        }
    }

    /// Whether either stage is active.
    pub fn is_active(&self) -> bool {
        self.compression.enabled || self.encryptor.is_some()
    }

    /// Encode a payload into the outbound text frame.
    pub fn encode(&self, payload: &Value) -> Result<String> {
        let text = serde_json::to_string(payload)?;

        let body = if self.compression.enabled && text.len() >= self.compression.threshold {
            let packed = compress::compress(text.as_bytes(), self.compression.algorithm)?;
            json!({
                ENV_COMPRESSED: true,
                "algorithm": compress::algorithm_name(self.compression.algorithm),
                "data": BASE64.encode(packed),
            })
            .to_string()
        } else {
            text
        };

        match &self.encryptor {
            Some(enc) => Ok(json!({
                ENV_ENCRYPTED: true,
                "data": enc.encrypt(body.as_bytes())?,
            })
            .to_string()),
            None => Ok(body),
        }
    }

    /// Decode an inbound text frame, unwrapping envelopes in reverse.
    pub fn decode(&self, text: &str) -> Result<Value> {
        let body = match parse_envelope(text) {
            Some(Envelope::Encrypted(data)) => {
                let enc = self.encryptor.as_ref().ok_or_else(|| {
                    WireError::Encryption("received encrypted frame but encryption is off".into())
                })?;
                let plain = enc.decrypt(&data)?;
                String::from_utf8(plain)
                    .map_err(|_| WireError::Encryption("decrypted payload is not UTF-8".into()))?
            }
            _ => text.to_string(),
        };

        if let Some(Envelope::Compressed { algorithm, data }) = parse_envelope(&body) {
            let packed = BASE64
                .decode(data)
                .map_err(|e| WireError::Compression(format!("envelope data is not base64: {e}")))?;
            let alg = compress::algorithm_from_name(&algorithm)?;
            let plain = compress::decompress(&packed, alg)?;
            let text = String::from_utf8(plain)
                .map_err(|_| WireError::Compression("decompressed payload is not UTF-8".into()))?;
            return Ok(parse_lenient(&text));
        }

        Ok(parse_lenient(&body))
    }
}

enum Envelope {
    Encrypted(String),
    Compressed { algorithm: String, data: String },
}

fn parse_envelope(text: &str) -> Option<Envelope> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get(ENV_ENCRYPTED).and_then(Value::as_bool) == Some(true) {
        let data = value.get("data")?.as_str()?.to_string();
        return Some(Envelope::Encrypted(data));
    }
    if value.get(ENV_COMPRESSED).and_then(Value::as_bool) == Some(true) {
        let algorithm = value.get("algorithm")?.as_str()?.to_string();
        let data = value.get("data")?.as_str()?.to_string();
        return Some(Envelope::Compressed { algorithm, data });
    }
    None
}

/// Best-effort JSON parse; unparseable text becomes a string value.
fn parse_lenient(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
