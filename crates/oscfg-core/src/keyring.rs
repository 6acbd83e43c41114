//! GPG key fetching and canonicalization.
//!
//! Apt repository specs may reference a GPG key by URL. The key is fetched
//! over HTTP with a 1 MiB cap, accepted in armored or binary form, and
//! re-serialized to canonical binary packets before landing in the trust
//! store. Canonical bytes give a stable checksum, which gives a stable
//! trust-store path.

use async_trait::async_trait;
use base64::Engine;
use thiserror::Error;

/// Fetched keys larger than this are rejected.
pub const MAX_KEY_SIZE: u64 = 1024 * 1024;

const ARMOR_HEADER: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
const ARMOR_FOOTER: &str = "-----END PGP PUBLIC KEY BLOCK-----";

/// Errors fetching or decoding a key.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// The key exceeded [`MAX_KEY_SIZE`].
    #[error("key size of {size} too large")]
    TooLarge {
        /// Reported or measured size in bytes.
        size: u64,
    },

    /// The HTTP fetch failed.
    #[error("fetching key {url}: {source}")]
    Fetch {
        /// Key URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// Armored data did not decode.
    #[error("invalid armored key: {0}")]
    Armor(String),

    /// The bytes are neither an armored block nor binary OpenPGP packets.
    #[error("data does not look like an OpenPGP key")]
    NotAKey,
}

/// Key retrieval seam.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetch the raw bytes at `url`, honoring the size cap.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, KeyringError>;
}

/// HTTP [`KeyFetcher`].
#[derive(Debug, Clone, Default)]
pub struct HttpKeyFetcher {
    client: reqwest::Client,
}

impl HttpKeyFetcher {
    /// Fetcher with a default client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, KeyringError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| KeyringError::Fetch {
                url: url.to_string(),
                source,
            })?;

        if let Some(len) = response.content_length() {
            if len > MAX_KEY_SIZE {
                return Err(KeyringError::TooLarge { size: len });
            }
        }

        let body = response.bytes().await.map_err(|source| KeyringError::Fetch {
            url: url.to_string(),
            source,
        })?;
        // Content-Length is advisory; enforce the cap on the actual body.
        if body.len() as u64 > MAX_KEY_SIZE {
            return Err(KeyringError::TooLarge {
                size: body.len() as u64,
            });
        }
        Ok(body.to_vec())
    }
}

/// Whether the bytes carry an ASCII-armored public key block.
#[must_use]
pub fn is_armored(data: &[u8]) -> bool {
    String::from_utf8_lossy(data)
        .lines()
        .any(|l| l.trim() == ARMOR_HEADER)
}

/// Canonical binary serialization of a fetched key.
///
/// Armored input is decoded to its binary packet stream; binary input is
/// validated and passed through. Either way the result is the byte form the
/// trust-store file carries and the checksum is computed over.
///
/// # Errors
///
/// [`KeyringError::Armor`] for a malformed armored block,
/// [`KeyringError::NotAKey`] for bytes that are neither form.
pub fn canonicalize(data: &[u8]) -> Result<Vec<u8>, KeyringError> {
    if is_armored(data) {
        return decode_armor(data);
    }

    // Binary OpenPGP packets start with a tag byte whose high bit is set.
    if data.first().is_some_and(|b| b & 0x80 != 0) {
        return Ok(data.to_vec());
    }

    Err(KeyringError::NotAKey)
}

/// Decode the base64 payload between the armor header and footer.
///
/// Blank line and `Key: Value` headers after the BEGIN line are skipped;
/// the `=XXXX` CRC line before the END line is dropped.
fn decode_armor(data: &[u8]) -> Result<Vec<u8>, KeyringError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| KeyringError::Armor(format!("not utf-8: {e}")))?;

    let mut in_block = false;
    let mut past_headers = false;
    let mut payload = String::new();

    for line in text.lines() {
        let line = line.trim();
        if line == ARMOR_HEADER {
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        if line == ARMOR_FOOTER {
            break;
        }
        if !past_headers {
            if line.is_empty() {
                past_headers = true;
            } else if !line.contains(": ") {
                // No header section at all; this line is payload.
                past_headers = true;
                payload.push_str(line);
            }
            continue;
        }
        if line.starts_with('=') {
            // CRC24 line.
            continue;
        }
        payload.push_str(line);
    }

    if !in_block {
        return Err(KeyringError::Armor("missing armor header".to_string()));
    }
    if payload.is_empty() {
        return Err(KeyringError::Armor("empty armor payload".to_string()));
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| KeyringError::Armor(format!("base64: {e}")))?;

    if !decoded.first().is_some_and(|b| b & 0x80 != 0) {
        return Err(KeyringError::NotAKey);
    }
    Ok(decoded)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::{KeyFetcher, KeyringError};

    /// [`KeyFetcher`] serving canned bodies by URL.
    #[derive(Default)]
    pub struct FakeKeyFetcher {
        pub keys: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl KeyFetcher for FakeKeyFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, KeyringError> {
            self.keys.get(url).cloned().ok_or(KeyringError::NotAKey)
        }
    }
}
