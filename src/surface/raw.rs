//! Lossless container for captured markup.
//!
//! Pages can contain lone UTF-16 surrogates, which no `String` can hold. The
//! surface hands markup over as a sequence of code points and this type keeps
//! it as generalized UTF-8: ordinary UTF-8, except that surrogate code points
//! get their three-byte encoding instead of being rejected. Hashing and
//! storage operate on those bytes, so two captures differing only in a broken
//! surrogate never collapse into one.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use super::SurfaceError;

/// Prefix of every content digest.
pub const DIGEST_PREFIX: &str = "SHA256:";

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawMarkup {
    bytes: Vec<u8>,
}

impl RawMarkup {
    /// Build from code points as reported by the rendering surface.
    ///
    /// A high surrogate directly followed by a low surrogate is joined into
    /// the supplementary code point it encodes.
    pub fn from_code_points(points: &[u32]) -> Result<Self, SurfaceError> {
        let mut bytes = Vec::with_capacity(points.len());
        let mut i = 0;
        while i < points.len() {
            let cp = points[i];
            if cp > 0x10FFFF {
                return Err(SurfaceError::InvalidCodePoint(cp));
            }
            if (0xD800..0xDC00).contains(&cp) {
                if let Some(&low) = points.get(i + 1) {
                    if (0xDC00..0xE000).contains(&low) {
                        let joined = 0x10000 + ((cp - 0xD800) << 10) + (low - 0xDC00);
                        push_code_point(&mut bytes, joined);
                        i += 2;
                        continue;
                    }
                }
            }
            push_code_point(&mut bytes, cp);
            i += 1;
        }
        Ok(Self { bytes })
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
        }
    }

    /// Wrap bytes previously obtained from [`RawMarkup::as_bytes`].
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode to a `String`, replacing each lone surrogate (and any other
    /// invalid sequence) with U+FFFD.
    pub fn to_text_lossy(&self) -> String {
        let mut out = String::with_capacity(self.bytes.len());
        let mut rest = self.bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    // The prefix was just validated.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    out.push(char::REPLACEMENT_CHARACTER);
                    let skip = if is_encoded_surrogate(tail) {
                        3
                    } else {
                        err.error_len().unwrap_or(tail.len())
                    };
                    rest = &tail[skip..];
                }
            }
        }
        out
    }

    /// Content-addressed digest, e.g. `SHA256:9f86d0...`.
    pub fn digest(&self) -> String {
        digest_bytes(&self.bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        Ok(Self {
            bytes: STANDARD.decode(encoded)?,
        })
    }

    /// Byte-level substring search.
    pub fn contains(&self, needle: &str) -> bool {
        let needle = needle.as_bytes();
        if needle.is_empty() {
            return true;
        }
        self.bytes.windows(needle.len()).any(|w| w == needle)
    }
}

impl fmt::Debug for RawMarkup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_text_lossy();
        let preview: String = text.chars().take(60).collect();
        f.debug_struct("RawMarkup")
            .field("len", &self.bytes.len())
            .field("preview", &preview)
            .finish()
    }
}

/// Digest of arbitrary bytes in the same format as [`RawMarkup::digest`].
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize()))
}

fn push_code_point(buf: &mut Vec<u8>, cp: u32) {
    match cp {
        0..=0x7F => buf.push(cp as u8),
        0x80..=0x7FF => {
            buf.push(0xC0 | (cp >> 6) as u8);
            buf.push(0x80 | (cp & 0x3F) as u8);
        }
        0x800..=0xFFFF => {
            buf.push(0xE0 | (cp >> 12) as u8);
            buf.push(0x80 | ((cp >> 6) & 0x3F) as u8);
            buf.push(0x80 | (cp & 0x3F) as u8);
        }
        _ => {
            buf.push(0xF0 | (cp >> 18) as u8);
            buf.push(0x80 | ((cp >> 12) & 0x3F) as u8);
            buf.push(0x80 | ((cp >> 6) & 0x3F) as u8);
            buf.push(0x80 | (cp & 0x3F) as u8);
        }
    }
}

fn is_encoded_surrogate(bytes: &[u8]) -> bool {
    matches!(bytes, [0xED, 0xA0..=0xBF, 0x80..=0xBF, ..])
}
