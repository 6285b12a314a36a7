//! Channel identity: tag handles, numeric ids and the cached mapping
//! between them.

mod reference;

pub use reference::{ChannelDirectory, ChannelReference, Provenance};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid tag handle '{0}'")]
    InvalidTag(String),

    #[error("invalid numeric id '{0}': {1}")]
    InvalidNumericId(String, &'static str),

    #[error("channel reference needs a tag handle or a numeric id")]
    Empty,

    #[error("channel reference is incomplete")]
    Incomplete,

    #[error("no tag handle is stored for numeric id {0}")]
    NotFound(NumericId),

    #[error("numeric id {numeric_id} is stored as '{stored}', but was observed as '{observed}'")]
    InconsistentMapping {
        numeric_id: NumericId,
        stored: TagHandle,
        observed: TagHandle,
    },

    #[error("channel id {known} was observed as {observed}")]
    IdChanged { known: NumericId, observed: NumericId },

    #[error("resolving a numeric id from a tag handle is not supported")]
    ReverseLookupUnsupported,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Public `@handle` of a channel, stored without the `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagHandle(String);

impl TagHandle {
    pub fn new(tag: &str) -> Result<Self, ChannelError> {
        let valid = tag.len() >= 5
            && tag
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if !valid {
            return Err(ChannelError::InvalidTag(tag.to_string()));
        }
        Ok(Self(tag.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Profile URL shown in the client's detail view.
    pub fn profile_url(&self) -> String {
        format!("https://t.me/{}", self.0)
    }
}

impl fmt::Display for TagHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TagHandle {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<TagHandle> for String {
    fn from(tag: TagHandle) -> Self {
        tag.0
    }
}

/// Numeric peer id, kept in its decimal string form.
///
/// Real ids use between 10 and 64 significant bits; anything outside that
/// range is a placeholder or garbage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NumericId(String);

impl NumericId {
    pub fn new(id: &str) -> Result<Self, ChannelError> {
        let value: i128 = id
            .parse()
            .map_err(|_| ChannelError::InvalidNumericId(id.to_string(), "not an integer"))?;
        let bits = 128 - value.unsigned_abs().leading_zeros();
        if bits > 64 {
            return Err(ChannelError::InvalidNumericId(id.to_string(), "too large"));
        }
        if bits < 10 {
            return Err(ChannelError::InvalidNumericId(id.to_string(), "too small"));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NumericId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NumericId {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<NumericId> for String {
    fn from(id: NumericId) -> Self {
        id.0
    }
}

/// Channel as named by a job: `@tag` or a numeric id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    Tag(TagHandle),
    Numeric(NumericId),
}

impl FromStr for ChannelRef {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix('@') {
            Some(tag) => Ok(ChannelRef::Tag(TagHandle::new(tag)?)),
            None => Ok(ChannelRef::Numeric(NumericId::new(s)?)),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Tag(tag) => write!(f, "@{}", tag),
            ChannelRef::Numeric(id) => write!(f, "{}", id),
        }
    }
}
