use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RepoError;

/// Maximum length of a record key in bytes
pub const MAX_KEY_LEN: usize = 256;

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9_~\-:.]+/[a-zA-Z0-9_~\-:.]+$").expect("static key pattern")
    })
}

/// Check whether a string is a valid tree key (`collection/record-id`)
pub fn is_valid_key(key: &str) -> bool {
    key.len() <= MAX_KEY_LEN && key_pattern().is_match(key)
}

/// Validate a tree key, returning `InvalidKey` otherwise
pub fn ensure_valid_key(key: &str) -> Result<(), RepoError> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(RepoError::InvalidKey(key.to_string()))
    }
}

/// A validated `collection/record-id` key.
///
/// Ordering is byte-wise over the UTF-8 encoding, which matches tree order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordKey(String);

impl RecordKey {
    pub fn parse(key: &str) -> Result<Self, RepoError> {
        ensure_valid_key(key)?;
        Ok(Self(key.to_string()))
    }

    pub fn new(collection: &str, rkey: &str) -> Result<Self, RepoError> {
        Self::parse(&format!("{}/{}", collection, rkey))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn collection(&self) -> &str {
        self.split().0
    }

    pub fn rkey(&self) -> &str {
        self.split().1
    }

    fn split(&self) -> (&str, &str) {
        // validated keys contain exactly one separator
        self.0.split_once('/').unwrap_or((&self.0, ""))
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RecordKey {
    type Error = RepoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ensure_valid_key(&value)?;
        Ok(Self(value))
    }
}

impl From<RecordKey> for String {
    fn from(key: RecordKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for RecordKey {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
