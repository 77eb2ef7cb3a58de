//! Timestamp identifiers used as commit revisions
//!
//! A TID is a 64-bit value `(microseconds << 10) | clock_id` written as 13
//! characters of sortable base32. String order equals numeric order.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Length of the string form
pub const TID_LEN: usize = 13;

const CLOCK_ID_BITS: u32 = 10;
const CLOCK_ID_MASK: u64 = (1 << CLOCK_ID_BITS) - 1;

/// Errors from parsing a TID string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TidParseError {
    #[error("expected 13 characters, got {0}")]
    InvalidLength(usize),

    #[error("invalid character {0:?}")]
    InvalidChar(char),

    #[error("high bit set in {0}")]
    HighBitSet(String),
}

/// A sortable timestamp identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tid(u64);

impl Tid {
    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        Tid((micros << CLOCK_ID_BITS) | (clock_id as u64 & CLOCK_ID_MASK))
    }

    /// A fresh TID for the current time with a random clock id
    pub fn now() -> Self {
        let clock_id = rand::thread_rng().gen_range(0..=CLOCK_ID_MASK as u16);
        Self::from_parts(now_micros(), clock_id)
    }

    /// A TID strictly greater than `prev`, even if the wall clock went backwards
    pub fn next(prev: Option<&Tid>) -> Self {
        let mut micros = now_micros();
        if let Some(prev) = prev {
            micros = micros.max(prev.timestamp_micros() + 1);
        }
        let clock_id = rand::thread_rng().gen_range(0..=CLOCK_ID_MASK as u16);
        Self::from_parts(micros, clock_id)
    }

    pub fn timestamp_micros(&self) -> u64 {
        self.0 >> CLOCK_ID_BITS
    }

    pub fn clock_id(&self) -> u16 {
        (self.0 & CLOCK_ID_MASK) as u16
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(i64::try_from(self.timestamp_micros()).ok()?)
    }

    pub fn parse(s: &str) -> Result<Self, TidParseError> {
        if s.len() != TID_LEN {
            return Err(TidParseError::InvalidLength(s.len()));
        }
        let mut value: u64 = 0;
        for (i, c) in s.chars().enumerate() {
            let digit = ALPHABET
                .iter()
                .position(|&a| a as char == c)
                .ok_or(TidParseError::InvalidChar(c))? as u64;
            // first char carries only the low 4 bits of a 65-bit field
            if i == 0 && digit >= 16 {
                return Err(TidParseError::HighBitSet(s.to_string()));
            }
            value = (value << 5) | digit;
        }
        Ok(Tid(value))
    }
}

fn now_micros() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [0u8; TID_LEN];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 5 * (TID_LEN - 1 - i);
            *slot = ALPHABET[((self.0 >> shift) & 31) as usize];
        }
        f.write_str(std::str::from_utf8(&out).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Tid {
    type Err = TidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tid::parse(s)
    }
}

impl TryFrom<String> for Tid {
    type Error = TidParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Tid::parse(&value)
    }
}

impl From<Tid> for String {
    fn from(tid: Tid) -> Self {
        tid.to_string()
    }
}
