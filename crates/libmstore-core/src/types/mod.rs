pub mod key;
pub mod tid;

pub use key::{RecordKey, ensure_valid_key, is_valid_key};
pub use tid::{Tid, TidParseError};
