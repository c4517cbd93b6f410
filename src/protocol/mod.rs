//! RESP wire format: reply values, the incremental reply parser and
//! command encoding.

pub mod parser;
pub mod types;

pub use parser::RespParser;
pub use types::{encode_command, RespValue};
