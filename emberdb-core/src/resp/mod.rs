//! Redis-compatible wire codec
//!
//! Two surfaces: a resumable response parser used on replies from the
//! master, and a request serializer that frames commands as arrays of
//! bulk strings. Partial input lives in the caller's buffer; the parser
//! is a pure function over its prefix, so resuming after a short read
//! is just re-parsing the grown buffer.

pub mod parser;
pub mod value;
pub mod writer;

pub use parser::parse_value;
pub use value::RespValue;
pub use writer::{encode_command, encode_command_line};
