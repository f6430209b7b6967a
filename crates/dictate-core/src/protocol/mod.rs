//! Line protocol spoken by the transcriber subprocess on stdout.

mod decoder;
mod types;

pub use decoder::{parse_line, DecodeError, LineDecoder, Lines};
pub use types::{ChildProcessUpdate, LoadingState};
