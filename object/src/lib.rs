mod fwd;
mod header;
mod value;

pub use fwd::{FWD_BYTES, FWD_WORDS, fwd_get, fwd_init, fwd_set, is_self_forwarded};
pub use header::{Header, HeaderFlags, object_size};
pub use value::Value;

/// Size of a heap word in bytes. The heap deals exclusively in 8-byte words.
pub const WORD_BYTES: usize = 8;
