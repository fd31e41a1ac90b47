//! Buffer cursor (`spec.md` §4.2): a borrowed, three-pointer view over a
//! contiguous region, shared by the TCP input and output buffers.

pub mod cursor;

pub use cursor::{ByteOrder, Cursor};
