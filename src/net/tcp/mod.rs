//! TCP connections and listeners (`spec.md` §3, §4.4, §4.5).

pub(crate) mod buf;
pub(crate) mod connection;
pub(crate) mod listener;

pub use buf::{InputBuffer, OutputBuffer};
pub use connection::{ConnState, Connection};
pub use listener::{ListenState, Listener};
