//! The IOCP-backed Windows target.

pub(crate) mod iocp;
pub(crate) mod net;
