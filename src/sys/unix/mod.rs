//! The kqueue-backed unix target (everything unix except Linux).

pub(crate) mod kqueue;
