//! Network primitives. TCP is the only protocol in scope (`spec.md` §1);
//! UDP is an explicit non-goal and is not re-specified here.

pub mod tcp;
