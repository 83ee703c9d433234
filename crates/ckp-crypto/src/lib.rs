//! Key material for connection identity keys.
//!
//! The pool bookkeeping in `ckp-core` never touches private keys. Everything
//! it needs is re-derived here from the wallet seed and a connection index.

#![forbid(unsafe_code)]

pub mod hash;
pub mod seed;
pub mod derive;

#[cfg(test)]
mod proptests;
