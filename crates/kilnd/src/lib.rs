//! kilnd — the kiln build daemon.
//!
//! The binary wires [`ContextBackend`] into the `kiln-api` router. The
//! library target exists so integration tests can do the same.

pub mod backend;

pub use backend::ContextBackend;
