//! Internal services of the Nexus storage engine.
//!
//! - [`store`] – the versioned, encrypted persistent store (SQLite / memory).
//! - [`kek_manager`] – KEK metadata, derivation cache, rotation policy, RMK rotation.
//! - [`engine`] – the envelope-encrypting secret engine on top of both.
//! - [`sweeper`] – the rate-limited background rewrap and retirement task.
//! - [`recovery`] – RMK reconstruction from Keeper shards.

pub mod engine;
pub mod kek_manager;
pub mod recovery;
pub mod store;
pub mod sweeper;
