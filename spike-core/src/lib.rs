#![deny(missing_docs)]
//! Cryptographic core of SPIKE.
//!
//! This crate implements the key hierarchy primitives shared by the Keeper
//! and Nexus services:
//!
//! * [`rmk`] — folding Keeper entropy contributions into the Root Master Key.
//! * [`shamir`] — threshold secret sharing of the RMK over the P-256 scalar
//!   field, with the deterministic splitting the Keeper bootstrap relies on.
//! * [`kdf`] — deterministic HKDF-SHA256 derivation of Key Encryption Keys
//!   from the RMK.
//! * [`envelope`] — the AES-256-GCM envelope codec: per-version Data
//!   Encryption Keys, DEK wrap/unwrap/rewrap under a KEK, and the derived
//!   per-field nonces the metadata rows use.
//!
//! Everything here is pure computation: no I/O, no locking, no tasks. The
//! services compose these primitives with their stores and schedulers.

pub mod envelope;
pub mod kdf;
pub mod rmk;
pub mod shamir;
