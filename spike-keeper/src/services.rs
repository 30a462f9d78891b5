//! Internal services of the Keeper.
//!
//! - [`keeper_state`] – the NOT_READY → CONTRIBUTING → READY state machine
//!   with its persisted state and shard files.
//! - [`broadcaster`] – delivers this Keeper's contribution to every peer.
//! - [`collector`] – polls the contribution count and finalizes the shard.

pub mod broadcaster;
pub mod collector;
pub mod keeper_state;
