//! Core engine — tasks, bids, auctions, the ledgered economy, exception
//! detection, and the round and arena orchestration built on them.

pub mod tasks;
pub mod bidding;
pub mod economy;
pub mod auction;
pub mod exceptions;
pub mod round;
pub mod arena;
