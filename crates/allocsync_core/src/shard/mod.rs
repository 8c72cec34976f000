//! Shard routing and shard replica persistence.
//!
//! # Responsibility
//! - Map tiers and states to exactly one replica table (`router`).
//! - Apply propagated rows to replica tables atomically (`sink`).
//! - Read replica rows back for listings and checks (`replica`).
//!
//! # Invariants
//! - Replica tables are written only through [`sink::ShardSink`].
//! - An unroutable row has no replica copy anywhere.

pub mod replica;
pub mod router;
pub mod sink;
