//! Engine use-case services.
//!
//! # Responsibility
//! - [`sync_service`]: master writes fanned out to aggregates, replicas and
//!   cache invalidation.
//! - [`query_service`]: cached listing and statistics reads.

pub mod query_service;
pub mod sync_service;
