//! Replication engine: propagation, aggregate maintenance and their
//! concurrency primitives.

pub mod aggregate;
pub mod locks;
pub mod propagator;
pub mod shutdown;
