//! Pure two-phase commit state machines - no I/O, no async, no synchronization
//!
//! The runtimes in [`crate::coordinator`] and [`crate::participant`] wrap these
//! with a mutex and the durable log. Every mutation marks the tables it
//! touched as dirty; the runtime drains the dirty list and appends one
//! snapshot per table before releasing the lock.

pub mod coordinator;
pub mod participant;
