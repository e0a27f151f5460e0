//! Cross-crate tests for spindex.
//!
//! The index equivalence suite checks that however a chain reaches the
//! index (one pass, flush by flush, through a reorg or after a crash) the
//! stored tables come out the same. The session suite drives real TCP
//! clients through the whole server stack.

pub mod helpers;
