//! Operator commands

pub mod seed;
pub mod verify;

pub use seed::seed_legacy;
pub use verify::{verify_placement, Misplaced, VerifyReport};
