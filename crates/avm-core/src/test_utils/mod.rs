//! Test utilities for the contract sandbox.

mod assembler;
mod harness;
mod world;

pub use assembler::*;
pub use harness::*;
pub use world::*;
