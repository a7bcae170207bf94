//! A deterministic sandbox for object-oriented contract code.
//!
//! Deployment runs submitted modules through the [static complexity validator](validate) and the
//! [instruction rewriter](rewrite), producing a linked [`CodeUnit`]. Invocations execute a unit
//! against a [`WorldState`], metering every step through an [`EnergyLedger`] and persisting each
//! contract's object graph through the [`persistence`] layer.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub mod builtins;
pub mod bytecode;
pub mod codec;
pub mod constants;

pub mod module;
pub use module::*;

mod value;
pub use value::*;

mod error;
pub use error::*;

mod container;
pub use container::*;

pub mod validate;
pub use validate::*;

pub mod rewrite;

pub mod ledger;
pub use ledger::*;

pub mod storage;
pub use storage::*;

pub mod persistence;
pub use persistence::*;

pub mod unit;
pub use unit::*;

pub mod interpreter;
pub use interpreter::*;

mod sandbox;
pub use sandbox::*;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
