//! Crescent engine kernel
//!
//! A minimal stack-machine execution context: tagged values, a single
//! value stack with Lua-style index conventions, tables with metamethod
//! dispatch, and the raise/protected-call pair that gives errors their
//! non-local control flow. This crate is the *raw primitive surface* —
//! it knows nothing about which operations are safe to invoke from host
//! frames; that policy lives in `crescent-guard`.
//!
//! There is deliberately no language front end here: no lexer, parser,
//! or bytecode. Callables are native Rust functions.

/// Engine kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod config;
pub mod error;
pub mod state;
pub mod table;
pub mod value;

pub use config::EngineConfig;
pub use error::EngineError;
pub use state::{EngineState, MULTRET};
pub use table::{KeyError, Table, TableKey, META_INDEX, META_LEN, META_NEWINDEX, META_TOSTRING};
pub use value::{
    BlockHandle, Closure, EngineStr, NativeFn, TableHandle, ThreadCore, ThreadHandle, Value,
    ValueKind,
};
