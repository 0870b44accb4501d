//! Shared test utilities for the guard test suites.
#![allow(dead_code)] // not every suite uses every helper

use crescent_engine::{EngineState, NativeFn, Value};
use crescent_guard::protected;

// Re-export testing utilities
pub use pretty_assertions::{assert_eq, assert_ne};

/// Build a sequence table `{10, 20, ..., n * 10}` on top of the stack
/// using the protected API itself.
pub fn push_seq_table(state: &mut EngineState, n: usize) {
    protected::new_table(state).expect("table creation");
    for i in 1..=n {
        state.push_int(i as i64);
        state.push_int((i * 10) as i64);
        protected::raw_set(state, -3).expect("raw set");
    }
}

/// Install `{ slot = handler }` as the metatable of the table at `index`.
pub fn install_metamethod(state: &mut EngineState, index: i32, slot: &str, handler: NativeFn) {
    let index = state.abs_index(index);
    protected::new_table(state).expect("metatable creation");
    state.push_value(Value::from_text(slot));
    state.push_native(handler);
    protected::raw_set(state, -3).expect("metamethod install");
    state.set_metatable(index);
}

/// A metamethod that always raises.
pub fn raising_handler(state: &mut EngineState) -> i32 {
    state.raise_error("metamethod exploded")
}

/// Error object on top of the stack, as lossy text.
pub fn error_text(state: &EngineState) -> String {
    let bytes = state
        .str_bytes(-1)
        .expect("error object on top of the stack is not a string");
    String::from_utf8_lossy(&bytes).into_owned()
}
