//! Callback trampoline
//!
//! Lets the engine invoke a host function as a normal callable. The host
//! function must never raise on its own; a raise unwinding out of a host
//! frame is exactly the failure mode this crate exists to prevent.
//! Instead it returns one of a small closed set of sentinel codes, and the
//! trampoline, which runs as an engine callable where raising is safe,
//! decodes them:
//!
//! - `MULTRET`: return every value in the frame, unconsumed call
//!   arguments included (data-dependent result counts).
//! - [`CALLBACK_STACK_ERR`]: raise a formatted "stack overflow in
//!   callback" error. The one error this crate manufactures itself.
//! - [`CALLBACK_ERR`]: raise with the error value the host function left
//!   on top of the stack, letting hosts build arbitrary error payloads
//!   without touching the raise primitive.
//! - any other non-negative value: a literal count of results already
//!   pushed, returned as-is.

use std::mem;

use tracing::{debug, trace};

use crescent_engine::{EngineState, Value, MULTRET};

use crate::protected::{self, Protected};

/// Sentinel: the host callback ran out of stack space.
pub const CALLBACK_STACK_ERR: i32 = -2;
/// Sentinel: re-raise the error value the host callback left on top.
pub const CALLBACK_ERR: i32 = -3;

/// A host-supplied function invoked through the trampoline. Same shape as
/// an engine native function, but its return value is a sentinel code,
/// and it must signal errors through the sentinels rather than raising.
pub type Callback = fn(&mut EngineState) -> i32;

/// The engine-visible callable. Fetches the real host function from the
/// hidden first upvalue and decodes its sentinel result.
fn dispatch(state: &mut EngineState) -> i32 {
    let addr = match state.upvalue(1) {
        Value::LightPtr(addr) => addr,
        _ => state.raise_error("callback closure is missing its function pointer"),
    };
    // SAFETY: upvalue 1 was stored by `push_callback` from a `Callback`
    // and is invisible to host code; nothing else writes closure
    // upvalues.
    let callback: Callback = unsafe { mem::transmute(addr) };

    let ret = callback(state);
    trace!(ret, "host callback returned");
    if ret == MULTRET {
        MULTRET
    } else if ret == CALLBACK_STACK_ERR {
        debug!("converting callback stack-overflow sentinel into an engine error");
        state.raise_error("stack overflow in callback")
    } else if ret == CALLBACK_ERR {
        let error = state.pop_value();
        state.raise(error)
    } else {
        ret
    }
}

/// Build a trampoline-backed callable capturing the top `nups` values as
/// the host function's upvalues, and push it.
///
/// The raw function pointer is stored as a hidden first upvalue below the
/// caller's values, so host callbacks see their own upvalues starting at
/// slot 2. Delegates to [`protected::push_closure`] with `nups + 1`
/// captured values; the status convention is the same.
pub fn push_callback(state: &mut EngineState, callback: Callback, nups: i32) -> Protected<()> {
    assert!(nups >= 0, "negative upvalue count");
    state.push_lightptr(callback as usize);
    state.insert(-(nups + 1));
    protected::push_closure(state, dispatch, nups + 1)
}
