//! Protected operation library
//!
//! One wrapper per risky engine primitive. Each wrapper follows the same
//! protocol: normalize caller indices to absolute form, push a
//! single-purpose auxiliary function, position the operands with in-place
//! moves, run the engine's protected call with exact argument and result
//! counts, and relay the status untouched.
//!
//! Postcondition, uniform across the module: on success the stack holds
//! exactly the declared results and nothing else; on failure it holds
//! exactly one error object (the operands are consumed) and the wrapper's
//! out-parameter, if any, is not produced. The wrappers never look at the
//! error object.
//!
//! Each wrapper notes how many free stack slots it uses; none of them
//! reserve space themselves.

use std::ffi::CStr;
use std::mem;
use std::slice;

use crescent_engine::{EngineError, EngineState, NativeFn, ValueKind, MULTRET};
use crescent_engine::{BlockHandle, EngineStr, ThreadHandle};

/// Status relay of the underlying protected call. On failure the error
/// object is on top of the stack.
pub type Protected<T> = Result<T, EngineError>;

/// Protected table creation. Uses 1 stack slot. Pushes the new table.
pub fn new_table(state: &mut EngineState) -> Protected<()> {
    fn aux(state: &mut EngineState) -> i32 {
        state.create_table();
        1
    }

    state.push_native(aux);
    state.pcall(0, 1)
}

/// Protected length query, honoring `__len`. Uses 2 stack slots. The
/// length is returned out-of-band; the stack is unchanged on success.
pub fn len(state: &mut EngineState, index: i32) -> Protected<i64> {
    fn aux(state: &mut EngineState) -> i32 {
        let n = state.length(-1);
        state.push_int(n);
        1
    }

    let index = state.abs_index(index);
    state.push_native(aux);
    state.push_copy(index);
    state.pcall(1, 1)?;
    let n = state.to_int(-1).unwrap_or(0);
    state.pop(1);
    Ok(n)
}

/// Protected integer-keyed read, honoring `__index`. Uses 3 stack slots.
/// Pushes the value and reports its kind.
pub fn get_index(state: &mut EngineState, index: i32, i: i64) -> Protected<ValueKind> {
    fn aux(state: &mut EngineState) -> i32 {
        state.get_field(-2);
        1
    }

    let index = state.abs_index(index);
    state.push_native(aux);
    state.push_copy(index);
    state.push_int(i);
    state.pcall(2, 1)?;
    Ok(state.kind(-1))
}

/// Protected generic read, honoring `__index`. Expects the key on top of
/// the stack, consumes it, pushes the value and reports its kind. Uses 2
/// extra stack slots.
pub fn get_table(state: &mut EngineState, index: i32) -> Protected<ValueKind> {
    fn aux(state: &mut EngineState) -> i32 {
        state.get_field(-2);
        1
    }

    let index = state.abs_index(index);
    state.push_native(aux);
    state.push_copy(index);
    // The caller's key now sits below [aux, table]; rotate it to the top
    // instead of re-deriving its index.
    state.rotate(-3, -1);
    state.pcall(2, 1)?;
    Ok(state.kind(-1))
}

/// Protected thread creation. Uses 1 stack slot. The thread is left on
/// the stack; its handle is returned on success.
pub fn new_thread(state: &mut EngineState) -> Protected<ThreadHandle> {
    fn aux(state: &mut EngineState) -> i32 {
        state.create_thread();
        1
    }

    state.push_native(aux);
    state.pcall(0, 1)?;
    let thread = state
        .to_thread(-1)
        .expect("protected constructor left a thread on top");
    Ok(thread)
}

/// Protected memory-block creation. Uses 2 stack slots. The block is
/// popped once its handle has been extracted; the caller only wants the
/// handle, and the handle keeps the allocation alive.
pub fn new_block(state: &mut EngineState, size: usize) -> Protected<BlockHandle> {
    fn aux(state: &mut EngineState) -> i32 {
        let size = state.to_lightptr(-1).unwrap_or(0);
        state.pop(1);
        state.create_block(size);
        1
    }

    state.push_native(aux);
    // The size rides through the stack as a light pointer, the same
    // carrier trick the string pushes use.
    state.push_lightptr(size);
    state.pcall(1, 1)?;
    let block = state
        .to_block(-1)
        .expect("protected constructor left a block on top");
    state.pop(1);
    Ok(block)
}

/// Protected iteration step. Expects the previous key on top (nil starts
/// iteration) and consumes it. Produces the next key and value and returns
/// `true`, or produces nothing and returns `false` once the table is
/// exhausted. Exhaustion is detected by comparing stack depths, not by
/// inspecting a flag value. Uses 2 extra stack slots.
pub fn next(state: &mut EngineState, index: i32) -> Protected<bool> {
    fn aux(state: &mut EngineState) -> i32 {
        if state.next_entry(-2) {
            2
        } else {
            0
        }
    }

    let depth = state.top() - 1; // the key on top is consumed either way
    let index = state.abs_index(index);
    state.push_native(aux);
    state.push_copy(index);
    state.rotate(-3, -1);
    state.pcall(2, MULTRET)?;
    Ok(state.top() - depth == 2)
}

/// Protected closure creation: consumes the top `nups` values as upvalues
/// and pushes the closure. Uses 3 extra stack slots. With no upvalues the
/// push cannot raise and no protected call is made.
pub fn push_closure(state: &mut EngineState, function: NativeFn, nups: i32) -> Protected<()> {
    fn aux(state: &mut EngineState) -> i32 {
        let addr = state.to_lightptr(-2).unwrap_or(0);
        let nups = state.to_int(-1).unwrap_or(0);
        state.pop(2);
        // SAFETY: the address was produced from a `NativeFn` two pushes
        // ago in `push_closure` and has only traveled through the stack
        // as an opaque light pointer.
        let function: NativeFn = unsafe { mem::transmute(addr) };
        state.build_closure(function, nups as usize);
        1
    }

    assert!(nups >= 0, "negative upvalue count");
    if nups == 0 {
        state.push_native(function);
        return Ok(());
    }

    state.push_native(aux);
    state.insert(-(nups + 1)); // below the upvalues
    state.push_lightptr(function as usize);
    state.push_int(nups as i64);
    state.pcall(nups + 2, 1)
}

/// Protected length-bounded string push. Embedded NUL bytes are
/// preserved. Uses 3 stack slots. The address and length travel through
/// the stack as a light-pointer carrier pair consumed inside the
/// protected call; they are never visible to the caller as values.
pub fn push_bytes(state: &mut EngineState, bytes: &[u8]) -> Protected<()> {
    fn aux(state: &mut EngineState) -> i32 {
        let addr = state.to_lightptr(-2).unwrap_or(0);
        let len = state.to_int(-1).unwrap_or(0) as usize;
        state.pop(2);
        let bytes = if len == 0 {
            &[]
        } else {
            // SAFETY: address and length describe the `bytes` slice
            // borrowed by `push_bytes`, which outlives this protected
            // call.
            unsafe { slice::from_raw_parts(addr as *const u8, len) }
        };
        state.push_byte_string(bytes);
        1
    }

    state.push_native(aux);
    state.push_lightptr(bytes.as_ptr() as usize);
    state.push_int(bytes.len() as i64);
    state.pcall(2, 1)
}

/// Protected NUL-terminated string push. Uses 2 stack slots.
pub fn push_cstr(state: &mut EngineState, text: &CStr) -> Protected<()> {
    fn aux(state: &mut EngineState) -> i32 {
        let addr = state.to_lightptr(-1).unwrap_or(0);
        state.pop(1);
        // SAFETY: the address came from the `CStr` borrowed by
        // `push_cstr`, which outlives this protected call.
        let text = unsafe { CStr::from_ptr(addr as *const std::os::raw::c_char) };
        state.push_byte_string(text.to_bytes());
        1
    }

    state.push_native(aux);
    state.push_lightptr(text.as_ptr() as usize);
    state.pcall(1, 1)
}

/// Protected raw table write, no metamethods. Expects key and value on
/// top of the stack and consumes both. Uses 2 extra stack slots.
pub fn raw_set(state: &mut EngineState, index: i32) -> Protected<()> {
    fn aux(state: &mut EngineState) -> i32 {
        state.raw_set_field(-3);
        0
    }

    let index = state.abs_index(index);
    state.push_copy(index);
    state.insert(-3); // table below key and value
    state.push_native(aux);
    state.insert(-4);
    state.pcall(3, 0)
}

/// Protected generic table write, honoring `__newindex`. Expects key and
/// value on top of the stack and consumes both. Uses 2 extra stack slots.
pub fn set_table(state: &mut EngineState, index: i32) -> Protected<()> {
    fn aux(state: &mut EngineState) -> i32 {
        state.set_field(-3);
        0
    }

    let index = state.abs_index(index);
    state.push_copy(index);
    state.insert(-3);
    state.push_native(aux);
    state.insert(-4);
    state.pcall(3, 0)
}

/// Protected string coercion, honoring `__tostring`. On success the
/// coerced string replaces the value in the caller's slot and its bytes
/// are returned; `None` means the value has no string form and the slot
/// is untouched. Uses 2 stack slots.
pub fn to_string(state: &mut EngineState, index: i32) -> Protected<Option<EngineStr>> {
    fn aux(state: &mut EngineState) -> i32 {
        if !state.push_coerced(-1) {
            // Coercion never yields nil, so nil marks "no string form".
            state.push_nil();
        }
        1
    }

    let index = state.abs_index(index);
    state.push_native(aux);
    state.push_copy(index);
    state.pcall(1, 1)?;
    if state.is_nil(-1) {
        state.pop(1);
        return Ok(None);
    }
    // Coercion is logically an in-place replace.
    state.replace(index);
    Ok(state.str_bytes(index))
}
