//! Engine execution state
//!
//! One `EngineState` per execution context: the value stack, the call
//! frames, and every raw primitive the shim layers build on. Indices are
//! 1-based; positive indices are absolute (stable across pushes), negative
//! indices count down from the top and shift as values are pushed.
//!
//! Primitives come in two flavors:
//! - unconditional: stack manipulation, type tests, conversions. These
//!   never raise except on host API misuse (which is an ordinary panic,
//!   not an engine raise).
//! - risky: anything that allocates or dispatches through metamethods
//!   (`create_*`, `push_byte_string`, `build_closure`, `get_field`,
//!   `set_field`, `length`, `next_entry`, `push_coerced`, `raw_set_field`).
//!   These may raise and must only be invoked below a protected call.

use std::mem;
use std::panic::{self, AssertUnwindSafe};

use tracing::trace;

use crate::config::EngineConfig;
use crate::error::{self, EngineError};
use crate::table::{Table, TableKey, META_INDEX, META_LEN, META_NEWINDEX, META_TOSTRING};
use crate::value::{
    BlockHandle, Closure, EngineStr, NativeFn, TableHandle, ThreadHandle, Value,
    ValueKind,
};

/// Result-count marker: "return everything the frame holds" when passed to
/// [`EngineState::call`]/[`EngineState::pcall`], or returned from a native
/// function.
pub const MULTRET: i32 = -1;

/// Metamethod chains longer than this raise instead of looping forever.
const DISPATCH_LIMIT: usize = 100;

struct Frame {
    /// Slot of the first argument (0-based into the stack vector).
    base: usize,
    closure: Option<std::sync::Arc<Closure>>,
}

/// A single engine execution context.
pub struct EngineState {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    config: EngineConfig,
    alloc_used: usize,
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineState {
    pub fn new() -> EngineState {
        EngineState::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> EngineState {
        error::install_raise_hook();
        EngineState {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            config,
            alloc_used: 0,
        }
    }

    // ===== Index arithmetic =====

    /// Number of values on the stack.
    pub fn top(&self) -> i32 {
        self.stack.len() as i32
    }

    /// Normalize an index to absolute (positive) form.
    pub fn abs_index(&self, index: i32) -> i32 {
        if index > 0 {
            index
        } else {
            self.top() + 1 + index
        }
    }

    /// Resolve an index to a 0-based stack slot. Misuse panics: an invalid
    /// index is a host bug, not an engine error.
    fn slot(&self, index: i32) -> usize {
        let abs = self.abs_index(index);
        assert!(
            abs >= 1 && abs <= self.top(),
            "stack index {index} out of range (top = {})",
            self.top()
        );
        (abs - 1) as usize
    }

    /// Borrow the value at `index`.
    pub fn value(&self, index: i32) -> &Value {
        &self.stack[self.slot(index)]
    }

    pub fn kind(&self, index: i32) -> ValueKind {
        self.value(index).kind()
    }

    pub fn is_nil(&self, index: i32) -> bool {
        self.value(index).is_nil()
    }

    // ===== Pushing and popping =====

    fn push(&mut self, value: Value) {
        if self.stack.len() >= self.config.stack_limit {
            self.raise_error("stack overflow");
        }
        self.stack.push(value);
    }

    /// True when `extra` more slots fit under the configured stack limit.
    pub fn check_stack(&self, extra: usize) -> bool {
        self.stack.len() + extra <= self.config.stack_limit
    }

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(Value::Bool(b));
    }

    pub fn push_int(&mut self, i: i64) {
        self.push(Value::Int(i));
    }

    pub fn push_float(&mut self, f: f64) {
        self.push(Value::Float(f));
    }

    /// Push a bare native function. Unlike closures this allocates nothing
    /// and cannot raise short of stack overflow, which is what makes it
    /// usable as the auxiliary-function push in protected wrappers.
    pub fn push_native(&mut self, function: NativeFn) {
        self.push(Value::Native(function));
    }

    /// Push an address-carrying light value.
    pub fn push_lightptr(&mut self, addr: usize) {
        self.push(Value::LightPtr(addr));
    }

    /// Push an already-built value (copy semantics, no allocation charge).
    pub fn push_value(&mut self, value: Value) {
        self.push(value);
    }

    /// Push a copy of the value at `index`.
    pub fn push_copy(&mut self, index: i32) {
        let value = self.value(index).clone();
        self.push(value);
    }

    pub fn pop(&mut self, n: usize) {
        assert!(n <= self.stack.len(), "pop of {n} exceeds stack depth");
        self.stack.truncate(self.stack.len() - n);
    }

    pub fn pop_value(&mut self) -> Value {
        assert!(!self.stack.is_empty(), "pop from empty stack");
        self.stack.pop().unwrap_or(Value::Nil)
    }

    // ===== In-place stack surgery =====

    /// Rotate the segment between `index` and the top by `n` positions
    /// toward the top (negative `n` rotates toward the bottom).
    pub fn rotate(&mut self, index: i32, n: i32) {
        let start = self.slot(index);
        let segment = &mut self.stack[start..];
        let len = segment.len();
        assert!(
            (n.unsigned_abs() as usize) <= len,
            "rotate distance {n} exceeds segment of {len}"
        );
        if n >= 0 {
            segment.rotate_right(n as usize);
        } else {
            segment.rotate_left(n.unsigned_abs() as usize);
        }
    }

    /// Move the top value into `index`, shifting values above it up.
    pub fn insert(&mut self, index: i32) {
        self.rotate(index, 1);
    }

    /// Remove the value at `index`, shifting values above it down.
    pub fn remove(&mut self, index: i32) {
        self.rotate(index, -1);
        self.pop(1);
    }

    /// Pop the top value into `index`.
    pub fn replace(&mut self, index: i32) {
        let slot = self.slot(index);
        let value = self.pop_value();
        self.stack[slot] = value;
    }

    // ===== Conversions =====

    /// Integer reading: integers directly, floats with an integral value.
    pub fn to_int(&self, index: i32) -> Option<i64> {
        match self.value(index) {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// String bytes, without coercion.
    pub fn str_bytes(&self, index: i32) -> Option<EngineStr> {
        match self.value(index) {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn to_table(&self, index: i32) -> Option<TableHandle> {
        match self.value(index) {
            Value::Table(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn to_thread(&self, index: i32) -> Option<ThreadHandle> {
        match self.value(index) {
            Value::Thread(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn to_block(&self, index: i32) -> Option<BlockHandle> {
        match self.value(index) {
            Value::Block(h) => Some(h.clone()),
            _ => None,
        }
    }

    pub fn to_lightptr(&self, index: i32) -> Option<usize> {
        match self.value(index) {
            Value::LightPtr(addr) => Some(*addr),
            _ => None,
        }
    }

    // ===== Upvalues =====

    /// Upvalue `i` (1-based) of the closure currently executing. Nil when
    /// there is no such upvalue or the running function is a bare native.
    pub fn upvalue(&self, i: usize) -> Value {
        self.frames
            .last()
            .and_then(|frame| frame.closure.as_ref())
            .and_then(|closure| closure.upvalues.get(i.wrapping_sub(1)))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    // ===== Raising =====

    /// Raise with an explicit error object. Never returns.
    pub fn raise(&mut self, error: Value) -> ! {
        error::raise(EngineError::Runtime, error)
    }

    /// Raise with a freshly formatted string error object.
    pub fn raise_error(&mut self, message: impl Into<String>) -> ! {
        let error = Value::from_text(&message.into());
        error::raise(EngineError::Runtime, error)
    }

    fn raise_memory(&mut self) -> ! {
        error::raise(EngineError::Memory, Value::from_bytes(b"not enough memory"))
    }

    /// Charge `bytes` against the simulated allocation budget.
    fn charge(&mut self, bytes: usize) {
        if let Some(budget) = self.config.alloc_budget {
            if self.alloc_used.saturating_add(bytes) > budget {
                self.raise_memory();
            }
        }
        self.alloc_used += bytes;
    }

    // ===== Calls =====

    /// Raw call: invoke the callable at `top - nargs`, consuming it and the
    /// `nargs` values above it. `nresults` results are left in their place
    /// (`MULTRET` keeps however many the callee produced). A raise inside
    /// the callee unwinds straight through this function.
    pub fn call(&mut self, nargs: i32, nresults: i32) {
        assert!(nargs >= 0, "negative argument count");
        assert!(nresults >= MULTRET, "invalid result count {nresults}");
        let nargs = nargs as usize;
        assert!(
            self.stack.len() > nargs,
            "call of {nargs} arguments on a stack of {}",
            self.stack.len()
        );

        let func_pos = self.stack.len() - nargs - 1;
        let (function, closure) = match &self.stack[func_pos] {
            Value::Native(f) => (*f, None),
            Value::Closure(c) => (c.function, Some(c.clone())),
            other => {
                let kind = other.kind();
                self.raise_error(format!("attempt to call a {kind} value"));
            }
        };

        let base = func_pos + 1;
        self.frames.push(Frame { base, closure });
        let ret = function(self);
        self.frames.pop();

        assert!(
            self.stack.len() >= base,
            "native function popped below its frame"
        );
        let produced = self.stack.len() - base;
        let returned = if ret == MULTRET {
            produced
        } else {
            assert!(ret >= 0, "invalid native return code {ret}");
            let ret = ret as usize;
            assert!(ret <= produced, "native function returned {ret} results but produced {produced}");
            ret
        };

        // Slide the results down over the callee and any frame residue.
        let first_result = self.stack.len() - returned;
        self.stack.drain(func_pos..first_result);

        if nresults != MULTRET {
            let want = nresults as usize;
            while self.stack.len() - func_pos < want {
                self.stack.push(Value::Nil);
            }
            self.stack.truncate(func_pos + want);
        }
    }

    /// Native protected call. Identical to [`call`](Self::call) on success;
    /// a raise inside the callee is caught here, the callee and its
    /// arguments are removed, the single error object is pushed in their
    /// place, and the raise's status is returned. Foreign panics are
    /// resumed, never converted.
    pub fn pcall(&mut self, nargs: i32, nresults: i32) -> Result<(), EngineError> {
        assert!(nargs >= 0, "negative argument count");
        assert!(
            self.stack.len() > nargs as usize,
            "pcall of {nargs} arguments on a stack of {}",
            self.stack.len()
        );
        let func_pos = self.stack.len() - nargs as usize - 1;
        let frame_depth = self.frames.len();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.call(nargs, nresults)));
        match outcome {
            Ok(()) => Ok(()),
            Err(payload) => match payload.downcast::<error::RaiseSignal>() {
                Ok(signal) => {
                    let error::RaiseSignal { kind, error } = *signal;
                    self.frames.truncate(frame_depth);
                    self.stack.truncate(func_pos);
                    self.stack.push(error);
                    trace!(status = ?kind, "protected call failed");
                    Err(kind)
                }
                Err(foreign) => panic::resume_unwind(foreign),
            },
        }
    }

    // ===== Risky primitives: allocation =====

    /// Push a fresh empty table.
    pub fn create_table(&mut self) {
        self.charge(mem::size_of::<Table>());
        self.push(Value::Table(TableHandle::new(Table::new())));
    }

    /// Push a fresh secondary execution context.
    pub fn create_thread(&mut self) {
        self.charge(mem::size_of::<crate::value::ThreadCore>());
        self.push(Value::Thread(ThreadHandle::new()));
    }

    /// Push a fresh zero-filled memory block of `size` bytes.
    pub fn create_block(&mut self, size: usize) {
        self.charge(size);
        self.push(Value::Block(BlockHandle::new(size)));
    }

    /// Push a byte string.
    pub fn push_byte_string(&mut self, bytes: &[u8]) {
        self.charge(bytes.len());
        self.push(Value::from_bytes(bytes));
    }

    /// Consume the top `n` values as upvalues (bottom-most becomes upvalue
    /// 1) and push the resulting closure.
    pub fn build_closure(&mut self, function: NativeFn, n: usize) {
        assert!(n <= self.stack.len(), "closure captures more than the stack holds");
        self.charge(mem::size_of::<Closure>() + n * mem::size_of::<Value>());
        let upvalues = self.stack.split_off(self.stack.len() - n);
        self.push(Value::Closure(std::sync::Arc::new(Closure {
            function,
            upvalues,
        })));
    }

    // ===== Risky primitives: metamethod dispatch =====

    fn metamethod_of(&self, handle: &TableHandle, name: &[u8]) -> Option<Value> {
        // Lock the metatable only after the table's own guard is gone:
        // a table may be its own metatable.
        let meta = handle.lock().metatable()?;
        let slot = meta.lock().get(&TableKey::Str(EngineStr::from(name)));
        if slot.is_nil() {
            None
        } else {
            Some(slot)
        }
    }

    /// Metamethod-aware read: pops the key from the top, reads
    /// `value_at(index)[key]`, pushes the result.
    pub fn get_field(&mut self, index: i32) {
        let slot = self.slot(index);
        let key = self.pop_value();
        let mut target = self.stack[slot].clone();

        for _ in 0..DISPATCH_LIMIT {
            let handle = match &target {
                Value::Table(h) => h.clone(),
                other => {
                    let kind = other.kind();
                    self.raise_error(format!("attempt to index a {kind} value"));
                }
            };

            let raw = match TableKey::try_from_value(&key) {
                Ok(k) => handle.lock().get(&k),
                // Reading with an unusable key is not an error, it just
                // misses.
                Err(_) => Value::Nil,
            };
            if !raw.is_nil() {
                self.push(raw);
                return;
            }

            match self.metamethod_of(&handle, META_INDEX) {
                None => {
                    self.push_nil();
                    return;
                }
                Some(handler @ (Value::Native(_) | Value::Closure(_))) => {
                    self.push(handler);
                    self.push(target);
                    self.push(key);
                    self.call(2, 1);
                    return;
                }
                Some(next) => {
                    target = next;
                }
            }
        }
        self.raise_error("'__index' chain too long; possible loop");
    }

    /// Metamethod-aware write: pops the value and the key from the top,
    /// performs `value_at(index)[key] = value`.
    pub fn set_field(&mut self, index: i32) {
        let slot = self.slot(index);
        let value = self.pop_value();
        let key = self.pop_value();
        let mut target = self.stack[slot].clone();

        for _ in 0..DISPATCH_LIMIT {
            let handle = match &target {
                Value::Table(h) => h.clone(),
                other => {
                    let kind = other.kind();
                    self.raise_error(format!("attempt to index a {kind} value"));
                }
            };

            let key_slot = TableKey::try_from_value(&key);
            let present = match &key_slot {
                Ok(k) => handle.lock().contains(k),
                Err(_) => false,
            };
            let handler = if present {
                None
            } else {
                self.metamethod_of(&handle, META_NEWINDEX)
            };

            match handler {
                None => {
                    let k = match key_slot {
                        Ok(k) => k,
                        Err(err) => self.raise_error(err.to_string()),
                    };
                    self.charge(mem::size_of::<(TableKey, Value)>());
                    handle.lock().set(k, value);
                    return;
                }
                Some(h @ (Value::Native(_) | Value::Closure(_))) => {
                    self.push(h);
                    self.push(target);
                    self.push(key);
                    self.push(value);
                    self.call(3, 0);
                    return;
                }
                Some(next) => {
                    target = next;
                }
            }
        }
        self.raise_error("'__newindex' chain too long; possible loop");
    }

    /// Raw read, no metamethods: pops the key, pushes the stored value.
    pub fn raw_get_field(&mut self, index: i32) {
        let slot = self.slot(index);
        let key = self.pop_value();
        let handle = match &self.stack[slot] {
            Value::Table(h) => h.clone(),
            other => {
                let kind = other.kind();
                self.raise_error(format!("attempt to index a {kind} value"));
            }
        };
        let raw = match TableKey::try_from_value(&key) {
            Ok(k) => handle.lock().get(&k),
            Err(_) => Value::Nil,
        };
        self.push(raw);
    }

    /// Raw write, no metamethods: pops the value and the key.
    pub fn raw_set_field(&mut self, index: i32) {
        let slot = self.slot(index);
        let value = self.pop_value();
        let key = self.pop_value();
        let handle = match &self.stack[slot] {
            Value::Table(h) => h.clone(),
            other => {
                let kind = other.kind();
                self.raise_error(format!("attempt to index a {kind} value"));
            }
        };
        let k = match TableKey::try_from_value(&key) {
            Ok(k) => k,
            Err(err) => self.raise_error(err.to_string()),
        };
        self.charge(mem::size_of::<(TableKey, Value)>());
        handle.lock().set(k, value);
    }

    /// Length of the value at `index`, honoring `__len`.
    pub fn length(&mut self, index: i32) -> i64 {
        let value = self.value(index).clone();
        match value {
            Value::Str(s) => s.len() as i64,
            Value::Table(handle) => match self.metamethod_of(&handle, META_LEN) {
                Some(handler) => {
                    self.push(handler);
                    self.push(Value::Table(handle));
                    self.call(1, 1);
                    let result = self.to_int(-1);
                    self.pop(1);
                    match result {
                        Some(n) => n,
                        None => self.raise_error("object length is not an integer"),
                    }
                }
                None => handle.lock().sequence_len(),
            },
            other => {
                let kind = other.kind();
                self.raise_error(format!("attempt to get length of a {kind} value"))
            }
        }
    }

    /// One iteration step: pops the previous key (nil starts iteration)
    /// from the top; pushes the next key and value and returns `true`, or
    /// pushes nothing and returns `false` once the table is exhausted.
    pub fn next_entry(&mut self, index: i32) -> bool {
        let slot = self.slot(index);
        let key = self.pop_value();
        let handle = match &self.stack[slot] {
            Value::Table(h) => h.clone(),
            other => {
                let kind = other.kind();
                self.raise_error(format!("attempt to iterate a {kind} value"));
            }
        };
        let prev = if key.is_nil() {
            None
        } else {
            match TableKey::try_from_value(&key) {
                Ok(k) => Some(k),
                Err(err) => self.raise_error(format!("invalid key to iteration: {err}")),
            }
        };
        let entry = handle.lock().next_after(prev.as_ref());
        match entry {
            Some((k, v)) => {
                self.push(Value::from(&k));
                self.push(v);
                true
            }
            None => false,
        }
    }

    /// String coercion of the value at `index`, honoring `__tostring`.
    /// Pushes the coerced string and returns `true`, or pushes nothing and
    /// returns `false` when the value has no string form.
    pub fn push_coerced(&mut self, index: i32) -> bool {
        let value = self.value(index).clone();
        match value {
            Value::Str(s) => {
                self.push(Value::Str(s));
                true
            }
            Value::Int(i) => {
                let text = i.to_string();
                self.push_byte_string(text.as_bytes());
                true
            }
            Value::Float(f) => {
                let text = f.to_string();
                self.push_byte_string(text.as_bytes());
                true
            }
            Value::Table(handle) => match self.metamethod_of(&handle, META_TOSTRING) {
                Some(handler) => {
                    self.push(handler);
                    self.push(Value::Table(handle));
                    self.call(1, 1);
                    if self.kind(-1) != ValueKind::Str {
                        self.raise_error("'__tostring' must return a string");
                    }
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    // ===== Metatables =====

    /// Pop the top value (a table, or nil to clear) and install it as the
    /// metatable of the table at `index`.
    pub fn set_metatable(&mut self, index: i32) {
        let slot = self.slot(index);
        let meta = match self.pop_value() {
            Value::Table(h) => Some(h),
            Value::Nil => None,
            other => panic!("metatable must be a table or nil, got {}", other.kind()),
        };
        match &self.stack[slot] {
            Value::Table(h) => h.lock().set_metatable(meta),
            other => panic!("value at index {index} is a {}, not a table", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn seq_table(state: &mut EngineState, values: &[i64]) {
        state.create_table();
        for (i, v) in values.iter().enumerate() {
            state.push_int(i as i64 + 1);
            state.push_int(*v);
            state.raw_set_field(-3);
        }
    }

    #[test]
    fn test_abs_index_round_trip() {
        let mut state = EngineState::new();
        state.push_int(1);
        state.push_int(2);
        state.push_int(3);
        assert_eq!(state.abs_index(-1), 3);
        assert_eq!(state.abs_index(-3), 1);
        assert_eq!(state.abs_index(2), 2);
    }

    #[test]
    fn test_rotate_matches_expected_order() {
        let mut state = EngineState::new();
        for i in 1..=4 {
            state.push_int(i);
        }
        // [1 2 3 4] rotated by -1 from slot 2 -> [1 3 4 2]
        state.rotate(2, -1);
        let collected: Vec<_> = (1..=4).map(|i| state.to_int(i).unwrap()).collect();
        assert_eq!(collected, vec![1, 3, 4, 2]);
    }

    #[test]
    fn test_insert_moves_top_down() {
        let mut state = EngineState::new();
        for i in 1..=3 {
            state.push_int(i);
        }
        state.insert(1);
        let collected: Vec<_> = (1..=3).map(|i| state.to_int(i).unwrap()).collect();
        assert_eq!(collected, vec![3, 1, 2]);
    }

    #[test]
    fn test_replace_pops_into_slot() {
        let mut state = EngineState::new();
        state.push_int(1);
        state.push_int(2);
        state.push_int(9);
        state.replace(1);
        assert_eq!(state.top(), 2);
        assert_eq!(state.to_int(1), Some(9));
    }

    #[test]
    fn test_call_adjusts_results() {
        fn two_results(state: &mut EngineState) -> i32 {
            state.push_int(10);
            state.push_int(20);
            2
        }
        let mut state = EngineState::new();
        state.push_native(two_results);
        state.call(0, 3);
        assert_eq!(state.top(), 3);
        assert_eq!(state.to_int(1), Some(10));
        assert_eq!(state.to_int(2), Some(20));
        assert!(state.is_nil(3));
    }

    #[test]
    fn test_call_multret_keeps_frame_contents() {
        fn variable(state: &mut EngineState) -> i32 {
            state.push_int(1);
            state.push_int(2);
            MULTRET
        }
        let mut state = EngineState::new();
        state.push_native(variable);
        state.call(0, MULTRET);
        assert_eq!(state.top(), 2);
    }

    #[test]
    fn test_pcall_restores_stack_on_raise() {
        fn boom(state: &mut EngineState) -> i32 {
            state.push_int(1); // residue that must be discarded
            state.raise_error("expected failure")
        }
        let mut state = EngineState::new();
        state.push_int(7); // bystander below the call
        state.push_native(boom);
        state.push_int(42);
        let err = state.pcall(1, 0).unwrap_err();
        assert_eq!(err, EngineError::Runtime);
        assert_eq!(state.top(), 2);
        assert_eq!(state.to_int(1), Some(7));
        assert_eq!(
            state.str_bytes(2).as_deref(),
            Some(&b"expected failure"[..])
        );
    }

    #[test]
    fn test_pcall_nested() {
        fn outer(state: &mut EngineState) -> i32 {
            fn inner(state: &mut EngineState) -> i32 {
                state.raise_error("inner")
            }
            state.push_native(inner);
            let failed = state.pcall(0, 0).is_err();
            state.pop(1); // inner error object
            state.push_bool(failed);
            1
        }
        let mut state = EngineState::new();
        state.push_native(outer);
        assert!(state.pcall(0, 1).is_ok());
        assert_eq!(state.top(), 1);
        assert!(matches!(state.value(1), Value::Bool(true)));
    }

    #[test]
    fn test_get_field_follows_index_chain() {
        let mut state = EngineState::new();
        seq_table(&mut state, &[]); // the table being indexed
        seq_table(&mut state, &[]); // the fallback table
        state.push_int(5);
        state.push_int(50);
        state.raw_set_field(-3); // fallback[5] = 50

        // meta = { __index = fallback }
        state.create_table();
        state.push_value(Value::from_text("__index"));
        state.push_copy(2);
        state.raw_set_field(-3);
        state.set_metatable(1);
        state.pop(1); // fallback reference no longer needed

        state.push_int(5);
        state.get_field(1);
        assert_eq!(state.to_int(-1), Some(50));
    }

    #[test]
    fn test_set_field_calls_newindex_handler() {
        fn record(state: &mut EngineState) -> i32 {
            // handler(table, key, value): reads the key, stores nothing.
            // The point is that it runs instead of a raw store.
            let _ = state.to_int(-2);
            0
        }
        let mut state = EngineState::new();
        seq_table(&mut state, &[]);
        state.create_table();
        state.push_value(Value::from_text("__newindex"));
        state.push_native(record);
        state.raw_set_field(-3);
        state.set_metatable(1);

        state.push_int(1);
        state.push_int(99);
        state.set_field(1);
        let handle = state.to_table(1).unwrap();
        assert_eq!(handle.lock().entry_count(), 0);
    }

    #[test]
    fn test_length_prefers_len_metamethod() {
        fn fixed_len(state: &mut EngineState) -> i32 {
            state.push_int(77);
            1
        }
        let mut state = EngineState::new();
        seq_table(&mut state, &[1, 2, 3]);
        assert_eq!(state.length(1), 3);

        state.create_table();
        state.push_value(Value::from_text("__len"));
        state.push_native(fixed_len);
        state.raw_set_field(-3);
        state.set_metatable(1);
        assert_eq!(state.length(1), 77);
    }

    #[test]
    fn test_alloc_budget_raises_memory() {
        fn allocate(state: &mut EngineState) -> i32 {
            state.create_block(1 << 20);
            1
        }
        let mut state =
            EngineState::with_config(EngineConfig::default().with_alloc_budget(1024));
        state.push_native(allocate);
        assert_eq!(state.pcall(0, 1), Err(EngineError::Memory));
        assert_eq!(
            state.str_bytes(-1).as_deref(),
            Some(&b"not enough memory"[..])
        );
    }

    #[test]
    fn test_stack_limit_raises_overflow() {
        fn fill(state: &mut EngineState) -> i32 {
            loop {
                state.push_int(0);
            }
        }
        let mut state =
            EngineState::with_config(EngineConfig::default().with_stack_limit(32));
        state.push_native(fill);
        assert_eq!(state.pcall(0, 0), Err(EngineError::Runtime));
    }
}
