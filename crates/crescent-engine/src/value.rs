//! Runtime value representation
//!
//! Tagged values for the engine's single value stack:
//! - Nil, Bool, Int, Float: immediate values
//! - Str: heap-allocated byte string (`Arc<[u8]>`), immutable, may contain NULs
//! - Table, Thread, Block: shared handles (`Arc<Mutex<_>>`)
//! - Native / Closure: engine-callable functions (bare, or with upvalues)
//! - LightPtr: an address smuggled through the stack as a value; never a
//!   real host-visible object
//!
//! Every variant is `Send`: values travel inside the unwind payload of a
//! raise, so a non-`Send` variant would break the protected-call machinery.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::state::EngineState;
use crate::table::Table;

/// Byte-string payload. Engine strings are bytes, not UTF-8.
pub type EngineStr = Arc<[u8]>;

/// A bare native function callable by the engine.
///
/// The return value is the number of results left on top of the stack, or
/// [`MULTRET`](crate::MULTRET) to return the whole frame contents.
pub type NativeFn = fn(&mut EngineState) -> i32;

/// A native function bundled with captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub(crate) function: NativeFn,
    pub(crate) upvalues: Vec<Value>,
}

impl Closure {
    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }
}

/// Shared mutable table handle.
#[derive(Debug, Clone)]
pub struct TableHandle(Arc<Mutex<Table>>);

/// Shared handle to a secondary execution context.
#[derive(Debug, Clone)]
pub struct ThreadHandle(Arc<Mutex<ThreadCore>>);

/// Shared handle to a raw memory block.
#[derive(Debug, Clone)]
pub struct BlockHandle(Arc<Mutex<Vec<u8>>>);

/// Minimal state carried by a secondary execution context: its own value
/// stack. The shim only creates threads and hands back the handle; driving
/// one is the host's business.
#[derive(Debug, Default)]
pub struct ThreadCore {
    pub stack: Vec<Value>,
}

// No guard is ever held across a raise, so poisoning can only come from a
// host panic inside a callback; recover the inner data rather than
// cascading the panic.
fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TableHandle {
    pub fn new(table: Table) -> Self {
        TableHandle(Arc::new(Mutex::new(table)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Table> {
        relock(&self.0)
    }

    pub fn ptr_eq(&self, other: &TableHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl ThreadHandle {
    pub fn new() -> Self {
        ThreadHandle(Arc::new(Mutex::new(ThreadCore::default())))
    }

    pub fn lock(&self) -> MutexGuard<'_, ThreadCore> {
        relock(&self.0)
    }

    pub fn ptr_eq(&self, other: &ThreadHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for ThreadHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHandle {
    pub fn new(size: usize) -> Self {
        BlockHandle(Arc::new(Mutex::new(vec![0; size])))
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        relock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the block contents out.
    pub fn bytes(&self) -> Vec<u8> {
        relock(&self.0).clone()
    }

    /// Overwrite the block starting at `offset`. Out-of-range writes are
    /// truncated to the block size.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut block = relock(&self.0);
        let end = block.len();
        for (slot, byte) in block[offset.min(end)..].iter_mut().zip(data) {
            *slot = *byte;
        }
    }

    pub fn ptr_eq(&self, other: &BlockHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A tagged engine value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(EngineStr),
    Table(TableHandle),
    Native(NativeFn),
    Closure(Arc<Closure>),
    Thread(ThreadHandle),
    Block(BlockHandle),
    /// Address-carrying light value. Stored as `usize` so the enum stays
    /// `Send`; the bits are only meaningful to the code that pushed them.
    LightPtr(usize),
}

/// Type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Nil,
    Bool,
    Int,
    Float,
    Str,
    Table,
    Function,
    Thread,
    Block,
    LightPtr,
}

impl ValueKind {
    /// Human-readable name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Nil => "nil",
            ValueKind::Bool => "boolean",
            ValueKind::Int => "integer",
            ValueKind::Float => "float",
            ValueKind::Str => "string",
            ValueKind::Table => "table",
            ValueKind::Function => "function",
            ValueKind::Thread => "thread",
            ValueKind::Block => "block",
            ValueKind::LightPtr => "light pointer",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Table(_) => ValueKind::Table,
            Value::Native(_) | Value::Closure(_) => ValueKind::Function,
            Value::Thread(_) => ValueKind::Thread,
            Value::Block(_) => ValueKind::Block,
            Value::LightPtr(_) => ValueKind::LightPtr,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Build a string value from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Value {
        Value::Str(Arc::from(bytes))
    }

    /// Build a string value from UTF-8 text.
    pub fn from_text(text: &str) -> Value {
        Value::from_bytes(text.as_bytes())
    }
}

impl PartialEq for Value {
    /// Primitive equality: immediates by value, strings by bytes, heap
    /// objects by identity. Mirrors raw (metamethod-free) equality.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.ptr_eq(b),
            (Value::Native(a), Value::Native(b)) => *a as usize == *b as usize,
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => a.ptr_eq(b),
            (Value::Block(a), Value::Block(b)) => a.ptr_eq(b),
            (Value::LightPtr(a), Value::LightPtr(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(Value::Nil.kind().name(), "nil");
        assert_eq!(Value::from_text("x").kind().name(), "string");
        assert_eq!(Value::LightPtr(0xdead).kind().name(), "light pointer");
    }

    #[test]
    fn test_string_equality_is_by_bytes() {
        let a = Value::from_bytes(b"a\0b");
        let b = Value::from_bytes(b"a\0b");
        assert_eq!(a, b);
        assert_ne!(a, Value::from_bytes(b"a"));
    }

    #[test]
    fn test_table_equality_is_by_identity() {
        let t = TableHandle::new(Table::new());
        let a = Value::Table(t.clone());
        let b = Value::Table(t);
        let c = Value::Table(TableHandle::new(Table::new()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_block_write_and_read_back() {
        let block = BlockHandle::new(4);
        block.write(1, b"xy");
        assert_eq!(block.bytes(), vec![0, b'x', b'y', 0]);
    }
}
