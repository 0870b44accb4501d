//! Table storage
//!
//! Ordered associative container backing the engine's table values.
//! A `BTreeMap` keyed by a total-ordered key type gives `next_entry` a
//! deterministic successor relation without any auxiliary iterator state,
//! which is exactly what one-step iteration needs.
//!
//! Raw accessors here never raise; metamethod dispatch lives in the
//! engine state, not in the storage layer.

use std::collections::BTreeMap;
use std::ops::Bound;

use ordered_float::OrderedFloat;
use thiserror::Error;

use crate::value::{EngineStr, TableHandle, Value, ValueKind};

/// Metamethod slot names.
pub const META_INDEX: &[u8] = b"__index";
pub const META_NEWINDEX: &[u8] = b"__newindex";
pub const META_LEN: &[u8] = b"__len";
pub const META_TOSTRING: &[u8] = b"__tostring";

/// A table key. Restricted to primitives with a total order; float keys
/// with an integral value normalize to `Int` so `t[2.0]` and `t[2]` agree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableKey {
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
    Str(EngineStr),
}

/// Why a value cannot serve as a table key.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    #[error("table index is nil")]
    Nil,
    #[error("table index is NaN")]
    NaN,
    #[error("unsupported table key type: {0}")]
    Unsupported(ValueKind),
}

impl TableKey {
    pub fn try_from_value(value: &Value) -> Result<TableKey, KeyError> {
        match value {
            Value::Nil => Err(KeyError::Nil),
            Value::Bool(b) => Ok(TableKey::Bool(*b)),
            Value::Int(i) => Ok(TableKey::Int(*i)),
            Value::Float(f) if f.is_nan() => Err(KeyError::NaN),
            // Strict upper bound: `i64::MAX as f64` rounds up to 2^63,
            // which is out of range and must stay a float key.
            Value::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
                Ok(TableKey::Int(*f as i64))
            }
            Value::Float(f) => Ok(TableKey::Float(OrderedFloat(*f))),
            Value::Str(s) => Ok(TableKey::Str(s.clone())),
            other => Err(KeyError::Unsupported(other.kind())),
        }
    }
}

impl From<&TableKey> for Value {
    fn from(key: &TableKey) -> Value {
        match key {
            TableKey::Bool(b) => Value::Bool(*b),
            TableKey::Int(i) => Value::Int(*i),
            TableKey::Float(f) => Value::Float(f.into_inner()),
            TableKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

/// Table storage: entries plus an optional metatable.
#[derive(Debug, Default)]
pub struct Table {
    entries: BTreeMap<TableKey, Value>,
    metatable: Option<TableHandle>,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    /// Raw read. Missing keys read as nil.
    pub fn get(&self, key: &TableKey) -> Value {
        self.entries.get(key).cloned().unwrap_or(Value::Nil)
    }

    /// Raw write. Assigning nil deletes the entry.
    pub fn set(&mut self, key: TableKey, value: Value) {
        if value.is_nil() {
            self.entries.remove(&key);
        } else {
            self.entries.insert(key, value);
        }
    }

    pub fn contains(&self, key: &TableKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored entries, independent of key shape.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Sequence length: the largest `n` such that keys `1..=n` are all
    /// present. Holes stop the scan, so `{1, 2, 4}` has length 2.
    pub fn sequence_len(&self) -> i64 {
        let mut n = 0i64;
        while self.contains(&TableKey::Int(n + 1)) {
            n += 1;
        }
        n
    }

    /// Successor of `prev` in key order; `None` for the first entry when
    /// `prev` is `None`, and `None` again once the table is exhausted.
    pub fn next_after(&self, prev: Option<&TableKey>) -> Option<(TableKey, Value)> {
        let mut range = match prev {
            None => self.entries.range::<TableKey, _>(..),
            Some(key) => self
                .entries
                .range((Bound::Excluded(key.clone()), Bound::Unbounded)),
        };
        range.next().map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn metatable(&self) -> Option<TableHandle> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, metatable: Option<TableHandle>) {
        self.metatable = metatable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nil_assignment_deletes() {
        let mut t = Table::new();
        t.set(TableKey::Int(1), Value::Int(10));
        assert_eq!(t.entry_count(), 1);
        t.set(TableKey::Int(1), Value::Nil);
        assert_eq!(t.entry_count(), 0);
        assert_eq!(t.get(&TableKey::Int(1)), Value::Nil);
    }

    #[test]
    fn test_sequence_len_stops_at_hole() {
        let mut t = Table::new();
        for i in [1i64, 2, 4] {
            t.set(TableKey::Int(i), Value::Int(i));
        }
        assert_eq!(t.sequence_len(), 2);
    }

    #[test]
    fn test_float_key_normalizes_to_int() {
        let mut t = Table::new();
        t.set(TableKey::try_from_value(&Value::Float(2.0)).unwrap(), Value::Bool(true));
        assert_eq!(t.get(&TableKey::Int(2)), Value::Bool(true));
    }

    #[test]
    fn test_out_of_range_integral_float_key_stays_float() {
        // 2^63 is integral but exceeds i64; saturating it would alias
        // the float key with the integer key i64::MAX.
        let key = TableKey::try_from_value(&Value::Float(9_223_372_036_854_775_808.0)).unwrap();
        assert!(matches!(key, TableKey::Float(_)));

        let mut t = Table::new();
        t.set(TableKey::Int(i64::MAX), Value::Int(1));
        t.set(key.clone(), Value::Int(2));
        assert_eq!(t.entry_count(), 2);
        assert_eq!(t.get(&TableKey::Int(i64::MAX)), Value::Int(1));
        assert_eq!(t.get(&key), Value::Int(2));
    }

    #[test]
    fn test_nan_and_nil_keys_rejected() {
        assert_eq!(
            TableKey::try_from_value(&Value::Float(f64::NAN)),
            Err(KeyError::NaN)
        );
        assert_eq!(TableKey::try_from_value(&Value::Nil), Err(KeyError::Nil));
    }

    #[test]
    fn test_next_after_walks_every_entry_once() {
        let mut t = Table::new();
        t.set(TableKey::Int(3), Value::Int(30));
        t.set(TableKey::Str(EngineStr::from(&b"k"[..])), Value::Int(40));
        t.set(TableKey::Int(1), Value::Int(10));

        let mut seen = Vec::new();
        let mut prev = None;
        while let Some((k, _)) = t.next_after(prev.as_ref()) {
            seen.push(k.clone());
            prev = Some(k);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(t.next_after(prev.as_ref()), None);
    }
}
