//! Tables
//!
//! A table has two parts:
//! - an array part holding the values for keys `1..=n`
//! - an insertion-ordered hash part for everything else
//!
//! Clearing an entry never moves anything: array slots become nil and hash
//! entries become tombstones, so an ongoing `next` traversal keeps its
//! position. Tombstones are compacted when new keys are inserted. The array
//! part only grows; [`Table::len`] searches it for a border.

use std::hash::BuildHasherDefault;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHasher;

use crate::value::{float_to_integer, Value};
use crate::{VmError, VmResult};

type FxIndexMap<K, V> = IndexMap<K, V, BuildHasherDefault<FxHasher>>;

/// Normalized hash key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Object(usize),
    Light(usize),
}

impl TableKey {
    /// Build the key for `key`, normalizing integral floats to integers.
    /// Returns the normalized key value alongside.
    fn from_value(key: &Value) -> VmResult<(TableKey, Value)> {
        let k = match key {
            Value::Nil => return Err(VmError::runtime("table index is nil")),
            Value::Boolean(b) => TableKey::Bool(*b),
            Value::Integer(i) => TableKey::Int(*i),
            Value::Number(n) => {
                if n.is_nan() {
                    return Err(VmError::runtime("table index is NaN"));
                }
                if let Some(i) = float_to_integer(*n) {
                    return Ok((TableKey::Int(i), Value::Integer(i)));
                }
                TableKey::Float(n.to_bits())
            }
            Value::String(s) => TableKey::Str(s.clone()),
            Value::LightUserData(p) => TableKey::Light(*p),
            other => TableKey::Object(other.address().unwrap_or_default()),
        };
        Ok((k, key.clone()))
    }

    /// Lookup-only key: `None` for keys that can never be present
    fn lookup(key: &Value) -> Option<TableKey> {
        Self::from_value(key).ok().map(|(k, _)| k)
    }
}

/// Table storage
#[derive(Default)]
pub struct Table {
    array: Vec<Value>,
    hash: FxIndexMap<TableKey, (Value, Value)>,
    tombstones: usize,
    metatable: Option<TableHandle>,
}

impl Table {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with preallocated parts
    pub fn with_capacity(narr: usize, nrec: usize) -> Self {
        Self {
            array: Vec::with_capacity(narr),
            hash: FxIndexMap::with_capacity_and_hasher(nrec, Default::default()),
            tombstones: 0,
            metatable: None,
        }
    }

    /// Raw read
    pub fn get(&self, key: &Value) -> Value {
        match TableKey::lookup(key) {
            Some(TableKey::Int(i)) => self.get_int(i),
            Some(k) => self
                .hash
                .get(&k)
                .map(|(_, v)| v.clone())
                .unwrap_or_default(),
            None => Value::Nil,
        }
    }

    /// Raw read of an integer key
    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && (i as u64) <= self.array.len() as u64 {
            return self.array[(i - 1) as usize].clone();
        }
        self.hash
            .get(&TableKey::Int(i))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Raw read of a string key
    pub fn get_str(&self, key: &str) -> Value {
        self.hash
            .get(&TableKey::Str(Arc::from(key)))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    /// Raw write
    ///
    /// # Errors
    ///
    /// Fails for nil and NaN keys.
    pub fn set(&mut self, key: Value, value: Value) -> VmResult<()> {
        let (k, key) = TableKey::from_value(&key)?;
        if let TableKey::Int(i) = k {
            let len = self.array.len() as u64;
            if i >= 1 && (i as u64) <= len {
                self.array[(i - 1) as usize] = value;
                return Ok(());
            }
            if i >= 1 && i as u64 == len + 1 && !value.is_nil() {
                self.array.push(value);
                if let Some(entry) = self.hash.get_mut(&k) {
                    if !entry.1.is_nil() {
                        self.tombstones += 1;
                    }
                    entry.1 = Value::Nil;
                }
                self.migrate_from_hash();
                return Ok(());
            }
        }
        self.set_hash(k, key, value);
        Ok(())
    }

    fn set_hash(&mut self, k: TableKey, key: Value, value: Value) {
        if let Some(entry) = self.hash.get_mut(&k) {
            match (entry.1.is_nil(), value.is_nil()) {
                (false, true) => self.tombstones += 1,
                (true, false) => self.tombstones = self.tombstones.saturating_sub(1),
                _ => {}
            }
            entry.1 = value;
            return;
        }
        if value.is_nil() {
            return;
        }
        if self.tombstones > 0 && self.tombstones * 2 > self.hash.len() {
            self.hash.retain(|_, (_, v)| !v.is_nil());
            self.tombstones = 0;
        }
        self.hash.insert(k, (key, value));
    }

    fn migrate_from_hash(&mut self) {
        loop {
            let k = TableKey::Int(self.array.len() as i64 + 1);
            match self.hash.get(&k) {
                Some((_, v)) if !v.is_nil() => {}
                _ => break,
            }
            if let Some((_, v)) = self.hash.shift_remove(&k) {
                self.array.push(v);
            }
        }
    }

    /// A border of the table: `t[n]` is non-nil and `t[n + 1]` is nil (or
    /// `n` is 0 and `t[1]` is nil)
    pub fn len(&self) -> usize {
        match self.array.last() {
            None => 0,
            Some(v) if !v.is_nil() => self.array.len(),
            Some(_) => {
                // binary search for a border inside the array part
                let (mut lo, mut hi) = (0usize, self.array.len());
                while hi - lo > 1 {
                    let mid = (lo + hi) / 2;
                    if self.array[mid - 1].is_nil() {
                        hi = mid;
                    } else {
                        lo = mid;
                    }
                }
                lo
            }
        }
    }

    /// Whether the table has no non-nil entries
    pub fn is_empty(&self) -> bool {
        self.array.iter().all(Value::is_nil) && self.hash.values().all(|(_, v)| v.is_nil())
    }

    /// Traversal step: the entry after `key` (nil starts the traversal)
    ///
    /// # Errors
    ///
    /// Fails when `key` is not present in the table.
    pub fn next(&self, key: &Value) -> VmResult<Option<(Value, Value)>> {
        let start_hash = match key {
            Value::Nil => {
                if let Some(entry) = self.array_entry_from(0) {
                    return Ok(Some(entry));
                }
                0
            }
            _ => {
                let k = TableKey::lookup(key)
                    .ok_or_else(|| VmError::runtime("invalid key to 'next'"))?;
                match k {
                    TableKey::Int(i) if i >= 1 && (i as u64) <= self.array.len() as u64 => {
                        if let Some(entry) = self.array_entry_from(i as usize) {
                            return Ok(Some(entry));
                        }
                        0
                    }
                    k => match self.hash.get_index_of(&k) {
                        Some(pos) => pos + 1,
                        None => return Err(VmError::runtime("invalid key to 'next'")),
                    },
                }
            }
        };
        for pos in start_hash..self.hash.len() {
            if let Some((_, (k, v))) = self.hash.get_index(pos) {
                if !v.is_nil() {
                    return Ok(Some((k.clone(), v.clone())));
                }
            }
        }
        Ok(None)
    }

    /// First non-nil array entry at or after the 0-based position `from`
    fn array_entry_from(&self, from: usize) -> Option<(Value, Value)> {
        self.array
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Integer(i as i64 + 1), v.clone()))
    }

    /// Metatable, if any
    pub fn metatable(&self) -> Option<TableHandle> {
        self.metatable.clone()
    }

    /// Replace the metatable
    pub fn set_metatable(&mut self, mt: Option<TableHandle>) {
        self.metatable = mt;
    }
}

/// Shared, lockable table
///
/// The lock is only ever held for one primitive table operation.
#[derive(Clone, Default)]
pub struct TableHandle(Arc<Mutex<Table>>);

impl TableHandle {
    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing storage
    pub fn from_table(table: Table) -> Self {
        Self(Arc::new(Mutex::new(table)))
    }

    /// Lock the storage
    pub fn lock(&self) -> MutexGuard<'_, Table> {
        self.0.lock()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &TableHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address used for identity hashing and display
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Raw read
    pub fn get(&self, key: &Value) -> Value {
        self.0.lock().get(key)
    }

    /// Raw read of a string key
    pub fn get_str(&self, key: &str) -> Value {
        self.0.lock().get_str(key)
    }

    /// Raw write
    pub fn set(&self, key: Value, value: Value) -> VmResult<()> {
        self.0.lock().set(key, value)
    }

    /// Border
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether empty
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Metatable
    pub fn metatable(&self) -> Option<TableHandle> {
        self.0.lock().metatable()
    }
}
