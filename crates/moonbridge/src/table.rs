//! Table proxies
//!
//! A [`TableRef`] is a host handle to a VM table. Plain accessors honor the
//! table's metatable, the `raw_*` variants bypass it. Bulk operations run
//! the VM's own `table` library functions in protected mode.
//!
//! Once the VM is closed (or the handle disposed) reads return nil or empty
//! snapshots, writes are ignored and `len()` is 0.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use moonbridge_vm::{ValueType, VmState};

use crate::error::{Error, Result};
use crate::function::FunctionRef;
use crate::reference::{RefKind, Reference};
use crate::translator::Translator;
use crate::value::{HostValue, IntoHost};

/// Handle to a table living in the VM
#[derive(Clone, PartialEq)]
pub struct TableRef(Reference);

impl TableRef {
    pub(crate) fn from_reference(reference: Reference) -> Self {
        TableRef(reference)
    }

    /// Underlying reference
    pub fn reference(&self) -> &Reference {
        &self.0
    }

    /// Whether the table can still be reached
    pub fn is_available(&self) -> bool {
        self.0.is_available()
    }

    /// Release the table now
    pub fn dispose(&self) {
        self.0.dispose()
    }

    /// The VM's string form of the table
    pub fn to_display_string(&self) -> String {
        self.0.to_display_string()
    }

    /// Run `f` with the table pushed, or return `default` when unavailable
    fn with_table<R>(
        &self,
        default: R,
        f: impl FnOnce(&Arc<Translator>, &VmState, i32) -> Result<R>,
    ) -> Result<R> {
        let translator = self.0.translator();
        self.0
            .with_pushed(|vm, index| f(translator, vm, index))
            .unwrap_or(Ok(default))
    }

    // ========================================================================
    // Field access
    // ========================================================================

    /// `t[key]`, honoring `__index`
    pub fn get(&self, key: impl IntoHost) -> Result<HostValue> {
        let key = key.into_host();
        self.with_table(HostValue::Nil, |t, vm, index| {
            t.push(vm, &key)?;
            vm.get_table(index)?;
            t.get(vm, -1)
        })
    }

    /// `t[key] = value`, honoring `__newindex`
    pub fn set(&self, key: impl IntoHost, value: impl IntoHost) -> Result<()> {
        let (key, value) = (key.into_host(), value.into_host());
        self.with_table((), |t, vm, index| {
            t.push(vm, &key)?;
            t.push(vm, &value)?;
            vm.set_table(index)?;
            Ok(())
        })
    }

    /// `t[key]` without metamethods
    pub fn raw_get(&self, key: impl IntoHost) -> Result<HostValue> {
        let key = key.into_host();
        self.with_table(HostValue::Nil, |t, vm, index| {
            t.push(vm, &key)?;
            vm.raw_get(index)?;
            t.get(vm, -1)
        })
    }

    /// `t[key] = value` without metamethods
    pub fn raw_set(&self, key: impl IntoHost, value: impl IntoHost) -> Result<()> {
        let (key, value) = (key.into_host(), value.into_host());
        self.with_table((), |t, vm, index| {
            t.push(vm, &key)?;
            t.push(vm, &value)?;
            vm.raw_set(index)?;
            Ok(())
        })
    }

    /// Nested lookup of a dotted path such as `"a.b.c"`
    ///
    /// `\.` stands for a literal dot inside a key. A missing intermediate
    /// table yields nil.
    pub fn get_path(&self, path: &str) -> Result<HostValue> {
        let segments = split_path(path);
        self.with_table(HostValue::Nil, |t, vm, index| {
            vm.push_copy(index)?;
            navigate(vm, &segments)?;
            t.get(vm, -1)
        })
    }

    /// Nested assignment of a dotted path
    ///
    /// Does nothing when an intermediate table is missing.
    pub fn set_path(&self, path: &str, value: impl IntoHost) -> Result<()> {
        let value = value.into_host();
        let mut segments = split_path(path);
        let Some(last) = segments.pop() else {
            return Ok(());
        };
        self.with_table((), |t, vm, index| {
            vm.push_copy(index)?;
            navigate(vm, &segments)?;
            if vm.type_at(-1) == ValueType::Nil {
                tracing::debug!(path, "missing intermediate table, assignment skipped");
                return Ok(());
            }
            t.push(vm, &value)?;
            vm.set_field(-2, &last)?;
            Ok(())
        })
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Every key/value pair in traversal order
    pub fn pairs(&self) -> Result<Vec<(HostValue, HostValue)>> {
        self.with_table(Vec::new(), |t, vm, index| {
            let mut out = Vec::new();
            vm.push_nil()?;
            while vm.next(index)? {
                let key = t.get(vm, -2)?;
                let value = t.get(vm, -1)?;
                out.push((key, value));
                vm.pop(1);
            }
            Ok(out)
        })
    }

    /// Iterator over a snapshot of the pairs
    pub fn iter(&self) -> Result<std::vec::IntoIter<(HostValue, HostValue)>> {
        Ok(self.pairs()?.into_iter())
    }

    /// Every key
    pub fn keys(&self) -> Result<Vec<HostValue>> {
        Ok(self.pairs()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Every value
    pub fn values(&self) -> Result<Vec<HostValue>> {
        Ok(self.pairs()?.into_iter().map(|(_, v)| v).collect())
    }

    /// Pairs keyed by the string form of string and number keys
    ///
    /// Entries with other key types are skipped. Keys with the same string
    /// form collide: `1` and `"1"` share one entry and the later pair in
    /// traversal order wins.
    pub fn to_map(&self) -> Result<IndexMap<String, HostValue>> {
        let mut map = IndexMap::new();
        for (key, value) in self.pairs()? {
            match key {
                HostValue::String(s) => {
                    map.insert(s, value);
                }
                k @ (HostValue::Int(_) | HostValue::Float(_)) => {
                    map.insert(k.to_string(), value);
                }
                _ => {}
            }
        }
        Ok(map)
    }

    /// Values `t[1]..t[#t]`
    pub fn to_list(&self) -> Result<Vec<HostValue>> {
        self.with_table(Vec::new(), |t, vm, index| {
            let n = vm.raw_len(index) as i64;
            let mut out = Vec::with_capacity(n as usize);
            for i in 1..=n {
                vm.raw_get_i(index, i)?;
                out.push(t.get(vm, -1)?);
                vm.pop(1);
            }
            Ok(out)
        })
    }

    /// Raw length (a border of the array part)
    pub fn len(&self) -> usize {
        self.with_table(0, |_, vm, index| Ok(vm.raw_len(index)))
            .unwrap_or(0)
    }

    /// Whether [`TableRef::len`] is 0
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of the first `t[i] == value` for `i` from `init` (default 1)
    ///
    /// The search stops at the first nil.
    pub fn find(&self, value: impl IntoHost, init: Option<i64>) -> Result<Option<i64>> {
        let value = value.into_host();
        self.with_table(None, |t, vm, index| {
            t.push(vm, &value)?;
            let needle = vm.get_top();
            let mut i = init.unwrap_or(1);
            loop {
                if vm.raw_get_i(index, i)? == ValueType::Nil {
                    return Ok(None);
                }
                let hit = vm.raw_equal(-1, needle);
                vm.pop(1);
                if hit {
                    return Ok(Some(i));
                }
                i += 1;
            }
        })
    }

    /// Assign nil to every key of a snapshot
    ///
    /// Assignments go through [`set`](Self::set), so metamethods see them;
    /// the metatable itself is kept.
    pub fn clear(&self) -> Result<()> {
        for key in self.keys()? {
            self.set(key, HostValue::Nil)?;
        }
        Ok(())
    }

    /// Call `f` for every pair of a snapshot
    pub fn foreach(&self, mut f: impl FnMut(&HostValue, &HostValue) -> Result<()>) -> Result<()> {
        for (k, v) in self.pairs()? {
            f(&k, &v)?;
        }
        Ok(())
    }

    /// Call `f` for every element of the array part
    pub fn foreachi(&self, mut f: impl FnMut(i64, &HostValue) -> Result<()>) -> Result<()> {
        for (i, v) in self.to_list()?.iter().enumerate() {
            f(i as i64 + 1, v)?;
        }
        Ok(())
    }

    // ========================================================================
    // Metatables
    // ========================================================================

    /// The table's metatable
    pub fn metatable(&self) -> Result<Option<TableRef>> {
        self.with_table(None, |t, vm, index| {
            if !vm.get_metatable(index)? {
                return Ok(None);
            }
            Ok(Some(TableRef(t.acquire(vm, -1, RefKind::Table)?)))
        })
    }

    /// Replace (or with `None`, remove) the metatable
    pub fn set_metatable(&self, metatable: Option<&TableRef>) -> Result<()> {
        self.with_table((), |_, vm, index| {
            match metatable {
                Some(mt) => mt.0.push(vm)?,
                None => vm.push_nil()?,
            }
            vm.set_metatable(index)?;
            Ok(())
        })
    }

    // ========================================================================
    // Table library
    // ========================================================================

    /// Run `table.<name>(t, args...)`; `None` when unavailable
    fn call_lib(&self, name: &str, args: &[HostValue]) -> Option<Result<Vec<HostValue>>> {
        if self.0.is_disposed() {
            return None;
        }
        let translator = self.0.translator();
        translator.with_vm(|vm| {
            translator.protected_call(vm, |vm| {
                push_library_function(vm, "table", name)?;
                self.0.push(vm)?;
                translator.push_args(vm, args)?;
                Ok(args.len() + 1)
            })
        })
    }

    /// `table.concat(t, sep, i, j)`
    pub fn concat(&self, sep: &str, i: Option<i64>, j: Option<i64>) -> Result<String> {
        let args = [
            HostValue::String(sep.to_string()),
            i.into_host(),
            j.into_host(),
        ];
        match self.call_lib("concat", &args) {
            Some(results) => Ok(results?
                .into_iter()
                .next()
                .map(|v| v.to_string())
                .unwrap_or_default()),
            None => Ok(String::new()),
        }
    }

    /// `table.insert(t, value)`: append
    pub fn insert(&self, value: impl IntoHost) -> Result<()> {
        self.call_lib("insert", &[value.into_host()])
            .transpose()
            .map(|_| ())
    }

    /// `table.insert(t, pos, value)`: shift up and insert at `pos`
    pub fn insert_at(&self, pos: i64, value: impl IntoHost) -> Result<()> {
        self.call_lib("insert", &[HostValue::Int(pos), value.into_host()])
            .transpose()
            .map(|_| ())
    }

    /// `table.remove(t)`: remove and return the last element
    pub fn remove(&self) -> Result<HostValue> {
        first_result(self.call_lib("remove", &[]))
    }

    /// `table.remove(t, pos)`: remove at `pos`, shifting down
    pub fn remove_at(&self, pos: i64) -> Result<HostValue> {
        first_result(self.call_lib("remove", &[HostValue::Int(pos)]))
    }

    /// `table.sort(t)` with the VM's `<`
    pub fn sort(&self) -> Result<()> {
        self.call_lib("sort", &[]).transpose().map(|_| ())
    }

    /// `table.sort(t, comparator)`
    pub fn sort_by(&self, comparator: &FunctionRef) -> Result<()> {
        self.call_lib("sort", &[HostValue::Function(comparator.clone())])
            .transpose()
            .map(|_| ())
    }

    /// `table.move(t, f, e, t2 [, dest])`
    ///
    /// Copies `t[f..=e]` to `dest[t2..]` (or into this table).
    pub fn move_range(&self, f: i64, e: i64, t: i64, dest: Option<&TableRef>) -> Result<()> {
        let mut args = vec![HostValue::Int(f), HostValue::Int(e), HostValue::Int(t)];
        if let Some(dest) = dest {
            args.push(HostValue::Table(dest.clone()));
        }
        self.call_lib("move", &args).transpose().map(|_| ())
    }

    /// `table.unpack(t, i, j)`
    pub fn unpack(&self, i: Option<i64>, j: Option<i64>) -> Result<Vec<HostValue>> {
        self.call_lib("unpack", &[i.into_host(), j.into_host()])
            .unwrap_or(Ok(Vec::new()))
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableRef({})", self.0.slot())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

fn first_result(results: Option<Result<Vec<HostValue>>>) -> Result<HostValue> {
    match results {
        Some(r) => Ok(r?.into_iter().next().unwrap_or_default()),
        None => Ok(HostValue::Nil),
    }
}

/// Push `module.name` from the globals
pub(crate) fn push_library_function(vm: &VmState, module: &str, name: &str) -> Result<()> {
    if vm.get_global(module)? != ValueType::Table {
        vm.pop(1);
        return Err(Error::runtime(format!("the '{}' library is not loaded", module)));
    }
    vm.get_field(-1, name)?;
    vm.remove(-2);
    if vm.type_at(-1) != ValueType::Function {
        vm.pop(1);
        return Err(Error::runtime(format!("'{}.{}' is not a function", module, name)));
    }
    Ok(())
}

/// Split a dotted path; `\.` escapes a literal dot
pub(crate) fn split_path(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);
    parts
}

/// Replace the value on top of the stack by its nested field at `segments`
///
/// Stops at the first nil, leaving nil on top.
pub(crate) fn navigate(vm: &VmState, segments: &[String]) -> Result<()> {
    for segment in segments {
        if vm.type_at(-1) == ValueType::Nil {
            return Ok(());
        }
        vm.get_field(-1, segment)?;
        vm.remove(-2);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a.b.c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("plain"), vec!["plain"]);
        assert_eq!(split_path(r"a\.b.c"), vec!["a.b", "c"]);
        assert_eq!(split_path(r"x\y"), vec![r"x\y"]);
    }

    #[test]
    fn test_navigate_stops_at_nil() {
        let vm = VmState::new();
        vm.new_table().unwrap();
        vm.new_table().unwrap();
        vm.push_integer(3).unwrap();
        vm.set_field(-2, "c").unwrap();
        vm.set_field(-2, "b").unwrap();

        vm.push_copy(-1).unwrap();
        navigate(&vm, &["b".to_string(), "c".to_string()]).unwrap();
        assert_eq!(vm.to_integer(-1), Some(3));
        vm.pop(1);

        vm.push_copy(-1).unwrap();
        navigate(&vm, &["x".to_string(), "y".to_string()]).unwrap();
        assert_eq!(vm.type_at(-1), ValueType::Nil);
    }
}
