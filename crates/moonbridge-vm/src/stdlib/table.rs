//! Table library

use crate::state::VmState;
use crate::stdlib::{arg_error, check_any, check_integer, check_table, opt_integer, LibFn};
use crate::table::TableHandle;
use crate::value::{Value, ValueType};
use crate::{VmError, VmResult};

pub(super) const FUNCTIONS: &[(&str, LibFn)] = &[
    ("concat", concat),
    ("insert", insert),
    ("remove", remove),
    ("sort", sort),
    ("move", move_),
    ("unpack", unpack),
    ("pack", pack),
];

fn geti(vm: &VmState, t: &Value, i: i64) -> VmResult<Value> {
    vm.index_value(t, &Value::Integer(i))
}

fn seti(vm: &VmState, t: &Value, i: i64, v: Value) -> VmResult<()> {
    vm.new_index_value(t, Value::Integer(i), v)
}

fn concat(vm: &VmState) -> VmResult<usize> {
    let t = Value::Table(check_table(vm, 1, "concat")?);
    let sep = match vm.type_at(2) {
        ValueType::None | ValueType::Nil => String::new(),
        _ => match vm.to_str(2) {
            Some(s) => s.to_string(),
            None => return Err(arg_error(2, "concat", "string expected")),
        },
    };
    let first = opt_integer(vm, 3, "concat", 1)?;
    let last = match vm.type_at(4) {
        ValueType::None | ValueType::Nil => vm.raw_len(1) as i64,
        _ => check_integer(vm, 4, "concat")?,
    };

    let mut out = String::new();
    let mut i = first;
    while i <= last {
        let v = geti(vm, &t, i)?;
        match v {
            Value::String(_) | Value::Integer(_) | Value::Number(_) => {
                if let Some(s) = v.as_str() {
                    out.push_str(&s);
                }
            }
            other => {
                return Err(VmError::runtime(format!(
                    "invalid value (at index {}) in table for 'concat', got {}",
                    i,
                    other.type_of()
                )))
            }
        }
        if i < last {
            out.push_str(&sep);
        }
        i += 1;
    }
    vm.push_string(&out)?;
    Ok(1)
}

fn insert(vm: &VmState) -> VmResult<usize> {
    let t = Value::Table(check_table(vm, 1, "insert")?);
    let e = vm.raw_len(1) as i64 + 1;
    match vm.get_top() {
        2 => {
            let v = vm.value_at(2);
            seti(vm, &t, e, v)?;
        }
        3 => {
            let pos = check_integer(vm, 2, "insert")?;
            if pos < 1 || pos > e {
                return Err(arg_error(2, "insert", "position out of bounds"));
            }
            let mut i = e;
            while i > pos {
                let prev = geti(vm, &t, i - 1)?;
                seti(vm, &t, i, prev)?;
                i -= 1;
            }
            let v = vm.value_at(3);
            seti(vm, &t, pos, v)?;
        }
        _ => return Err(VmError::runtime("wrong number of arguments to 'insert'")),
    }
    Ok(0)
}

fn remove(vm: &VmState) -> VmResult<usize> {
    let t = Value::Table(check_table(vm, 1, "remove")?);
    let size = vm.raw_len(1) as i64;
    let mut pos = opt_integer(vm, 2, "remove", size)?;
    if vm.type_at(2) != ValueType::None && pos != size && (pos < 1 || pos > size + 1) {
        return Err(arg_error(2, "remove", "position out of bounds"));
    }
    let removed = geti(vm, &t, pos)?;
    while pos < size {
        let next = geti(vm, &t, pos + 1)?;
        seti(vm, &t, pos, next)?;
        pos += 1;
    }
    seti(vm, &t, pos, Value::Nil)?;
    vm.push_value(removed)?;
    Ok(1)
}

fn sort(vm: &VmState) -> VmResult<usize> {
    let handle = check_table(vm, 1, "sort")?;
    let t = Value::Table(handle);
    let n = vm.raw_len(1) as i64;
    let comparator = match vm.type_at(2) {
        ValueType::None | ValueType::Nil => None,
        ValueType::Function => Some(vm.value_at(2)),
        _ => return Err(arg_error(2, "sort", "function expected")),
    };

    let mut items = Vec::with_capacity(n.max(0) as usize);
    for i in 1..=n {
        items.push(geti(vm, &t, i)?);
    }

    let mut less = |a: &Value, b: &Value| -> VmResult<bool> {
        match &comparator {
            Some(f) => {
                let mut r = vm.call_value(f.clone(), &[a.clone(), b.clone()], 1)?;
                Ok(r.pop().map(|v| v.is_truthy()).unwrap_or(false))
            }
            None => vm.less_than(a, b),
        }
    };
    let sorted = merge_sort(items, &mut less)?;

    for (i, v) in sorted.into_iter().enumerate() {
        seti(vm, &t, i as i64 + 1, v)?;
    }
    Ok(0)
}

/// Stable merge sort with a fallible comparator
fn merge_sort(
    mut items: Vec<Value>,
    less: &mut dyn FnMut(&Value, &Value) -> VmResult<bool>,
) -> VmResult<Vec<Value>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, less)?;
    let right = merge_sort(right, less)?;

    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => less(r, l)?,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        out.extend(next);
    }
    Ok(out)
}

fn move_(vm: &VmState) -> VmResult<usize> {
    let a1 = Value::Table(check_table(vm, 1, "move")?);
    let f = check_integer(vm, 2, "move")?;
    let e = check_integer(vm, 3, "move")?;
    let t = check_integer(vm, 4, "move")?;
    let dest_index = match vm.type_at(5) {
        ValueType::None | ValueType::Nil => 1,
        _ => {
            check_table(vm, 5, "move")?;
            5
        }
    };
    let a2 = vm.value_at(dest_index);

    if e >= f {
        if !(f > 0 || e < i64::MAX + f) {
            return Err(arg_error(3, "move", "too many elements to move"));
        }
        let n = e - f;
        if t > i64::MAX - n {
            return Err(arg_error(4, "move", "destination wrap around"));
        }
        let forward = t > e || t <= f || (dest_index != 1 && !a1.raw_equals(&a2));
        if forward {
            for i in 0..=n {
                let v = geti(vm, &a1, f + i)?;
                seti(vm, &a2, t + i, v)?;
            }
        } else {
            for i in (0..=n).rev() {
                let v = geti(vm, &a1, f + i)?;
                seti(vm, &a2, t + i, v)?;
            }
        }
    }
    vm.push_value(a2)?;
    Ok(1)
}

fn unpack(vm: &VmState) -> VmResult<usize> {
    let t = check_any(vm, 1, "unpack")?;
    let first = opt_integer(vm, 2, "unpack", 1)?;
    let last = match vm.type_at(3) {
        ValueType::None | ValueType::Nil => vm.raw_len(1) as i64,
        _ => check_integer(vm, 3, "unpack")?,
    };
    if first > last {
        return Ok(0);
    }
    let n = (last as i128 - first as i128 + 1) as u128;
    if n >= i32::MAX as u128 || !vm.check_stack(n as usize) {
        return Err(VmError::runtime("too many results to unpack"));
    }
    for i in first..=last {
        let v = geti(vm, &t, i)?;
        vm.push_value(v)?;
    }
    Ok(n as usize)
}

fn pack(vm: &VmState) -> VmResult<usize> {
    let n = vm.get_top();
    let table = TableHandle::new();
    for i in 1..=n {
        table.set(Value::Integer(i as i64), vm.value_at(i))?;
    }
    table.set(Value::string("n"), Value::Integer(n as i64))?;
    vm.push_value(Value::Table(table))?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sort_stable() {
        let items = vec![
            Value::Integer(3),
            Value::Integer(1),
            Value::Integer(2),
            Value::Integer(1),
        ];
        let mut less = |a: &Value, b: &Value| -> VmResult<bool> {
            Ok(a.as_integer().unwrap_or(0) < b.as_integer().unwrap_or(0))
        };
        let sorted = merge_sort(items, &mut less).unwrap();
        let ints: Vec<i64> = sorted.iter().filter_map(Value::as_integer).collect();
        assert_eq!(ints, vec![1, 1, 2, 3]);
    }

    #[test]
    fn test_merge_sort_propagates_errors() {
        let items = vec![Value::Integer(1), Value::Boolean(true)];
        let mut less = |_: &Value, _: &Value| -> VmResult<bool> { Err(VmError::runtime("no")) };
        assert!(merge_sort(items, &mut less).is_err());
    }
}
