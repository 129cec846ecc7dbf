//! Base library

use crate::function::Function;
use crate::state::{metatable_of, VmState, MULTRET};
use crate::stdlib::{arg_error, check_any, check_integer, check_table, type_error, LibFn};
use crate::value::{parse_number, Value, ValueType};
use crate::{VmError, VmResult};

const FUNCTIONS: &[(&str, LibFn)] = &[
    ("print", print),
    ("type", type_),
    ("tostring", tostring),
    ("tonumber", tonumber),
    ("rawequal", rawequal),
    ("rawget", rawget),
    ("rawset", rawset),
    ("rawlen", rawlen),
    ("setmetatable", setmetatable),
    ("getmetatable", getmetatable),
    ("next", next),
    ("pairs", pairs),
    ("ipairs", ipairs),
    ("select", select),
    ("error", error),
    ("assert", assert),
    ("pcall", pcall),
    ("xpcall", xpcall),
];

pub(super) fn open(vm: &VmState) -> VmResult<()> {
    for (name, f) in FUNCTIONS {
        vm.push_function(Function::named(name, *f))?;
        vm.set_global(name)?;
    }
    vm.push_globals()?;
    vm.set_global("_G")
}

fn print(vm: &VmState) -> VmResult<usize> {
    let n = vm.get_top();
    let mut parts = Vec::with_capacity(n as usize);
    for i in 1..=n {
        parts.push(vm.to_display_string(i)?);
    }
    println!("{}", parts.join("\t"));
    Ok(0)
}

fn type_(vm: &VmState) -> VmResult<usize> {
    let v = check_any(vm, 1, "type")?;
    vm.push_string(v.type_of().name())?;
    Ok(1)
}

fn tostring(vm: &VmState) -> VmResult<usize> {
    check_any(vm, 1, "tostring")?;
    let s = vm.to_display_string(1)?;
    vm.push_string(&s)?;
    Ok(1)
}

fn tonumber(vm: &VmState) -> VmResult<usize> {
    if matches!(vm.type_at(2), ValueType::None | ValueType::Nil) {
        let v = check_any(vm, 1, "tonumber")?;
        let converted = match v {
            Value::Integer(_) | Value::Number(_) => v,
            Value::String(s) => parse_number(&s).unwrap_or_default(),
            _ => Value::Nil,
        };
        vm.push_value(converted)?;
        return Ok(1);
    }

    let base = check_integer(vm, 2, "tonumber")?;
    if !(2..=36).contains(&base) {
        return Err(arg_error(2, "tonumber", "base out of range"));
    }
    let s = match vm.value_at(1) {
        Value::String(s) => s,
        _ => return Err(type_error(vm, 1, "tonumber", "string")),
    };
    let t = s.trim().to_ascii_lowercase();
    let (negative, digits) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.as_str()),
    };
    let parsed = i64::from_str_radix(digits, base as u32)
        .ok()
        .map(|v| Value::Integer(if negative { v.wrapping_neg() } else { v }))
        .unwrap_or_default();
    vm.push_value(parsed)?;
    Ok(1)
}

fn rawequal(vm: &VmState) -> VmResult<usize> {
    let a = check_any(vm, 1, "rawequal")?;
    let b = check_any(vm, 2, "rawequal")?;
    vm.push_boolean(a.raw_equals(&b))?;
    Ok(1)
}

fn rawget(vm: &VmState) -> VmResult<usize> {
    let t = check_table(vm, 1, "rawget")?;
    let k = check_any(vm, 2, "rawget")?;
    vm.push_value(t.get(&k))?;
    Ok(1)
}

fn rawset(vm: &VmState) -> VmResult<usize> {
    let t = check_table(vm, 1, "rawset")?;
    let k = check_any(vm, 2, "rawset")?;
    let v = check_any(vm, 3, "rawset")?;
    t.set(k, v)?;
    vm.set_top(1)?;
    Ok(1)
}

fn rawlen(vm: &VmState) -> VmResult<usize> {
    match vm.type_at(1) {
        ValueType::Table | ValueType::String => {
            vm.push_integer(vm.raw_len(1) as i64)?;
            Ok(1)
        }
        _ => Err(arg_error(1, "rawlen", "table or string expected")),
    }
}

fn setmetatable(vm: &VmState) -> VmResult<usize> {
    let t = check_table(vm, 1, "setmetatable")?;
    if !matches!(vm.type_at(2), ValueType::Nil | ValueType::Table) {
        return Err(type_error(vm, 2, "setmetatable", "nil or table"));
    }
    if let Some(mt) = t.metatable() {
        if !mt.get_str("__metatable").is_nil() {
            return Err(VmError::runtime("cannot change a protected metatable"));
        }
    }
    vm.set_top(2)?;
    vm.set_metatable(1)?;
    Ok(1)
}

fn getmetatable(vm: &VmState) -> VmResult<usize> {
    let v = check_any(vm, 1, "getmetatable")?;
    let result = match metatable_of(&v) {
        Some(mt) => {
            let protected = mt.get_str("__metatable");
            if protected.is_nil() {
                Value::Table(mt)
            } else {
                protected
            }
        }
        None => Value::Nil,
    };
    vm.push_value(result)?;
    Ok(1)
}

fn next(vm: &VmState) -> VmResult<usize> {
    check_table(vm, 1, "next")?;
    vm.set_top(2)?;
    if vm.next(1)? {
        Ok(2)
    } else {
        vm.push_nil()?;
        Ok(1)
    }
}

fn pairs(vm: &VmState) -> VmResult<usize> {
    let v = check_any(vm, 1, "pairs")?;
    if vm.get_metafield(1, "__pairs")? {
        vm.push_value(v)?;
        vm.call(1, 3)?;
        return Ok(3);
    }
    if !matches!(v, Value::Table(_)) {
        return Err(type_error(vm, 1, "pairs", "table"));
    }
    vm.push_function(Function::named("next", next))?;
    vm.push_value(v)?;
    vm.push_nil()?;
    Ok(3)
}

fn ipairs_step(vm: &VmState) -> VmResult<usize> {
    let t = vm.value_at(1);
    let i = check_integer(vm, 2, "ipairs")?.wrapping_add(1);
    let v = vm.index_value(&t, &Value::Integer(i))?;
    if v.is_nil() {
        vm.push_nil()?;
        return Ok(1);
    }
    vm.push_integer(i)?;
    vm.push_value(v)?;
    Ok(2)
}

fn ipairs(vm: &VmState) -> VmResult<usize> {
    let v = check_any(vm, 1, "ipairs")?;
    vm.push_function(Function::named("ipairs_step", ipairs_step))?;
    vm.push_value(v)?;
    vm.push_integer(0)?;
    Ok(3)
}

fn select(vm: &VmState) -> VmResult<usize> {
    let n = vm.get_top() as i64;
    if let Value::String(s) = vm.value_at(1) {
        if &*s == "#" {
            vm.push_integer(n - 1)?;
            return Ok(1);
        }
    }
    let i = check_integer(vm, 1, "select")?;
    let start = if i < 0 {
        n + i
    } else if i == 0 {
        return Err(arg_error(1, "select", "index out of range"));
    } else {
        i.min(n)
    };
    if start < 1 {
        return Err(arg_error(1, "select", "index out of range"));
    }
    Ok((n - start) as usize)
}

fn error(vm: &VmState) -> VmResult<usize> {
    Err(VmError::with_value(vm.value_at(1)))
}

fn assert(vm: &VmState) -> VmResult<usize> {
    let v = check_any(vm, 1, "assert")?;
    if v.is_truthy() {
        return Ok(vm.get_top() as usize);
    }
    match vm.type_at(2) {
        ValueType::None | ValueType::Nil => Err(VmError::runtime("assertion failed!")),
        _ => Err(VmError::with_value(vm.value_at(2))),
    }
}

fn pcall(vm: &VmState) -> VmResult<usize> {
    check_any(vm, 1, "pcall")?;
    let nargs = (vm.get_top() - 1) as usize;
    if vm.pcall(nargs, MULTRET, 0).is_ok() {
        vm.push_boolean(true)?;
        vm.insert(1);
        Ok(vm.get_top() as usize)
    } else {
        vm.push_boolean(false)?;
        vm.insert(-2);
        Ok(2)
    }
}

fn xpcall(vm: &VmState) -> VmResult<usize> {
    let f = check_any(vm, 1, "xpcall")?;
    let handler = check_any(vm, 2, "xpcall")?;
    let nargs = (vm.get_top() - 2) as usize;

    // [f, msgh, args...] -> [msgh, f, args...]
    vm.push_value(handler)?;
    vm.replace(1);
    vm.push_value(f)?;
    vm.replace(2);

    let ok = vm.pcall(nargs, MULTRET, 1).is_ok();
    vm.push_boolean(ok)?;
    vm.replace(1);
    Ok(vm.get_top() as usize)
}
