//! Standard library entry points
//!
//! - `base`: `print`, `type`, `tostring`, `tonumber`, raw access, metatables,
//!   iteration, `select`, `error`, `assert`, `pcall`, `xpcall`
//! - `table`: `concat`, `insert`, `remove`, `sort`, `move`, `unpack`, `pack`
//! - `debug`: `traceback`

mod base;
mod debug;
mod table;

use crate::function::Function;
use crate::state::VmState;
use crate::table::TableHandle;
use crate::value::{Value, ValueType};
use crate::{VmError, VmResult};

/// Library function pointer
pub(crate) type LibFn = fn(&VmState) -> VmResult<usize>;

/// Open every library into the globals table
pub fn open_libs(vm: &VmState) {
    let opened = base::open(vm)
        .and_then(|_| open_module(vm, "table", table::FUNCTIONS))
        .and_then(|_| open_module(vm, "debug", debug::FUNCTIONS));
    if let Err(e) = opened {
        tracing::warn!(id = %vm.id(), error = %e, "failed to open standard libraries");
    }
}

/// Create a global table `name` holding `funcs`
fn open_module(vm: &VmState, name: &str, funcs: &[(&str, LibFn)]) -> VmResult<()> {
    let module = TableHandle::new();
    for (fname, f) in funcs {
        let qualified = format!("{}.{}", name, fname);
        let func = Function::named(qualified, *f);
        module.set(Value::string(fname), Value::Function(func.into()))?;
    }
    vm.push_value(Value::Table(module))?;
    vm.set_global(name)
}

// ============================================================================
// Argument Checking
// ============================================================================

pub(crate) fn arg_error(n: i32, fname: &str, msg: &str) -> VmError {
    VmError::runtime(format!("bad argument #{} to '{}' ({})", n, fname, msg))
}

pub(crate) fn type_error(vm: &VmState, n: i32, fname: &str, expected: &str) -> VmError {
    let got = vm.type_at(n);
    arg_error(n, fname, &format!("{} expected, got {}", expected, got))
}

pub(crate) fn check_any(vm: &VmState, n: i32, fname: &str) -> VmResult<Value> {
    if vm.type_at(n) == ValueType::None {
        return Err(arg_error(n, fname, "value expected"));
    }
    Ok(vm.value_at(n))
}

pub(crate) fn check_table(vm: &VmState, n: i32, fname: &str) -> VmResult<TableHandle> {
    match vm.value_at(n) {
        Value::Table(t) => Ok(t),
        _ => Err(type_error(vm, n, fname, "table")),
    }
}

pub(crate) fn check_integer(vm: &VmState, n: i32, fname: &str) -> VmResult<i64> {
    let v = vm.value_at(n);
    match v.as_integer() {
        Some(i) => Ok(i),
        None if v.as_number().is_some() => {
            Err(arg_error(n, fname, "number has no integer representation"))
        }
        None => Err(type_error(vm, n, fname, "number")),
    }
}

pub(crate) fn opt_integer(vm: &VmState, n: i32, fname: &str, default: i64) -> VmResult<i64> {
    match vm.type_at(n) {
        ValueType::None | ValueType::Nil => Ok(default),
        _ => check_integer(vm, n, fname),
    }
}
