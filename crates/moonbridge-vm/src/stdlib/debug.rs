//! Debug library

use crate::state::VmState;
use crate::stdlib::{opt_integer, LibFn};
use crate::value::{Value, ValueType};
use crate::VmResult;

pub(super) const FUNCTIONS: &[(&str, LibFn)] = &[("traceback", traceback)];

/// `debug.traceback([msg [, level]])`
///
/// Non-string messages are returned untouched so the function can be used
/// as a message handler for arbitrary error values.
fn traceback(vm: &VmState) -> VmResult<usize> {
    let msg = match vm.value_at(1) {
        Value::String(s) => Some(s.to_string()),
        v @ (Value::Integer(_) | Value::Number(_)) => Some(v.to_plain_string()),
        Value::Nil => None,
        other => {
            vm.push_value(other)?;
            return Ok(1);
        }
    };
    let level = match vm.type_at(2) {
        ValueType::None | ValueType::Nil => 1,
        _ => opt_integer(vm, 2, "traceback", 1)?.max(0) as usize,
    };
    let trace = vm.traceback(msg.as_deref(), level);
    vm.push_string(&trace)?;
    Ok(1)
}
