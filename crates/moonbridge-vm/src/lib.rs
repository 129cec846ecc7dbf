//! Moonbridge VM
//!
//! A small stack-based, dynamically typed virtual machine meant to be
//! embedded in a host program. It provides:
//! - A value stack with call frames and pseudo-indices
//! - Tables with an array part and an insertion-ordered hash part
//! - Metatables (`__index`, `__newindex`, `__call`, `__eq`, `__tostring`)
//! - A registry with integer reference slots
//! - Protected calls with message handlers
//! - Threads sharing one heap
//! - The `base`, `table` and `debug` library entry points
//!
//! There is no source language: "chunks" are native functions loaded into
//! the VM and called like any other function.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod value;
pub mod table;
pub mod function;
pub mod userdata;
pub mod stack;
pub mod state;
pub mod stdlib;

pub use function::{Function, NativeFn};
pub use stack::{CallFrame, Stack};
pub use state::{Status, VmId, VmOptions, VmState, MULTRET, REF_NIL, REGISTRY_INDEX};
pub use table::{Table, TableHandle};
pub use userdata::UserData;
pub use value::{Value, ValueType};

use std::fmt;

/// Error payload raised inside the VM
///
/// Wraps the value passed to `error` (or produced by the VM itself) together
/// with a flag recording whether a message handler already transformed it.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    value: Value,
    handled: bool,
}

impl ErrorValue {
    /// Wrap an arbitrary error value
    pub fn new(value: Value) -> Self {
        Self {
            value,
            handled: false,
        }
    }

    /// The raw error value
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consume into the raw error value
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Whether a message handler already ran for this error
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub(crate) fn mark_handled(value: Value) -> Self {
        Self {
            value,
            handled: true,
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::String(s) => f.write_str(s),
            Value::Integer(_) | Value::Number(_) => f.write_str(&self.value.to_plain_string()),
            other => write!(f, "(error object is a {} value)", other.type_of().name()),
        }
    }
}

/// VM execution errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    /// Error raised by a function or by the VM itself
    #[error("{0}")]
    Runtime(ErrorValue),

    /// Too many nested calls or stack slots
    #[error("stack overflow")]
    StackOverflow,

    /// The message handler itself failed
    #[error("error in error handling")]
    Handler(ErrorValue),
}

impl VmError {
    /// Runtime error carrying a string message
    pub fn runtime(message: impl Into<String>) -> Self {
        VmError::Runtime(ErrorValue::new(Value::string(message.into())))
    }

    /// Runtime error carrying an arbitrary value
    pub fn with_value(value: Value) -> Self {
        VmError::Runtime(ErrorValue::new(value))
    }

    /// The value a protected call leaves on the stack for this error
    pub fn to_value(&self) -> Value {
        match self {
            VmError::Runtime(e) | VmError::Handler(e) => e.value().clone(),
            VmError::StackOverflow => Value::string("stack overflow"),
        }
    }

    pub(crate) fn is_handled(&self) -> bool {
        match self {
            VmError::Runtime(e) => e.is_handled(),
            VmError::StackOverflow => false,
            VmError::Handler(_) => true,
        }
    }
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
