//! Error types for the bridge
//!
//! VM failures surface as [`Error::Script`], marshalling failures as
//! [`Error::Coercion`] / [`Error::NoMatchingOverload`].

use std::fmt;
use std::sync::Arc;

use moonbridge_vm::{Value, VmError, VmId};

use crate::value::HostValue;

/// Failure reported by a protected call into the VM
///
/// Carries the VM-formatted message, the original error payload and, when
/// the interpreter runs with tracebacks, the stack trace at the error point.
/// A host error raised inside a VM call keeps its original cause in
/// [`ScriptError::cause`].
#[derive(Debug, Clone)]
pub struct ScriptError {
    message: String,
    payload: HostValue,
    traceback: Option<String>,
    cause: Option<Arc<Error>>,
}

impl ScriptError {
    /// Create a script error from a message and the raw payload
    pub fn new(message: impl Into<String>, payload: HostValue) -> Self {
        Self {
            message: message.into(),
            payload,
            traceback: None,
            cause: None,
        }
    }

    /// Wrap a host-side failure so it can travel through the VM
    pub fn from_host(err: Error) -> Self {
        let message = err.to_string();
        Self {
            payload: HostValue::String(message.clone()),
            message,
            traceback: None,
            cause: Some(Arc::new(err)),
        }
    }

    /// Attach a traceback
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error value as raised inside the VM
    pub fn payload(&self) -> &HostValue {
        &self.payload
    }

    /// Stack traceback, if one was captured
    pub fn traceback(&self) -> Option<&str> {
        self.traceback.as_deref()
    }

    /// Host error this failure originated from
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }

    /// Split a `"msg\nstack traceback:..."` string into its two parts
    pub(crate) fn from_traced_message(text: &str, payload: HostValue) -> Self {
        match text.split_once("\nstack traceback:") {
            Some((msg, trace)) => {
                ScriptError::new(msg, payload).with_traceback(format!("stack traceback:{}", trace))
            }
            None => ScriptError::new(text, payload),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ScriptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Bridge errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A protected call into the VM failed
    #[error("{0}")]
    Script(Arc<ScriptError>),

    /// A value could not be converted to the requested host type
    #[error("cannot convert {got} to {expected}")]
    Coercion {
        /// Requested host type
        expected: String,
        /// Type of the value actually found
        got: String,
    },

    /// No registered overload accepts the VM arguments
    #[error("no overload of '{name}' accepts ({args})")]
    NoMatchingOverload {
        /// Function name
        name: String,
        /// Comma separated VM argument types
        args: String,
    },

    /// Not enough VM stack space for an argument list
    #[error("stack overflow (needed {needed} slots)")]
    StackOverflow {
        /// Slots requested
        needed: usize,
    },

    /// A translator is already registered for this VM
    #[error("a translator is already attached to {0}")]
    AlreadyAttached(VmId),

    /// The interpreter has been closed
    #[error("the interpreter is closed")]
    Closed,

    /// Failure raised by host code
    #[error("{0}")]
    Runtime(String),
}

impl Error {
    /// Host-raised failure with a message
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }

    /// Coercion failure for a value of type `got`
    pub fn coercion(expected: impl fmt::Display, got: impl fmt::Display) -> Self {
        Error::Coercion {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// The script error, if this is one
    pub fn as_script(&self) -> Option<&ScriptError> {
        match self {
            Error::Script(s) => Some(s),
            _ => None,
        }
    }
}

impl From<ScriptError> for Error {
    fn from(err: ScriptError) -> Self {
        Error::Script(Arc::new(err))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Runtime(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Runtime(s.to_string())
    }
}

/// Errors raised by VM primitives outside a protected call
///
/// A payload carrying a host [`ScriptError`] is unwrapped as-is; scalar
/// payloads are kept, other payloads are reduced to their message.
impl From<VmError> for Error {
    fn from(err: VmError) -> Self {
        let value = err.to_value();
        if let Some(script) = script_error_of(&value) {
            return Error::Script(script);
        }
        let payload = match &value {
            Value::Boolean(b) => HostValue::Bool(*b),
            Value::Integer(i) => HostValue::Int(*i),
            Value::Number(n) => HostValue::Float(*n),
            Value::String(s) => HostValue::String(s.to_string()),
            _ => HostValue::Nil,
        };
        Error::from(ScriptError::new(err.to_string(), payload))
    }
}

/// Payload stored in the userdata that carries a host error through the VM
#[derive(Debug)]
pub(crate) struct ErrorPayload(pub(crate) Arc<ScriptError>);

/// The host error carried by a VM error value, if any
pub(crate) fn script_error_of(value: &Value) -> Option<Arc<ScriptError>> {
    match value {
        Value::UserData(ud) => ud.downcast_ref::<ErrorPayload>().map(|p| p.0.clone()),
        _ => None,
    }
}

/// Bridge result type
pub type Result<T> = std::result::Result<T, Error>;
