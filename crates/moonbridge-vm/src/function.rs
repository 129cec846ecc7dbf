//! Native functions
//!
//! Every function in the VM is a host closure. Arguments are found on the
//! callee's frame at indices `1..=get_top()`; the closure pushes its
//! results and returns how many of the topmost values are results.

use std::fmt;
use std::sync::Arc;

use crate::state::VmState;
use crate::VmResult;

/// Signature of a native function
pub type NativeFn = Arc<dyn Fn(&VmState) -> VmResult<usize> + Send + Sync>;

/// A callable VM function
pub struct Function {
    name: Option<Arc<str>>,
    func: NativeFn,
}

impl Function {
    /// Create an anonymous function
    pub fn new(func: impl Fn(&VmState) -> VmResult<usize> + Send + Sync + 'static) -> Self {
        Self {
            name: None,
            func: Arc::new(func),
        }
    }

    /// Create a named function; the name appears in tracebacks
    pub fn named(
        name: impl AsRef<str>,
        func: impl Fn(&VmState) -> VmResult<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: Some(Arc::from(name.as_ref())),
            func: Arc::new(func),
        }
    }

    /// Create from an already shared closure
    pub fn from_native(name: Option<&str>, func: NativeFn) -> Self {
        Self {
            name: name.map(Arc::from),
            func,
        }
    }

    /// Name used in tracebacks
    pub fn name(&self) -> Option<&Arc<str>> {
        self.name.as_ref()
    }

    /// Invoke with the callee frame already set up
    #[inline]
    pub(crate) fn invoke(&self, vm: &VmState) -> VmResult<usize> {
        (self.func)(vm)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("name", &self.name).finish()
    }
}
