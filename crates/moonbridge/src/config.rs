//! Interpreter configuration

use moonbridge_vm::stack::{DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STACK_SIZE};
use moonbridge_vm::VmOptions;

/// Options for an [`Interpreter`](crate::Interpreter)
#[derive(Debug, Clone)]
pub struct Options {
    /// Install `debug.traceback` as message handler for host-initiated calls
    /// and keep the trace on the resulting [`ScriptError`](crate::ScriptError)
    pub use_traceback: bool,

    /// Maximum number of VM stack slots per thread
    pub max_stack: usize,

    /// Maximum nesting of calls per thread
    pub max_call_depth: usize,

    /// Open the VM standard library on creation
    pub open_libs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            use_traceback: false,
            max_stack: DEFAULT_MAX_STACK_SIZE,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            open_libs: true,
        }
    }
}

impl Options {
    /// Enable or disable tracebacks on script errors
    pub fn with_traceback(mut self, enabled: bool) -> Self {
        self.use_traceback = enabled;
        self
    }

    /// Set the stack slot limit
    pub fn with_max_stack(mut self, max_stack: usize) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// Set the call depth limit
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Skip opening the standard library
    pub fn without_libs(mut self) -> Self {
        self.open_libs = false;
        self
    }

    /// VM options matching these settings
    pub fn vm_options(&self) -> VmOptions {
        VmOptions::default()
            .with_max_stack(self.max_stack)
            .with_max_call_depth(self.max_call_depth)
            .with_libs(self.open_libs)
    }
}
