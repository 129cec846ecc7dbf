//! RAII guard restoring the VM stack depth

use moonbridge_vm::VmState;

/// Restores the stack top it observed at creation when dropped
///
/// Every bridge operation that pushes temporaries holds one of these, so the
/// stack is balanced on every exit path: early returns, errors and panics
/// unwinding through host code.
pub struct StackGuard<'a> {
    /// VM whose stack is guarded
    vm: &'a VmState,
    /// Stack top to restore
    top: i32,
    /// Whether the guard was released without restoring
    released: bool,
}

impl<'a> StackGuard<'a> {
    /// Record the current stack top of `vm`
    pub fn new(vm: &'a VmState) -> Self {
        Self {
            vm,
            top: vm.get_top(),
            released: false,
        }
    }

    /// The recorded stack top
    pub fn top(&self) -> i32 {
        self.top
    }

    /// Keep whatever was pushed since the guard was created
    pub fn release(mut self) {
        self.released = true;
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        if !self.released && self.vm.get_top() > self.top {
            // Ignore errors on drop; the VM may already be closed
            let _ = self.vm.set_top(self.top);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_restores_top() {
        let vm = VmState::new();
        vm.push_integer(1).unwrap();
        {
            let guard = StackGuard::new(&vm);
            assert_eq!(guard.top(), 1);
            vm.push_integer(2).unwrap();
            vm.push_integer(3).unwrap();
        }
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn test_released_guard_keeps_values() {
        let vm = VmState::new();
        let guard = StackGuard::new(&vm);
        vm.push_integer(2).unwrap();
        guard.release();
        assert_eq!(vm.get_top(), 1);
    }

    #[test]
    fn test_guard_restores_on_panic() {
        let vm = VmState::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = StackGuard::new(&vm);
            vm.push_integer(1).unwrap();
            panic!("host bug");
        }));
        assert!(result.is_err());
        assert_eq!(vm.get_top(), 0);
    }
}
