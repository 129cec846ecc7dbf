//! Thread proxies
//!
//! Threads share the heap (and therefore the VM identity and translator)
//! of the VM that created them but run on their own stack.

use std::fmt;
use std::sync::Arc;

use moonbridge_vm::VmState;

use crate::error::Result;
use crate::function::FunctionRef;
use crate::reference::Reference;
use crate::value::HostValue;

/// Handle to a VM thread
#[derive(Clone, PartialEq)]
pub struct ThreadRef(Reference);

impl ThreadRef {
    pub(crate) fn from_reference(reference: Reference) -> Self {
        ThreadRef(reference)
    }

    /// Underlying reference
    pub fn reference(&self) -> &Reference {
        &self.0
    }

    /// Whether the thread can still be reached
    pub fn is_available(&self) -> bool {
        self.0.is_available()
    }

    /// Release the thread now
    pub fn dispose(&self) {
        self.0.dispose()
    }

    /// The thread's VM state
    pub fn state(&self) -> Option<Arc<VmState>> {
        self.0
            .with_pushed(|vm, index| Ok(vm.to_thread(index)))
            .and_then(|r| r.ok())
            .flatten()
    }

    /// Call `func` on this thread's stack in protected mode
    ///
    /// An unavailable thread yields no results.
    pub fn call(&self, func: &FunctionRef, args: &[HostValue]) -> Result<Vec<HostValue>> {
        let Some(thread) = self.state() else {
            return Ok(Vec::new());
        };
        let translator = self.0.translator();
        tracing::trace!(vm = %thread.id(), "calling on thread");
        translator.call_function(&thread, func, args)
    }

    /// The VM's string form of the thread
    pub fn to_display_string(&self) -> String {
        self.0.to_display_string()
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadRef({})", self.0.slot())
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::reference::RefKind;
    use crate::translator::Translator;

    #[test]
    fn test_call_runs_on_thread_stack() {
        let vm = VmState::new();
        let t = Translator::new(vm.clone(), Options::default());
        t.install(&vm).unwrap();

        vm.new_thread().unwrap();
        let thread = match t.get(&vm, -1).unwrap() {
            HostValue::Thread(th) => th,
            other => panic!("unexpected {:?}", other),
        };
        vm.pop(1);

        vm.push_native("main?", |vm| {
            vm.push_boolean(vm.is_main_thread())?;
            Ok(1)
        })
        .unwrap();
        let f = FunctionRef::Interned(t.acquire(&vm, -1, RefKind::Function).unwrap());
        vm.pop(1);

        assert_eq!(f.call(&[]).unwrap(), vec![HostValue::Bool(true)]);
        assert_eq!(thread.call(&f, &[]).unwrap(), vec![HostValue::Bool(false)]);
        assert_eq!(thread.state().unwrap().id(), vm.id());
        assert_eq!(vm.get_top(), 0);
    }
}
