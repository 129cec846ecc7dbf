//! Reference handles to VM-resident values
//!
//! A [`Reference`] pins one VM value in a registry slot for as long as the
//! host holds it. The slot is released exactly once:
//! - [`Reference::dispose`] releases it synchronously while the VM is alive
//! - dropping the last clone queues it on the translator's release queue,
//!   drained at the next synchronous operation on that VM
//!
//! Once the VM is closed every handle reports itself unavailable and all
//! operations degrade to neutral results.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use moonbridge_vm::VmState;

use crate::error::Result;
use crate::translator::{StackGuard, Translator};

/// Kind of VM value a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    /// Table
    Table,
    /// Function
    Function,
    /// Full userdata
    UserData,
    /// Light userdata
    LightUserData,
    /// Thread
    Thread,
}

impl RefKind {
    /// VM type name of the referenced value
    pub fn name(self) -> &'static str {
        match self {
            RefKind::Table => "table",
            RefKind::Function => "function",
            RefKind::UserData => "userdata",
            RefKind::LightUserData => "lightuserdata",
            RefKind::Thread => "thread",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct RefInner {
    kind: RefKind,
    slot: AtomicI32,
    translator: Arc<Translator>,
}

impl Drop for RefInner {
    fn drop(&mut self) {
        let slot = *self.slot.get_mut();
        if slot > 0 && self.translator.is_available() {
            self.translator.enqueue_release(slot);
        }
    }
}

/// Shared handle to a value pinned in the VM registry
///
/// Clones share the slot.
#[derive(Clone)]
pub struct Reference(Arc<RefInner>);

impl Reference {
    pub(crate) fn new(translator: Arc<Translator>, kind: RefKind, slot: i32) -> Self {
        Reference(Arc::new(RefInner {
            kind,
            slot: AtomicI32::new(slot),
            translator,
        }))
    }

    /// Capture the value at `index` of `vm` into a fresh registry slot
    pub fn acquire(
        translator: &Arc<Translator>,
        vm: &VmState,
        index: i32,
        kind: RefKind,
    ) -> Result<Self> {
        vm.push_copy(index)?;
        let slot = vm.create_ref()?;
        Ok(Reference::new(translator.clone(), kind, slot))
    }

    /// Registry slot (0 once disposed)
    pub fn slot(&self) -> i32 {
        self.0.slot.load(Ordering::Acquire)
    }

    /// Kind of the referenced value
    pub fn kind(&self) -> RefKind {
        self.0.kind
    }

    /// Owning translator
    pub fn translator(&self) -> &Arc<Translator> {
        &self.0.translator
    }

    /// Whether [`Reference::dispose`] ran
    pub fn is_disposed(&self) -> bool {
        self.slot() == 0
    }

    /// Whether the referenced value can still be reached
    pub fn is_available(&self) -> bool {
        !self.is_disposed() && self.0.translator.is_available()
    }

    /// Release the slot now
    ///
    /// Safe to call repeatedly and after the VM closed.
    pub fn dispose(&self) {
        let slot = self.0.slot.swap(0, Ordering::AcqRel);
        if slot != 0 {
            self.0.translator.release(slot);
        }
    }

    /// Push the referenced value onto `vm` (nil once disposed)
    pub fn push(&self, vm: &VmState) -> Result<()> {
        vm.push_ref(self.slot())?;
        Ok(())
    }

    /// Run `f` with the referenced value pushed on the VM stack
    ///
    /// `f` receives the absolute index of the value. The stack is restored
    /// afterwards. Returns `None` when the handle is unavailable.
    pub fn with_pushed<R>(&self, f: impl FnOnce(&VmState, i32) -> Result<R>) -> Option<Result<R>> {
        if self.is_disposed() {
            return None;
        }
        self.0.translator.with_vm(|vm| {
            let _guard = StackGuard::new(vm);
            self.push(vm)?;
            let index = vm.get_top();
            f(vm, index)
        })
    }

    /// VM identity of the two referenced values
    ///
    /// False when either side is unavailable or they belong to different VMs.
    pub fn equals(&self, other: &Reference) -> bool {
        if !Arc::ptr_eq(&self.0.translator, &other.0.translator) || other.is_disposed() {
            return false;
        }
        self.with_pushed(|vm, index| {
            other.push(vm)?;
            Ok(vm.raw_equal(index, -1))
        })
        .and_then(|r| r.ok())
        .unwrap_or(false)
    }

    /// The VM's string form of the value, or the kind name when unavailable
    pub fn to_display_string(&self) -> String {
        self.with_pushed(|vm, index| Ok(vm.to_display_string(index)?))
            .and_then(|r| r.ok())
            .unwrap_or_else(|| self.kind().name().to_string())
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Reference) -> bool {
        self.equals(other)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("kind", &self.kind())
            .field("slot", &self.slot())
            .field("vm", &self.0.translator.id())
            .finish()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use moonbridge_vm::VmState;

    fn translator() -> (Arc<VmState>, Arc<Translator>) {
        let vm = VmState::new();
        let t = Translator::new(vm.clone(), Options::default());
        (vm, t)
    }

    fn table_ref(vm: &VmState, t: &Arc<Translator>) -> Reference {
        vm.new_table().unwrap();
        let r = Reference::acquire(t, vm, -1, RefKind::Table).unwrap();
        vm.pop(1);
        r
    }

    #[test]
    fn test_acquire_allocates_slot() {
        let (vm, t) = translator();
        let r = table_ref(&vm, &t);
        assert!(r.slot() > 0);
        assert_eq!(r.kind(), RefKind::Table);
        assert!(r.is_available());
        assert_eq!(vm.get_top(), 0);
    }

    #[test]
    fn test_dispose_twice_is_safe() {
        let (vm, t) = translator();
        let r = table_ref(&vm, &t);
        let slot = r.slot();
        r.dispose();
        assert!(r.is_disposed());
        r.dispose();

        // the slot is back on the free list and handed to the next capture
        let other = table_ref(&vm, &t);
        assert_eq!(other.slot(), slot);
        r.dispose();
        assert!(other.is_available());
    }

    #[test]
    fn test_drop_defers_release_until_next_operation() {
        let (vm, t) = translator();
        let r = table_ref(&vm, &t);
        let slot = r.slot();
        drop(r);
        assert_eq!(t.pending_releases(), 1);

        // still pinned until a synchronous operation drains the queue
        vm.push_ref(slot).unwrap();
        assert!(!vm.value_at(-1).is_nil());
        vm.pop(1);

        t.with_vm(|_| ()).unwrap();
        assert_eq!(t.pending_releases(), 0);
        vm.push_ref(slot).unwrap();
        assert!(vm.value_at(-1).is_nil());
    }

    #[test]
    fn test_clones_share_slot() {
        let (vm, t) = translator();
        let r = table_ref(&vm, &t);
        let copy = r.clone();
        drop(r);
        assert_eq!(t.pending_releases(), 0);
        assert!(copy.is_available());
    }

    #[test]
    fn test_equals_is_vm_identity() {
        let (vm, t) = translator();
        let a = table_ref(&vm, &t);
        a.push(&vm).unwrap();
        let b = Reference::acquire(&t, &vm, -1, RefKind::Table).unwrap();
        vm.pop(1);
        let c = table_ref(&vm, &t);

        assert_ne!(a.slot(), b.slot());
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
        b.dispose();
        assert!(!a.equals(&b));
    }

    #[test]
    fn test_unavailable_after_close() {
        let (vm, t) = translator();
        let r = table_ref(&vm, &t);
        t.detach();
        vm.close();
        assert!(!r.is_available());
        assert_eq!(r.to_display_string(), "table");
        r.dispose();
        drop(r);
        assert_eq!(t.pending_releases(), 0);
    }

    #[test]
    fn test_with_pushed_restores_stack() {
        let (vm, t) = translator();
        let r = table_ref(&vm, &t);
        vm.push_integer(1).unwrap();
        let top = vm.get_top();
        let out = r
            .with_pushed(|vm, _| {
                vm.push_integer(2)?;
                vm.push_integer(3)?;
                Ok(vm.get_top())
            })
            .unwrap()
            .unwrap();
        assert_eq!(out, top + 3);
        assert_eq!(vm.get_top(), top);
    }
}
