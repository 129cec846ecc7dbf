//! Per-VM marshalling context
//!
//! A [`Translator`] owns the host side of one VM identity:
//! - converting [`HostValue`]s to VM values and back
//! - capturing VM values into [`Reference`]s
//! - the deferred release queue fed by dropped references
//! - converting errors in both directions
//! - dispatching VM calls into host functions
//!
//! Exactly one translator exists per VM identity; the process-wide
//! [`TranslatorRegistry`] maps identities to translators.

mod guard;
mod registry;

pub use guard::StackGuard;
pub use registry::TranslatorRegistry;

use std::fmt;
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use moonbridge_vm::{
    TableHandle, UserData, Value, ValueType, VmError, VmId, VmState, MULTRET, REGISTRY_INDEX,
};
use parking_lot::RwLock;

use crate::config::Options;
use crate::error::{script_error_of, Error, ErrorPayload, Result, ScriptError};
use crate::function::FunctionRef;
use crate::method::{CallAdapter, CallContext};
use crate::reference::{RefKind, Reference};
use crate::table::TableRef;
use crate::thread::ThreadRef;
use crate::userdata::{LightUserDataRef, UserDataRef};
use crate::value::{HostObject, HostValue};

/// Registry flag marking a VM as owned by a translator
pub const LOADED_KEY: &str = "moonbridge.loaded";

/// Registry key of the metatable given to host error values
pub const ERROR_METATABLE: &str = "moonbridge.error";

/// Registry key of the metatable given to host objects
pub const OBJECT_METATABLE: &str = "moonbridge.object";

/// Extra stack slots reserved on top of an argument list
const STACK_RESERVE: usize = 6;

/// Userdata payload wrapping a host object
struct ObjectPayload(HostObject);

/// Marshalling context of one VM identity
pub struct Translator {
    id: VmId,
    vm: RwLock<Option<Arc<VmState>>>,
    pending: SegQueue<i32>,
    options: Options,
}

impl Translator {
    /// Create a translator for `vm`
    ///
    /// The translator is not registered; see [`TranslatorRegistry::register`].
    pub fn new(vm: Arc<VmState>, options: Options) -> Arc<Self> {
        Arc::new(Self {
            id: vm.id(),
            vm: RwLock::new(Some(vm)),
            pending: SegQueue::new(),
            options,
        })
    }

    /// VM identity
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Options the translator was created with
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Whether the VM is still open
    pub fn is_available(&self) -> bool {
        self.vm.read().as_ref().is_some_and(|vm| !vm.is_closed())
    }

    /// The main VM state, while open
    pub fn vm(&self) -> Option<Arc<VmState>> {
        self.vm.read().as_ref().filter(|vm| !vm.is_closed()).cloned()
    }

    /// Run `f` against the open VM after draining the release queue
    ///
    /// Returns `None` when the VM is closed.
    pub fn with_vm<R>(&self, f: impl FnOnce(&VmState) -> R) -> Option<R> {
        let vm = self.vm()?;
        self.collect_finalized(&vm);
        Some(f(&vm))
    }

    /// Release every slot queued by dropped references
    pub fn collect_finalized(&self, vm: &VmState) -> usize {
        let mut released = 0;
        while let Some(slot) = self.pending.pop() {
            vm.release_ref(slot);
            released += 1;
        }
        if released > 0 {
            tracing::trace!(vm = %self.id, released, "drained deferred releases");
        }
        released
    }

    /// Number of slots waiting in the release queue
    pub fn pending_releases(&self) -> usize {
        self.pending.len()
    }

    /// Queue a slot for release at the next synchronous operation
    pub(crate) fn enqueue_release(&self, slot: i32) {
        self.pending.push(slot);
    }

    /// Release a slot now (no-op once the VM closed)
    pub fn release(&self, slot: i32) {
        if let Some(vm) = self.vm() {
            vm.release_ref(slot);
            tracing::trace!(vm = %self.id, slot, "released reference");
        }
    }

    /// Release a slot, either now or through the deferred queue
    pub fn release_reference(&self, slot: i32, deferred: bool) {
        if deferred {
            self.enqueue_release(slot);
        } else {
            self.release(slot);
        }
    }

    /// Forget the VM; every handle becomes unavailable
    pub(crate) fn detach(&self) {
        self.vm.write().take();
        while self.pending.pop().is_some() {}
    }

    /// Prepare `vm` for use by this translator
    ///
    /// Sets the loaded flag and installs the metatables used for host
    /// errors and host objects.
    pub(crate) fn install(&self, vm: &VmState) -> Result<()> {
        let _guard = StackGuard::new(vm);

        vm.new_table()?;
        vm.push_string("moonbridge.error")?;
        vm.set_field(-2, "__name")?;
        vm.push_native("__tostring", |vm| {
            let message = vm
                .to_userdata(1)
                .and_then(|ud| ud.downcast_ref::<ErrorPayload>().map(|p| p.0.message().to_string()))
                .unwrap_or_default();
            vm.push_string(&message)?;
            Ok(1)
        })?;
        vm.set_field(-2, "__tostring")?;
        vm.set_field(REGISTRY_INDEX, ERROR_METATABLE)?;

        vm.new_table()?;
        vm.push_string("moonbridge.object")?;
        vm.set_field(-2, "__name")?;
        vm.push_native("__tostring", |vm| {
            let name = vm
                .to_userdata(1)
                .and_then(|ud| ud.downcast_ref::<ObjectPayload>().map(|p| p.0.type_name()))
                .unwrap_or("?");
            vm.push_string(&format!("object: {}", name))?;
            Ok(1)
        })?;
        vm.set_field(-2, "__tostring")?;
        vm.set_field(REGISTRY_INDEX, OBJECT_METATABLE)?;

        vm.push_boolean(true)?;
        vm.set_field(REGISTRY_INDEX, LOADED_KEY)?;
        Ok(())
    }

    // ========================================================================
    // Marshalling
    // ========================================================================

    /// Capture the value at `index` into a new reference
    pub fn acquire(self: &Arc<Self>, vm: &VmState, index: i32, kind: RefKind) -> Result<Reference> {
        Reference::acquire(self, vm, index, kind)
    }

    /// Push a host value onto `vm`
    ///
    /// On failure the stack is left as it was; partially built tables are
    /// popped.
    pub fn push(self: &Arc<Self>, vm: &VmState, value: &HostValue) -> Result<()> {
        let guard = StackGuard::new(vm);
        self.push_value(vm, value)?;
        guard.release();
        Ok(())
    }

    fn push_value(self: &Arc<Self>, vm: &VmState, value: &HostValue) -> Result<()> {
        match value {
            HostValue::Nil => vm.push_nil()?,
            HostValue::Bool(b) => vm.push_boolean(*b)?,
            HostValue::Int(i) => vm.push_integer(*i)?,
            HostValue::Float(f) => vm.push_number(*f)?,
            HostValue::String(s) => vm.push_string(s)?,
            HostValue::Table(t) => t.reference().push(vm)?,
            HostValue::Function(f) => self.push_function(vm, f)?,
            HostValue::UserData(u) => u.reference().push(vm)?,
            HostValue::LightUserData(u) => u.reference().push(vm)?,
            HostValue::Thread(t) => t.reference().push(vm)?,
            HostValue::Object(obj) => {
                let ud = UserData::new(Box::new(ObjectPayload(obj.clone())));
                ud.set_metatable(registry_table(vm, OBJECT_METATABLE));
                vm.push_value(Value::UserData(Arc::new(ud)))?;
            }
            HostValue::List(items) => {
                if !vm.check_stack(STACK_RESERVE) {
                    return Err(Error::StackOverflow {
                        needed: STACK_RESERVE,
                    });
                }
                vm.create_table(items.len(), 0)?;
                for (i, item) in items.iter().enumerate() {
                    self.push_value(vm, item)?;
                    vm.raw_set_i(-2, i as i64 + 1)?;
                }
            }
            HostValue::Map(entries) => {
                if !vm.check_stack(STACK_RESERVE) {
                    return Err(Error::StackOverflow {
                        needed: STACK_RESERVE,
                    });
                }
                vm.create_table(0, entries.len())?;
                for (k, v) in entries {
                    check_table_key(k)?;
                    self.push_value(vm, k)?;
                    self.push_value(vm, v)?;
                    vm.raw_set(-3)?;
                }
            }
        }
        Ok(())
    }

    /// Push a function, turning a host native into a fresh VM closure
    pub fn push_function(&self, vm: &VmState, func: &FunctionRef) -> Result<()> {
        match func {
            FunctionRef::Interned(r) => r.push(vm),
            FunctionRef::Native(native) => {
                crate::method::push_trampoline(vm, native.adapter().clone())?;
                Ok(())
            }
        }
    }

    /// Read the value at `index` of `vm` as a host value
    ///
    /// Scalars are copied; tables, functions, userdata and threads are
    /// captured into references.
    pub fn get(self: &Arc<Self>, vm: &VmState, index: i32) -> Result<HostValue> {
        let value = match vm.value_at(index) {
            Value::Nil => HostValue::Nil,
            Value::Boolean(b) => HostValue::Bool(b),
            Value::Integer(i) => HostValue::Int(i),
            Value::Number(n) => HostValue::Float(n),
            Value::String(s) => HostValue::String(s.to_string()),
            Value::Table(_) => HostValue::Table(TableRef::from_reference(
                self.acquire(vm, index, RefKind::Table)?,
            )),
            Value::Function(_) => HostValue::Function(FunctionRef::Interned(
                self.acquire(vm, index, RefKind::Function)?,
            )),
            Value::UserData(ud) => match ud.downcast_ref::<ObjectPayload>() {
                Some(payload) => HostValue::Object(payload.0.clone()),
                None => HostValue::UserData(UserDataRef::from_reference(
                    self.acquire(vm, index, RefKind::UserData)?,
                )),
            },
            Value::LightUserData(_) => HostValue::LightUserData(LightUserDataRef::from_reference(
                self.acquire(vm, index, RefKind::LightUserData)?,
            )),
            Value::Thread(_) => HostValue::Thread(ThreadRef::from_reference(
                self.acquire(vm, index, RefKind::Thread)?,
            )),
        };
        Ok(value)
    }

    /// Read every value from `from` to the stack top
    pub(crate) fn get_range(self: &Arc<Self>, vm: &VmState, from: i32) -> Result<Vec<HostValue>> {
        let top = vm.get_top();
        (from..=top).map(|i| self.get(vm, i)).collect()
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call `func` with `args` in protected mode, returning every result
    pub fn call_function(
        self: &Arc<Self>,
        vm: &VmState,
        func: &FunctionRef,
        args: &[HostValue],
    ) -> Result<Vec<HostValue>> {
        self.protected_call(vm, |vm| {
            self.push_function(vm, func)?;
            self.push_args(vm, args)?;
            Ok(args.len())
        })
    }

    /// Push an argument list after checking for stack room
    pub(crate) fn push_args(self: &Arc<Self>, vm: &VmState, args: &[HostValue]) -> Result<()> {
        let needed = args.len() + STACK_RESERVE;
        if !vm.check_stack(needed) {
            return Err(Error::StackOverflow { needed });
        }
        for arg in args {
            self.push(vm, arg)?;
        }
        Ok(())
    }

    /// Protected call of whatever `setup` pushes
    ///
    /// `setup` pushes a function followed by its arguments and returns the
    /// argument count. The stack is restored afterwards.
    pub(crate) fn protected_call(
        self: &Arc<Self>,
        vm: &VmState,
        setup: impl FnOnce(&VmState) -> Result<usize>,
    ) -> Result<Vec<HostValue>> {
        let _guard = StackGuard::new(vm);
        let handler = self.push_message_handler(vm)?;
        let base = vm.get_top();
        let nargs = setup(vm)?;
        let status = vm.pcall(nargs, MULTRET, handler);
        if !status.is_ok() {
            return Err(self.error_from_stack(vm));
        }
        self.get_range(vm, base + 1)
    }

    /// Push `debug.traceback` when tracebacks are enabled
    ///
    /// Returns the handler's stack index, or 0 for none.
    fn push_message_handler(&self, vm: &VmState) -> Result<i32> {
        if !self.options.use_traceback {
            return Ok(0);
        }
        if vm.get_global("debug")? == ValueType::Table {
            vm.get_field(-1, "traceback")?;
            vm.remove(-2);
        }
        if vm.type_at(-1) != ValueType::Function {
            vm.pop(1);
            return Ok(0);
        }
        Ok(vm.get_top())
    }

    /// Convert the error value on top of the stack into a host error
    ///
    /// Host errors travelling back out are returned unchanged.
    pub fn error_from_stack(self: &Arc<Self>, vm: &VmState) -> Error {
        let value = vm.value_at(-1);
        if let Some(script) = script_error_of(&value) {
            return Error::Script(script);
        }
        let message = match &value {
            Value::Nil => "unknown script error".to_string(),
            Value::String(s) => s.to_string(),
            Value::Integer(_) | Value::Number(_) => value.to_plain_string(),
            other => vm
                .to_display_string(-1)
                .unwrap_or_else(|_| other.type_of().name().to_string()),
        };
        let payload = self.get(vm, -1).unwrap_or_default();
        Error::from(ScriptError::from_traced_message(&message, payload))
    }

    /// Convert a host error into a VM error value
    ///
    /// The value is a userdata carrying the [`ScriptError`], so a nested
    /// host call that fails again re-raises the same error object.
    pub(crate) fn raise(&self, vm: &VmState, err: Error) -> VmError {
        let script = match err {
            Error::Script(script) => script,
            other => Arc::new(ScriptError::from_host(other)),
        };
        let ud = UserData::new(Box::new(ErrorPayload(script)));
        ud.set_metatable(registry_table(vm, ERROR_METATABLE));
        VmError::with_value(Value::UserData(Arc::new(ud)))
    }

    /// Dispatch a VM call into `adapter`
    ///
    /// Reads the arguments from `vm`, resolves the overload, runs it and
    /// pushes its results. Returns the result count.
    pub fn resolve_and_invoke(self: &Arc<Self>, vm: &VmState, adapter: &CallAdapter) -> Result<usize> {
        let args = self.get_range(vm, 1)?;
        let (index, converted) = crate::method::resolve(adapter, args)?;
        let ctx = CallContext::new(self, vm, adapter);
        let results = adapter.invoke(index, &ctx, converted)?;

        let needed = results.len() + STACK_RESERVE;
        if !vm.check_stack(needed) {
            return Err(Error::StackOverflow { needed });
        }
        for r in &results {
            self.push(vm, r)?;
        }
        Ok(results.len())
    }
}

impl fmt::Debug for Translator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translator")
            .field("id", &self.id)
            .field("available", &self.is_available())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Reject keys the VM cannot index a table with
fn check_table_key(key: &HostValue) -> Result<()> {
    match key {
        HostValue::Nil => Err(Error::coercion("table key", "nil")),
        HostValue::Float(f) if f.is_nan() => Err(Error::coercion("table key", "NaN")),
        _ => Ok(()),
    }
}

/// Table stored in the registry under `key`
fn registry_table(vm: &VmState, key: &str) -> Option<TableHandle> {
    vm.get_field(REGISTRY_INDEX, key).ok()?;
    match vm.pop_value() {
        Value::Table(t) => Some(t),
        _ => None,
    }
}
