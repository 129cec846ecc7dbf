//! Host driver for one VM
//!
//! An [`Interpreter`] owns one VM identity and its [`Translator`]. It is the
//! entry point for host code: global access by dotted path, creation of
//! tables, userdata and threads, registration of host functions, and
//! loading and running chunks.
//!
//! ```ignore
//! let lua = Interpreter::new()?;
//! lua.register_fn("ping", || "pong")?;
//! let out = lua.do_chunk("main", |vm| {
//!     vm.get_global("ping")?;
//!     vm.call(0, MULTRET)?;
//!     Ok(vm.get_top() as usize)
//! })?;
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use moonbridge_vm::{ValueType, VmResult, VmState, REGISTRY_INDEX};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::function::FunctionRef;
use crate::method::{CallAdapter, HostFunction, HostType, Signature};
use crate::number::Number;
use crate::reference::{RefKind, Reference};
use crate::table::{navigate, split_path, TableRef};
use crate::thread::ThreadRef;
use crate::translator::{StackGuard, Translator, TranslatorRegistry, LOADED_KEY};
use crate::userdata::UserDataRef;
use crate::value::{FromHost, HostObject, HostValue, IntoHost};

/// A VM together with its marshalling context
pub struct Interpreter {
    vm: Arc<VmState>,
    translator: Arc<Translator>,
}

impl Interpreter {
    /// Fresh VM with default options
    pub fn new() -> Result<Self> {
        Self::with_options(Options::default())
    }

    /// Fresh VM configured by `options`
    pub fn with_options(options: Options) -> Result<Self> {
        let vm = VmState::with_options(options.vm_options());
        Self::attach(vm, options)
    }

    /// Take over an existing VM
    ///
    /// Fails with [`Error::AlreadyAttached`] when another interpreter already
    /// owns the VM identity.
    pub fn attach(vm: Arc<VmState>, options: Options) -> Result<Self> {
        if vm.is_closed() {
            return Err(Error::Closed);
        }
        if is_loaded(&vm)? || TranslatorRegistry::contains(vm.id()) {
            return Err(Error::AlreadyAttached(vm.id()));
        }

        let translator = Translator::new(vm.clone(), options);
        TranslatorRegistry::register(translator.clone())?;
        if let Err(e) = translator.install(&vm) {
            TranslatorRegistry::remove(vm.id());
            return Err(e);
        }
        tracing::debug!(vm = %vm.id(), "interpreter attached");
        Ok(Self { vm, translator })
    }

    /// Close the VM
    ///
    /// Every handle obtained from this interpreter becomes unavailable.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        let was_open = self.translator.is_available();
        TranslatorRegistry::remove(self.vm.id());
        self.translator.detach();
        self.vm.close();
        if was_open {
            tracing::debug!(vm = %self.vm.id(), "interpreter closed");
        }
    }

    /// Whether [`Interpreter::close`] ran
    pub fn is_closed(&self) -> bool {
        !self.translator.is_available()
    }

    /// Marshalling context
    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }

    /// Main VM state
    pub fn state(&self) -> &Arc<VmState> {
        &self.vm
    }

    /// Run `f` with the stack restored afterwards; [`Error::Closed`] once closed
    fn with_vm<R>(&self, f: impl FnOnce(&VmState) -> Result<R>) -> Result<R> {
        self.translator
            .with_vm(|vm| {
                let _guard = StackGuard::new(vm);
                f(vm)
            })
            .unwrap_or(Err(Error::Closed))
    }

    // ========================================================================
    // Globals
    // ========================================================================

    /// Value at a dotted global path such as `"config.window.width"`
    ///
    /// A missing intermediate table yields nil.
    pub fn get(&self, path: &str) -> Result<HostValue> {
        let segments = split_path(path);
        self.with_vm(|vm| {
            let Some((first, rest)) = segments.split_first() else {
                return Ok(HostValue::Nil);
            };
            vm.get_global(first)?;
            navigate(vm, rest)?;
            self.translator.get(vm, -1)
        })
    }

    /// Assign a dotted global path
    ///
    /// Does nothing when an intermediate table is missing.
    pub fn set(&self, path: &str, value: impl IntoHost) -> Result<()> {
        let value = value.into_host();
        let mut segments = split_path(path);
        let Some(last) = segments.pop() else {
            return Ok(());
        };
        self.with_vm(|vm| {
            let Some((first, middle)) = segments.split_first() else {
                self.translator.push(vm, &value)?;
                vm.set_global(&last)?;
                return Ok(());
            };
            vm.get_global(first)?;
            navigate(vm, middle)?;
            if vm.type_at(-1) == ValueType::Nil {
                tracing::debug!(path, "missing intermediate table, assignment skipped");
                return Ok(());
            }
            self.translator.push(vm, &value)?;
            vm.set_field(-2, &last)?;
            Ok(())
        })
    }

    /// Value at `path` converted to `T`
    pub fn get_as<T: FromHost>(&self, path: &str) -> Result<T> {
        T::from_host(self.get(path)?)
    }

    /// Number at `path`
    pub fn get_number(&self, path: &str) -> Result<Option<Number>> {
        self.get_as(path)
    }

    /// Float at `path`
    pub fn get_f64(&self, path: &str) -> Result<Option<f64>> {
        self.get_as(path)
    }

    /// Integer at `path`
    pub fn get_i64(&self, path: &str) -> Result<Option<i64>> {
        self.get_as(path)
    }

    /// 32-bit integer at `path`
    pub fn get_i32(&self, path: &str) -> Result<Option<i32>> {
        self.get_as(path)
    }

    /// Boolean at `path`
    pub fn get_bool(&self, path: &str) -> Result<Option<bool>> {
        self.get_as(path)
    }

    /// String at `path`
    pub fn get_string(&self, path: &str) -> Result<Option<String>> {
        self.get_as(path)
    }

    /// Table at `path`
    pub fn get_table(&self, path: &str) -> Result<Option<TableRef>> {
        self.get_as(path)
    }

    /// Function at `path`
    pub fn get_function(&self, path: &str) -> Result<Option<FunctionRef>> {
        self.get_as(path)
    }

    /// Userdata at `path`
    pub fn get_userdata(&self, path: &str) -> Result<Option<UserDataRef>> {
        self.get_as(path)
    }

    /// Thread at `path`
    pub fn get_thread(&self, path: &str) -> Result<Option<ThreadRef>> {
        self.get_as(path)
    }

    /// Names of every global, sorted
    pub fn globals(&self) -> Result<Vec<String>> {
        self.with_vm(|vm| {
            vm.push_globals()?;
            let globals = vm.get_top();
            let mut names = Vec::new();
            vm.push_nil()?;
            while vm.next(globals)? {
                if let Some(name) = vm.to_str(-2).filter(|_| vm.type_at(-2) == ValueType::String) {
                    names.push(name.to_string());
                }
                vm.pop(1);
            }
            names.sort();
            Ok(names)
        })
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Fresh empty table
    pub fn new_table(&self) -> Result<TableRef> {
        self.with_vm(|vm| {
            vm.new_table()?;
            let r = self.translator.acquire(vm, -1, RefKind::Table)?;
            Ok(TableRef::from_reference(r))
        })
    }

    /// Fresh empty table stored at `path`
    pub fn new_table_at(&self, path: &str) -> Result<TableRef> {
        let table = self.new_table()?;
        self.set(path, table.clone())?;
        Ok(table)
    }

    /// Fresh userdata wrapping `payload`
    ///
    /// With `with_metatable`, the userdata gets its own empty metatable.
    pub fn new_userdata<T: Any + Send + Sync>(&self, payload: T, with_metatable: bool) -> Result<UserDataRef> {
        self.with_vm(|vm| {
            vm.new_userdata(Box::new(payload))?;
            if with_metatable {
                vm.new_table()?;
                vm.set_metatable(-2)?;
            }
            let r = self.translator.acquire(vm, -1, RefKind::UserData)?;
            Ok(UserDataRef::from_reference(r))
        })
    }

    /// Fresh thread sharing this VM's heap
    pub fn new_thread(&self) -> Result<ThreadRef> {
        self.with_vm(|vm| {
            vm.new_thread()?;
            let r = self.translator.acquire(vm, -1, RefKind::Thread)?;
            Ok(ThreadRef::from_reference(r))
        })
    }

    /// Table `{args..., n = #args}`
    pub fn pack(&self, args: Vec<HostValue>) -> Result<TableRef> {
        let n = args.len() as i64;
        self.with_vm(|vm| {
            self.translator.push(vm, &HostValue::List(args))?;
            vm.push_integer(n)?;
            vm.set_field(-2, "n")?;
            let r = self.translator.acquire(vm, -1, RefKind::Table)?;
            Ok(TableRef::from_reference(r))
        })
    }

    // ========================================================================
    // Host functions
    // ========================================================================

    /// Wrap `adapter` as a function value (not yet pushed)
    pub fn create_function(&self, adapter: CallAdapter) -> FunctionRef {
        FunctionRef::from_native(&self.translator, Arc::new(adapter))
    }

    /// Store `adapter` as a function at `path`
    pub fn register_function(&self, path: &str, adapter: CallAdapter) -> Result<FunctionRef> {
        let func = self.create_function(adapter);
        self.set(path, func.clone())?;
        tracing::debug!(vm = %self.vm.id(), path, "registered host function");
        Ok(func)
    }

    /// Store a typed closure as a function at `path`
    pub fn register_fn<F, Args>(&self, path: &str, f: F) -> Result<FunctionRef>
    where
        F: HostFunction<Args>,
    {
        self.register_function(path, CallAdapter::from_fn(function_name(path), f))
    }

    /// Store an overloaded function at `path`
    pub fn register_overloads(&self, path: &str, signatures: Vec<Signature>) -> Result<FunctionRef> {
        self.register_function(path, CallAdapter::new(function_name(path), None, signatures))
    }

    /// Store a method bound to `target` at `path`
    ///
    /// Callables reach the instance through
    /// [`CallContext::target`](crate::method::CallContext::target).
    pub fn register_method(&self, path: &str, target: HostObject, signatures: Vec<Signature>) -> Result<FunctionRef> {
        self.register_function(path, CallAdapter::new(function_name(path), Some(target), signatures))
    }

    /// Wrap overloads (optionally bound to `target`) as a function value
    pub fn register_callable(&self, target: Option<HostObject>, signatures: Vec<Signature>) -> FunctionRef {
        let name = target.as_ref().map_or("function", HostObject::type_name);
        self.create_function(CallAdapter::new(name, target, signatures))
    }

    // ========================================================================
    // Chunks and calls
    // ========================================================================

    /// Load a chunk as a function without running it
    pub fn load_chunk(
        &self,
        name: &str,
        chunk: impl Fn(&VmState) -> VmResult<usize> + Send + Sync + 'static,
    ) -> Result<FunctionRef> {
        self.with_vm(|vm| {
            vm.load(name, chunk)?;
            let r = self.translator.acquire(vm, -1, RefKind::Function)?;
            Ok(FunctionRef::Interned(r))
        })
    }

    /// Load and run a chunk, returning its results
    pub fn do_chunk(
        &self,
        name: &str,
        chunk: impl Fn(&VmState) -> VmResult<usize> + Send + Sync + 'static,
    ) -> Result<Vec<HostValue>> {
        let func = self.load_chunk(name, chunk)?;
        let results = func.call(&[]);
        func.dispose();
        results
    }

    /// Call `func`, optionally coercing the results
    pub fn call_function(
        &self,
        func: &FunctionRef,
        args: &[HostValue],
        return_types: Option<&[HostType]>,
    ) -> Result<Vec<HostValue>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match return_types {
            Some(types) => func.call_typed(args, types),
            None => func.call(args),
        }
    }

    /// Current stack traceback of the main thread
    pub fn debug_traceback(&self) -> Result<String> {
        self.translator
            .with_vm(|vm| vm.traceback(None, 0))
            .ok_or(Error::Closed)
    }

    // ========================================================================
    // Driver interface
    // ========================================================================

    /// Push `value` onto the main stack, leaving it there
    pub fn push(&self, value: &HostValue) -> Result<()> {
        self.marshal(value)
    }

    /// Pop the top of the main stack
    pub fn pop(&self) -> Result<HostValue> {
        self.translator
            .with_vm(|vm| {
                let value = self.translator.get(vm, -1)?;
                vm.pop(1);
                Ok(value)
            })
            .unwrap_or(Err(Error::Closed))
    }

    /// Push `value` onto the main stack
    pub fn marshal(&self, value: &HostValue) -> Result<()> {
        self.translator
            .with_vm(|vm| self.translator.push(vm, value))
            .unwrap_or(Err(Error::Closed))
    }

    /// Read the value at `index` of the main stack
    pub fn unmarshal(&self, index: i32) -> Result<HostValue> {
        self.translator
            .with_vm(|vm| self.translator.get(vm, index))
            .unwrap_or(Err(Error::Closed))
    }

    /// Pin the value at `index` of the main stack
    pub fn acquire_reference(&self, index: i32) -> Result<Reference> {
        self.translator
            .with_vm(|vm| {
                let kind = match vm.type_at(index) {
                    ValueType::Table => RefKind::Table,
                    ValueType::Function => RefKind::Function,
                    ValueType::UserData => RefKind::UserData,
                    ValueType::LightUserData => RefKind::LightUserData,
                    ValueType::Thread => RefKind::Thread,
                    other => return Err(Error::coercion("reference", other.name())),
                };
                self.translator.acquire(vm, index, kind)
            })
            .unwrap_or(Err(Error::Closed))
    }

    /// Release a slot now or through the deferred queue
    pub fn release_reference(&self, slot: i32, deferred: bool) {
        self.translator.release_reference(slot, deferred)
    }

    /// Dispatch a VM call on `vm` into `adapter`, returning the result count
    pub fn resolve_and_invoke(&self, vm: &VmState, adapter: &CallAdapter) -> Result<usize> {
        self.translator.resolve_and_invoke(vm, adapter)
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("vm", &self.vm.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Whether the registry carries the loaded flag
fn is_loaded(vm: &VmState) -> Result<bool> {
    let _guard = StackGuard::new(vm);
    vm.get_field(REGISTRY_INDEX, LOADED_KEY)?;
    Ok(vm.to_boolean(-1))
}

/// Last segment of a dotted path
fn function_name(path: &str) -> String {
    split_path(path).pop().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonbridge_vm::MULTRET;

    #[test]
    fn test_path_get_and_set() {
        let lua = Interpreter::new().unwrap();
        lua.set("answer", 42).unwrap();
        assert_eq!(lua.get_i64("answer").unwrap(), Some(42));

        let config = lua.new_table_at("config").unwrap();
        config.set("window", lua.new_table().unwrap()).unwrap();
        lua.set("config.window.width", 800).unwrap();
        assert_eq!(lua.get_i32("config.window.width").unwrap(), Some(800));

        // missing intermediates
        lua.set("nope.x", 1).unwrap();
        assert_eq!(lua.get("nope.x").unwrap(), HostValue::Nil);
        assert_eq!(lua.get("config.missing.deep").unwrap(), HostValue::Nil);
    }

    #[test]
    fn test_escaped_dot_in_key() {
        let lua = Interpreter::new().unwrap();
        let t = lua.new_table_at("t").unwrap();
        lua.set(r"t.a\.b", "dotted").unwrap();
        assert_eq!(t.get("a.b").unwrap(), HostValue::String("dotted".into()));
        assert_eq!(lua.get_string(r"t.a\.b").unwrap(), Some("dotted".into()));
    }

    #[test]
    fn test_second_attach_fails() {
        let lua = Interpreter::new().unwrap();
        let err = Interpreter::attach(lua.state().clone(), Options::default()).unwrap_err();
        assert!(matches!(err, Error::AlreadyAttached(id) if id == lua.state().id()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let lua = Interpreter::new().unwrap();
        let id = lua.state().id();
        assert!(TranslatorRegistry::contains(id));
        lua.close();
        lua.close();
        assert!(lua.is_closed());
        assert!(!TranslatorRegistry::contains(id));
        assert!(matches!(lua.get("x"), Err(Error::Closed)));
    }

    #[test]
    fn test_globals_sorted() {
        let lua = Interpreter::with_options(Options::default().without_libs()).unwrap();
        lua.set("zeta", 1).unwrap();
        lua.set("alpha", 2).unwrap();
        assert_eq!(lua.globals().unwrap(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_pack_sets_count() {
        let lua = Interpreter::new().unwrap();
        let t = lua.pack(vec![HostValue::Int(1), HostValue::Nil, HostValue::Int(3)]).unwrap();
        assert_eq!(t.get("n").unwrap(), HostValue::Int(3));
        assert_eq!(t.get(3).unwrap(), HostValue::Int(3));
    }

    #[test]
    fn test_register_and_call_from_chunk() {
        let lua = Interpreter::new().unwrap();
        lua.new_table_at("math2").unwrap();
        lua.register_fn("math2.add", |a: i64, b: i64| a + b).unwrap();

        let out = lua
            .do_chunk("main", |vm| {
                vm.get_global("math2")?;
                vm.get_field(-1, "add")?;
                vm.push_integer(2)?;
                vm.push_integer(40)?;
                vm.call(2, MULTRET)?;
                Ok(1)
            })
            .unwrap();
        assert_eq!(out, vec![HostValue::Int(42)]);
    }

    #[test]
    fn test_push_and_pop() {
        let lua = Interpreter::new().unwrap();
        lua.push(&HostValue::String("x".into())).unwrap();
        assert_eq!(lua.state().get_top(), 1);
        assert_eq!(lua.pop().unwrap(), HostValue::String("x".into()));
        assert_eq!(lua.state().get_top(), 0);
    }

    #[test]
    fn test_acquire_reference_rejects_scalars() {
        let lua = Interpreter::new().unwrap();
        lua.push(&HostValue::Int(1)).unwrap();
        assert!(matches!(lua.acquire_reference(-1), Err(Error::Coercion { .. })));
        lua.pop().unwrap();

        lua.new_table_at("t").unwrap();
        lua.state().get_global("t").unwrap();
        let r = lua.acquire_reference(-1).unwrap();
        assert_eq!(r.kind(), RefKind::Table);
        lua.pop().unwrap();
        r.dispose();

        // a slot handed out to the driver directly
        let vm = lua.state();
        vm.new_table().unwrap();
        let slot = vm.create_ref().unwrap();
        lua.release_reference(slot, true);
        assert_eq!(lua.translator().pending_releases(), 1);
        lua.get("t").unwrap();
        assert_eq!(lua.translator().pending_releases(), 0);
    }
}
