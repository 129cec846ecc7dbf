//! VM state: the handle hosts program against
//!
//! A [`VmState`] is one thread of execution (a value stack plus call
//! frames) over a shared heap. The heap owns the registry, the globals
//! table and the reference-slot allocator; threads created with
//! [`VmState::new_thread`] share it and therefore share the [`VmId`].
//!
//! All methods take `&self`. Internal locks are held for one primitive
//! operation at a time and never while a native function runs, so native
//! functions may call back into the same state (nested re-entrancy).

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::function::Function;
use crate::stack::{CallFrame, Stack, DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STACK_SIZE};
use crate::table::{Table, TableHandle};
use crate::userdata::UserData;
use crate::value::{Value, ValueType};
use crate::{stdlib, ErrorValue, VmError, VmResult};

/// Pseudo-index addressing the registry table
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Request every result of a call
pub const MULTRET: i32 = -1;

/// Reference returned by [`VmState::create_ref`] for nil values
pub const REF_NIL: i32 = -1;

/// Maximum length of an `__index` / `__newindex` chain
const MAX_META_CHAIN: usize = 100;

/// Process-unique identity of one VM heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(u64);

impl VmId {
    /// Allocate a fresh identity
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        VmId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

/// Outcome of a protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Success
    Ok,
    /// Runtime error
    ErrRun,
    /// Out of stack or call depth
    ErrMem,
    /// Error while running the message handler
    ErrErr,
}

impl Status {
    /// Whether the call succeeded
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// VM configuration
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Maximum number of stack slots per thread
    pub max_stack: usize,

    /// Maximum nesting of calls per thread
    pub max_call_depth: usize,

    /// Open the `base`, `table` and `debug` libraries on creation
    pub open_libs: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack: DEFAULT_MAX_STACK_SIZE,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            open_libs: true,
        }
    }
}

impl VmOptions {
    /// Options for a bare VM without libraries
    pub fn bare() -> Self {
        Self {
            open_libs: false,
            ..Default::default()
        }
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

    /// Choose whether the standard library is opened on creation
    pub fn with_libs(mut self, open_libs: bool) -> Self {
        self.open_libs = open_libs;
        self
    }
}

/// State shared by every thread of one VM
struct Heap {
    id: VmId,
    registry: TableHandle,
    globals: TableHandle,
    free_refs: Mutex<Vec<i32>>,
    next_ref: AtomicI32,
    closed: AtomicBool,
    options: VmOptions,
}

/// One thread of execution over a VM heap
pub struct VmState {
    heap: Arc<Heap>,
    stack: Mutex<Stack>,
    main: bool,
}

impl VmState {
    /// Create a VM with default options
    pub fn new() -> Arc<Self> {
        Self::with_options(VmOptions::default())
    }

    /// Create a VM
    pub fn with_options(options: VmOptions) -> Arc<Self> {
        let heap = Arc::new(Heap {
            id: VmId::new(),
            registry: TableHandle::new(),
            globals: TableHandle::new(),
            free_refs: Mutex::new(Vec::new()),
            next_ref: AtomicI32::new(1),
            closed: AtomicBool::new(false),
            options,
        });
        let stack = Stack::with_limits(heap.options.max_stack, heap.options.max_call_depth);
        let state = Arc::new(VmState {
            heap,
            stack: Mutex::new(stack),
            main: true,
        });

        let _ = state
            .heap
            .registry
            .set(Value::string("_G"), Value::Table(state.heap.globals.clone()));
        if state.heap.options.open_libs {
            stdlib::open_libs(&state);
        }

        tracing::debug!(id = %state.id(), "vm created");
        state
    }

    /// Heap identity (shared by all threads)
    pub fn id(&self) -> VmId {
        self.heap.id
    }

    /// Options the VM was created with
    pub fn options(&self) -> &VmOptions {
        &self.heap.options
    }

    /// Whether this is the thread the VM was created with
    pub fn is_main_thread(&self) -> bool {
        self.main
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.heap.closed.load(Ordering::Acquire)
    }

    /// Close the VM: drop the registry, the globals and this thread's stack
    pub fn close(&self) {
        if self.heap.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let registry = std::mem::take(&mut *self.heap.registry.lock());
        let globals = std::mem::take(&mut *self.heap.globals.lock());
        self.stack.lock().clear();
        self.heap.free_refs.lock().clear();
        drop(registry);
        drop(globals);
        tracing::debug!(id = %self.id(), "vm closed");
    }

    // ========================================================================
    // Stack Manipulation
    // ========================================================================

    /// Number of values in the current frame
    pub fn get_top(&self) -> i32 {
        self.stack.lock().top() as i32
    }

    /// Grow (with nils) or shrink the current frame
    pub fn set_top(&self, idx: i32) -> VmResult<()> {
        self.stack.lock().set_top(idx)
    }

    /// Pop `n` values
    pub fn pop(&self, n: usize) {
        let mut stack = self.stack.lock();
        let target = stack.len().saturating_sub(n).max(stack.base());
        stack.truncate(target);
    }

    /// Pop and return the top value
    pub fn pop_value(&self) -> Value {
        self.stack.lock().pop()
    }

    /// Convert a relative index into an absolute one
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            self.get_top() + idx + 1
        }
    }

    /// Whether `n` more values can be pushed
    pub fn check_stack(&self, n: usize) -> bool {
        self.stack.lock().has_room(n)
    }

    /// Value at an index (nil for invalid indices)
    pub fn value_at(&self, idx: i32) -> Value {
        if idx == REGISTRY_INDEX {
            return Value::Table(self.heap.registry.clone());
        }
        self.stack.lock().get(idx).cloned().unwrap_or_default()
    }

    /// Type at an index (`ValueType::None` for invalid indices)
    pub fn type_at(&self, idx: i32) -> ValueType {
        if idx == REGISTRY_INDEX {
            return ValueType::Table;
        }
        self.stack
            .lock()
            .get(idx)
            .map(Value::type_of)
            .unwrap_or(ValueType::None)
    }

    /// Push a copy of the value at `idx`
    pub fn push_copy(&self, idx: i32) -> VmResult<()> {
        let v = self.value_at(idx);
        self.push_value(v)
    }

    /// Move the top value into `idx`
    pub fn insert(&self, idx: i32) {
        self.stack.lock().insert(idx);
    }

    /// Remove the value at `idx`
    pub fn remove(&self, idx: i32) {
        self.stack.lock().remove(idx);
    }

    /// Pop the top value into `idx`
    pub fn replace(&self, idx: i32) {
        let mut stack = self.stack.lock();
        let Some(slot) = stack.slot_of(idx) else {
            return;
        };
        let v = stack.pop();
        stack.set_abs(slot, v);
    }

    /// Move `n` values from the top of this thread onto `to`
    pub fn xmove(&self, to: &VmState, n: usize) -> VmResult<()> {
        let values = {
            let mut stack = self.stack.lock();
            let from = stack.len().saturating_sub(n).max(stack.base());
            stack.split_off(from)
        };
        let mut target = to.stack.lock();
        for v in values {
            target.push(v)?;
        }
        Ok(())
    }

    // ========================================================================
    // Push / Read
    // ========================================================================

    /// Push any value
    pub fn push_value(&self, value: Value) -> VmResult<()> {
        self.stack.lock().push(value)
    }

    /// Push nil
    pub fn push_nil(&self) -> VmResult<()> {
        self.push_value(Value::Nil)
    }

    /// Push a boolean
    pub fn push_boolean(&self, b: bool) -> VmResult<()> {
        self.push_value(Value::Boolean(b))
    }

    /// Push an integer
    pub fn push_integer(&self, i: i64) -> VmResult<()> {
        self.push_value(Value::Integer(i))
    }

    /// Push a float
    pub fn push_number(&self, n: f64) -> VmResult<()> {
        self.push_value(Value::Number(n))
    }

    /// Push a string
    pub fn push_string(&self, s: &str) -> VmResult<()> {
        self.push_value(Value::string(s))
    }

    /// Push a light userdata token
    pub fn push_light_userdata(&self, p: usize) -> VmResult<()> {
        self.push_value(Value::LightUserData(p))
    }

    /// Push a function
    pub fn push_function(&self, f: Function) -> VmResult<()> {
        self.push_value(Value::Function(Arc::new(f)))
    }

    /// Push a named native closure
    pub fn push_native(
        &self,
        name: &str,
        f: impl Fn(&VmState) -> VmResult<usize> + Send + Sync + 'static,
    ) -> VmResult<()> {
        self.push_function(Function::named(name, f))
    }

    /// Push the globals table
    pub fn push_globals(&self) -> VmResult<()> {
        self.push_value(Value::Table(self.heap.globals.clone()))
    }

    /// Load a chunk: pushes it as a callable function
    pub fn load(
        &self,
        name: &str,
        chunk: impl Fn(&VmState) -> VmResult<usize> + Send + Sync + 'static,
    ) -> VmResult<()> {
        self.push_function(Function::named(name, chunk))
    }

    /// Truthiness of the value at `idx`
    pub fn to_boolean(&self, idx: i32) -> bool {
        self.value_at(idx).is_truthy()
    }

    /// Integer at `idx` (with float/string conversion)
    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        self.value_at(idx).as_integer()
    }

    /// Float at `idx` (with integer/string conversion)
    pub fn to_number(&self, idx: i32) -> Option<f64> {
        self.value_at(idx).as_number()
    }

    /// String at `idx` (numbers are converted)
    pub fn to_str(&self, idx: i32) -> Option<Arc<str>> {
        self.value_at(idx).as_str()
    }

    /// Whether the value at `idx` is stored as an integer
    pub fn is_integer(&self, idx: i32) -> bool {
        matches!(self.value_at(idx), Value::Integer(_))
    }

    /// Userdata at `idx`
    pub fn to_userdata(&self, idx: i32) -> Option<Arc<UserData>> {
        match self.value_at(idx) {
            Value::UserData(u) => Some(u),
            _ => None,
        }
    }

    /// Thread at `idx`
    pub fn to_thread(&self, idx: i32) -> Option<Arc<VmState>> {
        match self.value_at(idx) {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    /// Raw length: table border, string byte length, 0 otherwise
    pub fn raw_len(&self, idx: i32) -> usize {
        match self.value_at(idx) {
            Value::Table(t) => t.len(),
            Value::String(s) => s.len(),
            _ => 0,
        }
    }

    /// Primitive equality of two indices
    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        let (va, vb) = (self.value_at(a), self.value_at(b));
        if matches!(self.type_at(a), ValueType::None) || matches!(self.type_at(b), ValueType::None) {
            return false;
        }
        va.raw_equals(&vb)
    }

    /// Equality of two indices honoring `__eq`
    pub fn compare_equal(&self, a: i32, b: i32) -> VmResult<bool> {
        if matches!(self.type_at(a), ValueType::None) || matches!(self.type_at(b), ValueType::None) {
            return Ok(false);
        }
        self.values_equal(&self.value_at(a), &self.value_at(b))
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Push a new empty table
    pub fn new_table(&self) -> VmResult<()> {
        self.push_value(Value::Table(TableHandle::new()))
    }

    /// Push a new table with preallocated parts
    pub fn create_table(&self, narr: usize, nrec: usize) -> VmResult<()> {
        self.push_value(Value::Table(TableHandle::from_table(Table::with_capacity(
            narr, nrec,
        ))))
    }

    /// `t[k]` with metamethods, where `t` is at `idx` and `k` is popped
    pub fn get_table(&self, idx: i32) -> VmResult<ValueType> {
        let t = self.value_at(idx);
        let key = self.pop_value();
        let v = self.index_value(&t, &key)?;
        let ty = v.type_of();
        self.push_value(v)?;
        Ok(ty)
    }

    /// `t[name]` with metamethods
    pub fn get_field(&self, idx: i32, name: &str) -> VmResult<ValueType> {
        let t = self.value_at(idx);
        let v = self.index_value(&t, &Value::string(name))?;
        let ty = v.type_of();
        self.push_value(v)?;
        Ok(ty)
    }

    /// `t[k] = v` with metamethods, where `t` is at `idx` and `v`, `k` are
    /// popped
    pub fn set_table(&self, idx: i32) -> VmResult<()> {
        let t = self.value_at(idx);
        let value = self.pop_value();
        let key = self.pop_value();
        self.new_index_value(&t, key, value)
    }

    /// `t[name] = v` with metamethods, `v` popped
    pub fn set_field(&self, idx: i32, name: &str) -> VmResult<()> {
        let t = self.value_at(idx);
        let value = self.pop_value();
        self.new_index_value(&t, Value::string(name), value)
    }

    /// Raw `t[k]`, `k` popped
    pub fn raw_get(&self, idx: i32) -> VmResult<ValueType> {
        let t = self.table_at(idx)?;
        let key = self.pop_value();
        let v = t.get(&key);
        let ty = v.type_of();
        self.push_value(v)?;
        Ok(ty)
    }

    /// Raw `t[n]`
    pub fn raw_get_i(&self, idx: i32, n: i64) -> VmResult<ValueType> {
        let t = self.table_at(idx)?;
        let v = t.lock().get_int(n);
        let ty = v.type_of();
        self.push_value(v)?;
        Ok(ty)
    }

    /// Raw `t[k] = v`, `v` and `k` popped
    pub fn raw_set(&self, idx: i32) -> VmResult<()> {
        let t = self.table_at(idx)?;
        let value = self.pop_value();
        let key = self.pop_value();
        t.set(key, value)
    }

    /// Raw `t[n] = v`, `v` popped
    pub fn raw_set_i(&self, idx: i32, n: i64) -> VmResult<()> {
        let t = self.table_at(idx)?;
        let value = self.pop_value();
        t.set(Value::Integer(n), value)
    }

    /// Traversal: pops a key, pushes the next key and value. Returns false
    /// (pushing nothing) at the end.
    pub fn next(&self, idx: i32) -> VmResult<bool> {
        let t = self.table_at(idx)?;
        let key = self.pop_value();
        let entry = t.lock().next(&key)?;
        match entry {
            Some((k, v)) => {
                self.push_value(k)?;
                self.push_value(v)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or nil) and make it the metatable of the value at `idx`
    pub fn set_metatable(&self, idx: i32) -> VmResult<()> {
        let target = self.value_at(idx);
        let mt = match self.pop_value() {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => {
                return Err(VmError::runtime(format!(
                    "metatable must be a table, got {}",
                    other.type_of()
                )))
            }
        };
        match target {
            Value::Table(t) => t.lock().set_metatable(mt),
            Value::UserData(u) => u.set_metatable(mt),
            other => {
                return Err(VmError::runtime(format!(
                    "cannot set the metatable of a {} value",
                    other.type_of()
                )))
            }
        }
        Ok(())
    }

    /// Push the metatable of the value at `idx`; false if it has none
    pub fn get_metatable(&self, idx: i32) -> VmResult<bool> {
        match metatable_of(&self.value_at(idx)) {
            Some(mt) => {
                self.push_value(Value::Table(mt))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Push a metatable field of the value at `idx`; false if absent
    pub fn get_metafield(&self, idx: i32, event: &str) -> VmResult<bool> {
        match metafield_of(&self.value_at(idx), event) {
            Some(v) => {
                self.push_value(v)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ========================================================================
    // Globals and Registry
    // ========================================================================

    /// Push the global `name`
    pub fn get_global(&self, name: &str) -> VmResult<ValueType> {
        let g = Value::Table(self.heap.globals.clone());
        let v = self.index_value(&g, &Value::string(name))?;
        let ty = v.type_of();
        self.push_value(v)?;
        Ok(ty)
    }

    /// Pop a value into the global `name`
    pub fn set_global(&self, name: &str) -> VmResult<()> {
        let g = Value::Table(self.heap.globals.clone());
        let value = self.pop_value();
        self.new_index_value(&g, Value::string(name), value)
    }

    /// Pop a value into a fresh registry slot. Nil yields [`REF_NIL`].
    pub fn create_ref(&self) -> VmResult<i32> {
        let v = self.pop_value();
        if v.is_nil() {
            return Ok(REF_NIL);
        }
        let slot = match self.heap.free_refs.lock().pop() {
            Some(slot) => slot,
            None => self.heap.next_ref.fetch_add(1, Ordering::Relaxed),
        };
        self.heap.registry.set(Value::Integer(slot as i64), v)?;
        Ok(slot)
    }

    /// Release a registry slot for reuse
    pub fn release_ref(&self, slot: i32) {
        if slot <= 0 || self.is_closed() {
            return;
        }
        if self.heap.registry.set(Value::Integer(slot as i64), Value::Nil).is_ok() {
            self.heap.free_refs.lock().push(slot);
        }
    }

    /// Push the value held in a registry slot (nil for released slots)
    pub fn push_ref(&self, slot: i32) -> VmResult<()> {
        let v = if slot > 0 {
            self.heap.registry.lock().get_int(slot as i64)
        } else {
            Value::Nil
        };
        self.push_value(v)
    }

    // ========================================================================
    // Userdata and Threads
    // ========================================================================

    /// Push a new full userdata wrapping `payload`
    pub fn new_userdata(&self, payload: Box<dyn Any + Send + Sync>) -> VmResult<Arc<UserData>> {
        let ud = Arc::new(UserData::new(payload));
        self.push_value(Value::UserData(ud.clone()))?;
        Ok(ud)
    }

    /// Push a new thread sharing this heap
    pub fn new_thread(&self) -> VmResult<Arc<VmState>> {
        let opts = &self.heap.options;
        let thread = Arc::new(VmState {
            heap: self.heap.clone(),
            stack: Mutex::new(Stack::with_limits(opts.max_stack, opts.max_call_depth)),
            main: false,
        });
        self.push_value(Value::Thread(thread.clone()))?;
        Ok(thread)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call the function below the top `nargs` values. Errors propagate.
    ///
    /// On success the function and arguments are replaced by `nresults`
    /// results (all of them for [`MULTRET`]).
    pub fn call(&self, nargs: usize, nresults: i32) -> VmResult<()> {
        let (callee, func_pos) = {
            let stack = self.stack.lock();
            let len = stack.len();
            if len < nargs + 1 || len - nargs - 1 < stack.base() {
                return Err(VmError::runtime("not enough values on the stack for call"));
            }
            let pos = len - nargs - 1;
            (stack.get_abs(pos).cloned().unwrap_or_default(), pos)
        };
        let func = match self.resolve_callable(callee, func_pos) {
            Ok(f) => f,
            Err(e) => return Err(self.handle_error(e)),
        };
        self.invoke(func, func_pos, nresults)
    }

    /// Protected call: errors are caught and their value left on the stack
    ///
    /// `msgh` is the index of a message handler (0 for none) which receives
    /// the error value while the failing frames are still active.
    pub fn pcall(&self, nargs: usize, nresults: i32, msgh: i32) -> Status {
        let handler = (msgh != 0).then(|| self.value_at(msgh));
        let (func_pos, depth, handler_depth) = {
            let mut stack = self.stack.lock();
            let func_pos = stack.len().saturating_sub(nargs + 1);
            let depth = stack.frame_count();
            let handler_depth = stack.handler_depth();
            stack.push_handler(handler);
            (func_pos, depth, handler_depth)
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.call(nargs, nresults)));

        let mut stack = self.stack.lock();
        stack.truncate_handlers(handler_depth);
        let (status, error) = match outcome {
            Ok(Ok(())) => return Status::Ok,
            Ok(Err(err)) => {
                let status = match err {
                    VmError::Runtime(_) => Status::ErrRun,
                    VmError::StackOverflow => Status::ErrMem,
                    VmError::Handler(_) => Status::ErrErr,
                };
                (status, err.to_value())
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::warn!(id = %self.heap.id, message = %msg, "native function panicked");
                (Status::ErrRun, Value::string(format!("native panic: {}", msg)))
            }
        };
        stack.truncate_frames(depth);
        stack.truncate(func_pos);
        let _ = stack.push(error);
        status
    }

    fn resolve_callable(&self, callee: Value, func_pos: usize) -> VmResult<Arc<Function>> {
        match callee {
            Value::Function(f) => Ok(f),
            other => match metafield_of(&other, "__call") {
                Some(Value::Function(f)) => {
                    self.stack
                        .lock()
                        .insert_abs(func_pos, Value::Function(f.clone()))?;
                    Ok(f)
                }
                _ => Err(VmError::runtime(format!(
                    "attempt to call a {} value",
                    other.type_of()
                ))),
            },
        }
    }

    fn invoke(&self, func: Arc<Function>, func_pos: usize, nresults: i32) -> VmResult<()> {
        self.stack.lock().push_frame(CallFrame {
            func_pos,
            base: func_pos + 1,
            name: func.name().cloned(),
        })?;

        let outcome = match func.invoke(self) {
            Err(e) if !e.is_handled() => Err(self.handle_error(e)),
            other => other,
        };

        let mut stack = self.stack.lock();
        stack.pop_frame();
        match outcome {
            Ok(n) => {
                let first = stack.len().saturating_sub(n).max(func_pos + 1);
                let mut results = stack.split_off(first);
                stack.truncate(func_pos);
                if nresults >= 0 {
                    results.resize(nresults as usize, Value::Nil);
                }
                for v in results {
                    stack.push(v)?;
                }
                Ok(())
            }
            Err(e) => {
                stack.truncate(func_pos);
                Err(e)
            }
        }
    }

    /// Run the innermost message handler on `err` (if any)
    fn handle_error(&self, err: VmError) -> VmError {
        let handler = self.stack.lock().current_handler();
        let Some(handler) = handler else {
            return err;
        };

        self.stack.lock().push_handler(None);
        let base = self.stack.lock().len();
        let result = (|| -> VmResult<Value> {
            self.push_value(handler)?;
            self.push_value(err.to_value())?;
            self.call(1, 1)?;
            Ok(self.pop_value())
        })();
        {
            let mut stack = self.stack.lock();
            stack.pop_handler();
            stack.truncate(base);
        }

        match result {
            Ok(v) => VmError::Runtime(ErrorValue::mark_handled(v)),
            Err(e) => VmError::Handler(ErrorValue::mark_handled(e.to_value())),
        }
    }

    /// Call `f` with `args`, returning its results
    pub fn call_value(&self, f: Value, args: &[Value], nresults: i32) -> VmResult<Vec<Value>> {
        let base = self.stack.lock().len();
        let outcome = (|| -> VmResult<()> {
            self.push_value(f)?;
            for a in args {
                self.push_value(a.clone())?;
            }
            self.call(args.len(), nresults)
        })();
        let mut stack = self.stack.lock();
        match outcome {
            Ok(()) => Ok(stack.split_off(base)),
            Err(e) => {
                stack.truncate(base);
                Err(e)
            }
        }
    }

    // ========================================================================
    // Metamethod-aware Operations
    // ========================================================================

    /// `obj[key]` honoring `__index`
    pub fn index_value(&self, obj: &Value, key: &Value) -> VmResult<Value> {
        let mut current = obj.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    let v = t.get(key);
                    if !v.is_nil() {
                        return Ok(v);
                    }
                    match metafield_of(&current, "__index") {
                        Some(h) => h,
                        None => return Ok(Value::Nil),
                    }
                }
                other => match metafield_of(other, "__index") {
                    Some(h) => h,
                    None => {
                        return Err(VmError::runtime(format!(
                            "attempt to index a {} value",
                            other.type_of()
                        )))
                    }
                },
            };
            if let Value::Function(_) = handler {
                let mut results = self.call_value(handler, &[current, key.clone()], 1)?;
                return Ok(results.pop().unwrap_or_default());
            }
            current = handler;
        }
        Err(VmError::runtime("'__index' chain too long; possible loop"))
    }

    /// `obj[key] = value` honoring `__newindex`
    pub fn new_index_value(&self, obj: &Value, key: Value, value: Value) -> VmResult<()> {
        let mut current = obj.clone();
        for _ in 0..MAX_META_CHAIN {
            let handler = match &current {
                Value::Table(t) => {
                    if !t.get(&key).is_nil() {
                        return t.set(key, value);
                    }
                    match metafield_of(&current, "__newindex") {
                        Some(h) => h,
                        None => return t.set(key, value),
                    }
                }
                other => match metafield_of(other, "__newindex") {
                    Some(h) => h,
                    None => {
                        return Err(VmError::runtime(format!(
                            "attempt to index a {} value",
                            other.type_of()
                        )))
                    }
                },
            };
            if let Value::Function(_) = handler {
                self.call_value(handler, &[current, key, value], 0)?;
                return Ok(());
            }
            current = handler;
        }
        Err(VmError::runtime("'__newindex' chain too long; possible loop"))
    }

    /// Equality honoring `__eq` for tables and userdata
    pub fn values_equal(&self, a: &Value, b: &Value) -> VmResult<bool> {
        if a.raw_equals(b) {
            return Ok(true);
        }
        let same_kind = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_))
        );
        if !same_kind {
            return Ok(false);
        }
        match metafield_of(a, "__eq").or_else(|| metafield_of(b, "__eq")) {
            Some(h) => {
                let mut r = self.call_value(h, &[a.clone(), b.clone()], 1)?;
                Ok(r.pop().map(|v| v.is_truthy()).unwrap_or(false))
            }
            None => Ok(false),
        }
    }

    /// `a < b` for numbers, strings, or via `__lt`
    pub fn less_than(&self, a: &Value, b: &Value) -> VmResult<bool> {
        match (a, b) {
            (Value::Integer(x), Value::Integer(y)) => Ok(x < y),
            (Value::Integer(_) | Value::Number(_), Value::Integer(_) | Value::Number(_)) => {
                Ok(a.as_number().unwrap_or(f64::NAN) < b.as_number().unwrap_or(f64::NAN))
            }
            (Value::String(x), Value::String(y)) => Ok(x.as_bytes() < y.as_bytes()),
            _ => match metafield_of(a, "__lt").or_else(|| metafield_of(b, "__lt")) {
                Some(h) => {
                    let mut r = self.call_value(h, &[a.clone(), b.clone()], 1)?;
                    Ok(r.pop().map(|v| v.is_truthy()).unwrap_or(false))
                }
                None => {
                    let (ta, tb) = (a.type_of(), b.type_of());
                    Err(VmError::runtime(if ta == tb {
                        format!("attempt to compare two {} values", ta)
                    } else {
                        format!("attempt to compare {} with {}", ta, tb)
                    }))
                }
            },
        }
    }

    /// String form honoring `__tostring` and `__name`
    pub fn tostring_value(&self, v: &Value) -> VmResult<String> {
        if let Some(h) = metafield_of(v, "__tostring") {
            let mut r = self.call_value(h, &[v.clone()], 1)?;
            return match r.pop() {
                Some(Value::String(s)) => Ok(s.to_string()),
                Some(n @ (Value::Integer(_) | Value::Number(_))) => Ok(n.to_plain_string()),
                _ => Err(VmError::runtime("'__tostring' must return a string")),
            };
        }
        if let Some(Value::String(name)) = metafield_of(v, "__name") {
            if let Some(addr) = v.address() {
                return Ok(format!("{}: {:#018x}", name, addr));
            }
        }
        Ok(v.to_plain_string())
    }

    /// String form of the value at `idx`
    pub fn to_display_string(&self, idx: i32) -> VmResult<String> {
        let v = self.value_at(idx);
        self.tostring_value(&v)
    }

    // ========================================================================
    // Debug
    // ========================================================================

    /// Stack traceback of the active frames, innermost first, skipping
    /// `level` frames
    pub fn traceback(&self, msg: Option<&str>, level: usize) -> String {
        let stack = self.stack.lock();
        let mut out = String::new();
        if let Some(m) = msg {
            out.push_str(m);
            out.push('\n');
        }
        out.push_str("stack traceback:");
        for frame in stack.frames().iter().rev().skip(level) {
            match &frame.name {
                Some(name) => {
                    out.push_str("\n\t[native]: in function '");
                    out.push_str(name);
                    out.push('\'');
                }
                None => out.push_str("\n\t[native]: in ?"),
            }
        }
        out
    }

    /// Number of active call frames
    pub fn call_depth(&self) -> usize {
        self.stack.lock().frame_count()
    }

    fn table_at(&self, idx: i32) -> VmResult<TableHandle> {
        match self.value_at(idx) {
            Value::Table(t) => Ok(t),
            other => Err(VmError::runtime(format!(
                "table expected, got {}",
                other.type_of()
            ))),
        }
    }
}

impl fmt::Debug for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmState")
            .field("id", &self.heap.id)
            .field("main", &self.main)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Metatable of a table or userdata
pub fn metatable_of(v: &Value) -> Option<TableHandle> {
    match v {
        Value::Table(t) => t.metatable(),
        Value::UserData(u) => u.metatable(),
        _ => None,
    }
}

/// Non-nil metatable field of a value
pub fn metafield_of(v: &Value, event: &str) -> Option<Value> {
    let field = metatable_of(v)?.get_str(event);
    (!field.is_nil()).then_some(field)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_unique() {
        let a = VmId::new();
        let b = VmId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_refs_reuse_slots() {
        let vm = VmState::with_options(VmOptions::bare());
        vm.push_string("a").unwrap();
        let r1 = vm.create_ref().unwrap();
        assert!(r1 > 0);
        vm.release_ref(r1);
        vm.push_string("b").unwrap();
        let r2 = vm.create_ref().unwrap();
        assert_eq!(r1, r2);

        vm.push_ref(r2).unwrap();
        assert_eq!(vm.to_str(-1).as_deref(), Some("b"));
    }

    #[test]
    fn test_ref_nil() {
        let vm = VmState::with_options(VmOptions::bare());
        vm.push_nil().unwrap();
        assert_eq!(vm.create_ref().unwrap(), REF_NIL);
        vm.push_ref(REF_NIL).unwrap();
        assert!(vm.value_at(-1).is_nil());
    }

    #[test]
    fn test_call_adjusts_results() {
        let vm = VmState::with_options(VmOptions::bare());
        vm.push_native("three", |vm| {
            vm.push_integer(1)?;
            vm.push_integer(2)?;
            vm.push_integer(3)?;
            Ok(3)
        })
        .unwrap();
        vm.call(0, 1).unwrap();
        assert_eq!(vm.get_top(), 1);
        assert_eq!(vm.to_integer(1), Some(1));
    }

    #[test]
    fn test_pcall_restores_stack() {
        let vm = VmState::with_options(VmOptions::bare());
        vm.push_integer(99).unwrap();
        vm.push_native("boom", |_| Err(VmError::runtime("boom"))).unwrap();
        vm.push_integer(1).unwrap();
        let status = vm.pcall(1, 0, 0);
        assert_eq!(status, Status::ErrRun);
        assert_eq!(vm.get_top(), 2);
        assert_eq!(vm.to_str(-1).as_deref(), Some("boom"));
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let vm = VmState::new();
        vm.close();
        vm.close();
        assert!(vm.is_closed());
    }
}
