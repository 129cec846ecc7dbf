//! Function proxies
//!
//! A [`FunctionRef`] is either a function already living in the VM
//! (interned, backed by a registry slot) or a host function that has not
//! been pushed yet. The latter is turned into a fresh VM closure each time
//! it is marshalled.

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::method::{CallAdapter, HostType};
use crate::reference::Reference;
use crate::translator::Translator;
use crate::value::HostValue;

/// A host function not yet interned into the VM
#[derive(Clone)]
pub struct NativeFunction {
    translator: Arc<Translator>,
    adapter: Arc<CallAdapter>,
}

impl NativeFunction {
    /// Adapter run when the VM calls the function
    pub fn adapter(&self) -> &Arc<CallAdapter> {
        &self.adapter
    }

    /// Translator the function is bound to
    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }
}

/// Handle to a callable value
#[derive(Clone)]
pub enum FunctionRef {
    /// A function pinned in the VM registry
    Interned(Reference),
    /// A host function, pushed as a closure when marshalled
    Native(NativeFunction),
}

impl FunctionRef {
    /// Wrap a host function for `translator`
    pub fn from_native(translator: &Arc<Translator>, adapter: Arc<CallAdapter>) -> Self {
        FunctionRef::Native(NativeFunction {
            translator: translator.clone(),
            adapter,
        })
    }

    /// Owning translator
    pub fn translator(&self) -> &Arc<Translator> {
        match self {
            FunctionRef::Interned(r) => r.translator(),
            FunctionRef::Native(n) => &n.translator,
        }
    }

    /// Underlying reference of an interned function
    pub fn reference(&self) -> Option<&Reference> {
        match self {
            FunctionRef::Interned(r) => Some(r),
            FunctionRef::Native(_) => None,
        }
    }

    /// Whether the function can still be called
    pub fn is_available(&self) -> bool {
        match self {
            FunctionRef::Interned(r) => r.is_available(),
            FunctionRef::Native(n) => n.translator.is_available(),
        }
    }

    /// Release the slot of an interned function
    pub fn dispose(&self) {
        if let FunctionRef::Interned(r) = self {
            r.dispose();
        }
    }

    /// Call in protected mode, returning every result in order
    ///
    /// A disposed handle or a closed VM yields no results.
    pub fn call(&self, args: &[HostValue]) -> Result<Vec<HostValue>> {
        if let FunctionRef::Interned(r) = self {
            if r.is_disposed() {
                return Ok(Vec::new());
            }
        }
        let translator = self.translator();
        translator
            .with_vm(|vm| translator.call_function(vm, self, args))
            .unwrap_or(Ok(Vec::new()))
    }

    /// Call and coerce result `i` to `return_types[i]`
    ///
    /// Results beyond `return_types` are passed through unchanged.
    pub fn call_typed(&self, args: &[HostValue], return_types: &[HostType]) -> Result<Vec<HostValue>> {
        let results = self.call(args)?;
        coerce_results(results, return_types)
    }

    /// The VM's string form of the function
    pub fn to_display_string(&self) -> String {
        match self {
            FunctionRef::Interned(r) => r.to_display_string(),
            FunctionRef::Native(n) => format!("function: {}", n.adapter.name()),
        }
    }
}

/// Coerce each result to the requested type
pub(crate) fn coerce_results(results: Vec<HostValue>, types: &[HostType]) -> Result<Vec<HostValue>> {
    results
        .into_iter()
        .enumerate()
        .map(|(i, value)| match types.get(i) {
            Some(ty) => ty
                .extract(&value)
                .map(|(v, _)| v)
                .ok_or_else(|| Error::coercion(ty, value.type_name())),
            None => Ok(value),
        })
        .collect()
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &FunctionRef) -> bool {
        match (self, other) {
            (FunctionRef::Interned(a), FunctionRef::Interned(b)) => a == b,
            (FunctionRef::Native(a), FunctionRef::Native(b)) => Arc::ptr_eq(&a.adapter, &b.adapter),
            _ => false,
        }
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionRef::Interned(r) => write!(f, "FunctionRef({})", r.slot()),
            FunctionRef::Native(n) => write!(f, "FunctionRef(native {})", n.adapter.name()),
        }
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}
