//! Call adapters and the native trampoline
//!
//! A [`CallAdapter`] is built once per registered host function. The VM
//! sees it as a native closure (the trampoline) that captures nothing but
//! the adapter; the translator is looked up by VM identity on every call.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use moonbridge_vm::{VmError, VmResult, VmState};

use super::signature::{HostFunction, Signature};
use crate::error::{Error, Result};
use crate::translator::{Translator, TranslatorRegistry};
use crate::value::{HostObject, HostValue};

/// A host function with its overloads
pub struct CallAdapter {
    name: String,
    target: Option<HostObject>,
    candidates: Vec<Signature>,
}

impl CallAdapter {
    /// Create an adapter
    ///
    /// `target` is the instance bound methods operate on; candidates are
    /// tried in registration order.
    pub fn new(name: impl Into<String>, target: Option<HostObject>, candidates: Vec<Signature>) -> Self {
        Self {
            name: name.into(),
            target,
            candidates,
        }
    }

    /// Adapter with a single typed closure
    pub fn from_fn<F, Args>(name: impl Into<String>, f: F) -> Self
    where
        F: HostFunction<Args>,
    {
        Self::new(name, None, vec![f.into_signature()])
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound instance
    pub fn target(&self) -> Option<&HostObject> {
        self.target.as_ref()
    }

    /// Overloads in registration order
    pub fn candidates(&self) -> &[Signature] {
        &self.candidates
    }

    /// Run candidate `index`, turning a panic into an error
    pub(crate) fn invoke(
        &self,
        index: usize,
        ctx: &CallContext<'_>,
        args: Vec<HostValue>,
    ) -> Result<Vec<HostValue>> {
        let Some(signature) = self.candidates.get(index) else {
            return Err(Error::runtime(format!(
                "overload {} of '{}' does not exist",
                index, self.name
            )));
        };
        match catch_unwind(AssertUnwindSafe(|| signature.call(ctx, args))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(function = %self.name, %message, "host function panicked");
                Err(Error::runtime(format!(
                    "host function '{}' panicked: {}",
                    self.name, message
                )))
            }
        }
    }
}

impl fmt::Debug for CallAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallAdapter")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("candidates", &self.candidates)
            .finish()
    }
}

/// What a host callable sees of the call in progress
pub struct CallContext<'a> {
    translator: &'a Arc<Translator>,
    vm: &'a VmState,
    adapter: &'a CallAdapter,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(translator: &'a Arc<Translator>, vm: &'a VmState, adapter: &'a CallAdapter) -> Self {
        Self {
            translator,
            vm,
            adapter,
        }
    }

    /// Translator of the calling VM
    pub fn translator(&self) -> &Arc<Translator> {
        self.translator
    }

    /// Calling VM state (the thread the call runs on)
    pub fn vm(&self) -> &VmState {
        self.vm
    }

    /// Name of the called function
    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    /// Bound instance
    pub fn target(&self) -> Option<&HostObject> {
        self.adapter.target()
    }

    /// Bound instance as `T`
    pub fn target_as<T: Any>(&self) -> Option<&T> {
        self.target().and_then(HostObject::downcast_ref::<T>)
    }
}

/// Push `adapter` onto `vm` as a native closure
pub(crate) fn push_trampoline(vm: &VmState, adapter: Arc<CallAdapter>) -> VmResult<()> {
    let name = adapter.name().to_string();
    vm.push_native(&name, move |state| dispatch(state, &adapter))
}

/// Trampoline body: find the translator and run the overload
fn dispatch(state: &VmState, adapter: &CallAdapter) -> VmResult<usize> {
    let Some(translator) = TranslatorRegistry::find(state.id()) else {
        return Err(VmError::runtime(format!(
            "no translator attached to {}",
            state.id()
        )));
    };
    translator
        .resolve_and_invoke(state, adapter)
        .map_err(|err| translator.raise(state, err))
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
