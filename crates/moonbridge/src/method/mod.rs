//! Host functions callable from the VM
//!
//! - [`types`]: the parameter type vocabulary and extraction strategies
//! - [`signature`]: overload signatures, built or inferred from closures
//! - [`resolver`]: overload selection for a VM call
//! - [`adapter`]: the per-function adapter and the native trampoline

pub mod adapter;
pub mod resolver;
pub mod signature;
pub mod types;

pub use adapter::{CallAdapter, CallContext};
pub use resolver::resolve;
pub use signature::{HostCallable, HostFunction, ParamSpec, Signature, SignatureBuilder};
pub use types::{ExtractFn, HostType, Match, ObjectType};

pub(crate) use adapter::push_trampoline;
