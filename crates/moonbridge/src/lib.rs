//! Moonbridge - host bindings for the moonbridge VM
//!
//! This crate is the marshalling and reference-lifecycle layer between host
//! code and values living inside a [`moonbridge_vm::VmState`]:
//! - [`Reference`]: a registry slot pinning one VM value, released exactly once
//! - [`Number`]: one numeric value over the host's numeric types
//! - [`TableRef`], [`FunctionRef`], [`UserDataRef`], [`ThreadRef`]: typed proxies
//! - [`method`]: overload resolution and dispatch of VM calls into host closures
//! - [`Translator`] / [`TranslatorRegistry`]: the per-VM marshalling context
//! - [`Interpreter`]: the host driver owning one VM
//!
//! # Example
//!
//! ```ignore
//! use moonbridge::{HostValue, Interpreter};
//! use moonbridge_vm::MULTRET;
//!
//! let lua = Interpreter::new()?;
//! lua.register_fn("ping", || "pong")?;
//! let out = lua.do_chunk("main", |vm| {
//!     vm.get_global("ping")?;
//!     vm.call(0, MULTRET)?;
//!     Ok(vm.get_top() as usize)
//! })?;
//! assert_eq!(out, vec![HostValue::String("pong".into())]);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod date;
pub mod error;
pub mod function;
pub mod interpreter;
pub mod method;
pub mod number;
pub mod reference;
pub mod table;
pub mod thread;
pub mod translator;
pub mod userdata;
pub mod value;

pub use config::Options;
pub use date::ScriptDate;
pub use error::{Error, Result, ScriptError};
pub use function::{FunctionRef, NativeFunction};
pub use interpreter::Interpreter;
pub use method::{CallAdapter, CallContext, HostType, Signature};
pub use number::{Number, NumericalType};
pub use reference::{RefKind, Reference};
pub use table::TableRef;
pub use thread::ThreadRef;
pub use translator::{Translator, TranslatorRegistry};
pub use userdata::{LightUserDataRef, UserDataRef};
pub use value::{FromHost, HostObject, HostValue, IntoHost, IntoHostMulti, MultiValue};
