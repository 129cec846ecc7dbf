//! Host function signatures
//!
//! A [`Signature`] is one overload: its parameter list, an optional variadic
//! tail and the host callable. Signatures are built explicitly with
//! [`SignatureBuilder`] or inferred from typed closures via [`HostFunction`].

use std::fmt;
use std::sync::Arc;

use super::adapter::CallContext;
use super::types::{ExtractFn, HostType, Match};
use crate::error::Result;
use crate::value::{FromHost, HostValue, IntoHostMulti};

/// Host callable behind a signature
pub type HostCallable =
    Arc<dyn Fn(&CallContext<'_>, Vec<HostValue>) -> Result<Vec<HostValue>> + Send + Sync>;

/// One parameter and its extraction strategy
#[derive(Clone)]
pub struct ParamSpec {
    index: usize,
    ty: HostType,
    extract: ExtractFn,
    is_params_array: bool,
}

impl ParamSpec {
    /// Fixed parameter at position `index`
    pub fn new(index: usize, ty: HostType) -> Self {
        Self {
            index,
            extract: ty.extractor(),
            ty,
            is_params_array: false,
        }
    }

    /// Variadic tail starting at `index`; `elem` is the element type
    pub fn variadic(index: usize, elem: HostType) -> Self {
        Self {
            is_params_array: true,
            ..Self::new(index, elem)
        }
    }

    /// Zero-based position
    pub fn index(&self) -> usize {
        self.index
    }

    /// Parameter (or element) type
    pub fn ty(&self) -> &HostType {
        &self.ty
    }

    /// Whether this is the variadic tail
    pub fn is_params_array(&self) -> bool {
        self.is_params_array
    }

    /// Extract one argument
    pub fn extract(&self, value: &HostValue) -> Option<(HostValue, Match)> {
        (self.extract)(&self.ty, value)
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("index", &self.index)
            .field("ty", &self.ty)
            .field("is_params_array", &self.is_params_array)
            .finish()
    }
}

/// One overload of a host function
#[derive(Clone)]
pub struct Signature {
    params: Vec<ParamSpec>,
    variadic: Option<ParamSpec>,
    callable: HostCallable,
}

impl Signature {
    /// Start building a signature
    pub fn builder() -> SignatureBuilder {
        SignatureBuilder::default()
    }

    /// Infer a signature from a typed closure
    pub fn from_fn<F, Args>(f: F) -> Self
    where
        F: HostFunction<Args>,
    {
        f.into_signature()
    }

    /// Fixed parameters
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Variadic tail
    pub fn variadic(&self) -> Option<&ParamSpec> {
        self.variadic.as_ref()
    }

    /// Number of leading parameters that must be supplied
    ///
    /// Trailing `Optional` parameters may be omitted.
    pub fn required(&self) -> usize {
        let optional_tail = self
            .params
            .iter()
            .rev()
            .take_while(|p| p.ty().is_optional())
            .count();
        self.params.len() - optional_tail
    }

    /// Human readable parameter list, e.g. `(i32, string, ...any)`
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = self.params.iter().map(|p| p.ty().to_string()).collect();
        if let Some(tail) = &self.variadic {
            parts.push(format!("...{}", tail.ty()));
        }
        format!("({})", parts.join(", "))
    }

    pub(crate) fn call(&self, ctx: &CallContext<'_>, args: Vec<HostValue>) -> Result<Vec<HostValue>> {
        (self.callable)(ctx, args)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature{}", self.describe())
    }
}

/// Builder for [`Signature`]
#[derive(Debug, Default)]
pub struct SignatureBuilder {
    params: Vec<HostType>,
    variadic: Option<HostType>,
}

impl SignatureBuilder {
    /// Append a parameter
    pub fn param(mut self, ty: HostType) -> Self {
        self.params.push(ty);
        self
    }

    /// Append several parameters
    pub fn params(mut self, tys: impl IntoIterator<Item = HostType>) -> Self {
        self.params.extend(tys);
        self
    }

    /// Absorb excess arguments of type `elem` into a trailing list
    pub fn variadic(mut self, elem: HostType) -> Self {
        self.variadic = Some(elem);
        self
    }

    /// Finish with the host callable
    ///
    /// The callable receives one value per fixed parameter (nil for omitted
    /// optionals) followed by a [`HostValue::List`] for the variadic tail.
    pub fn build<F>(self, f: F) -> Signature
    where
        F: Fn(&CallContext<'_>, Vec<HostValue>) -> Result<Vec<HostValue>> + Send + Sync + 'static,
    {
        let params: Vec<ParamSpec> = self
            .params
            .into_iter()
            .enumerate()
            .map(|(i, ty)| ParamSpec::new(i, ty))
            .collect();
        let variadic = self.variadic.map(|elem| ParamSpec::variadic(params.len(), elem));
        Signature {
            params,
            variadic,
            callable: Arc::new(f),
        }
    }
}

/// Typed closures usable as host functions
///
/// Implemented for `Fn(A1, .., An) -> R` with up to six arguments, where
/// every argument implements [`FromHost`] and `R` implements
/// [`IntoHostMulti`].
pub trait HostFunction<Args>: Send + Sync + 'static {
    /// Build the signature
    fn into_signature(self) -> Signature;
}

macro_rules! impl_host_function {
    ($($name:ident),*) => {
        impl<Func, Ret, $($name,)*> HostFunction<($($name,)*)> for Func
        where
            Func: Fn($($name),*) -> Ret + Send + Sync + 'static,
            Ret: IntoHostMulti,
            $($name: FromHost,)*
        {
            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn into_signature(self) -> Signature {
                Signature::builder()
                    .params(vec![$($name::host_type()),*])
                    .build(move |_ctx, args| {
                        let mut args = args.into_iter();
                        $(let $name = $name::from_host(args.next().unwrap_or_default())?;)*
                        (self)($($name),*).into_host_multi()
                    })
            }
        }
    };
}

impl_host_function!();
impl_host_function!(A);
impl_host_function!(A, B);
impl_host_function!(A, B, C);
impl_host_function!(A, B, C, D);
impl_host_function!(A, B, C, D, E);
impl_host_function!(A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inferred_params() {
        let sig = Signature::from_fn(|a: i32, b: String, c: Option<f64>| format!("{}{}{:?}", a, b, c));
        assert_eq!(sig.describe(), "(i32, string, option<f64>)");
        assert_eq!(sig.required(), 2);
        assert!(sig.variadic().is_none());
        assert_eq!(sig.params()[1].index(), 1);
    }

    #[test]
    fn test_zero_arity() {
        let sig = Signature::from_fn(|| 1);
        assert_eq!(sig.describe(), "()");
        assert_eq!(sig.required(), 0);
    }

    #[test]
    fn test_builder_variadic() {
        let sig = Signature::builder()
            .param(HostType::String)
            .variadic(HostType::Any)
            .build(|_, args| Ok(args));
        assert_eq!(sig.describe(), "(string, ...any)");
        let tail = sig.variadic().unwrap();
        assert!(tail.is_params_array());
        assert_eq!(tail.index(), 1);
    }

    #[test]
    fn test_param_extract_uses_type() {
        let p = ParamSpec::new(0, HostType::I8);
        assert!(p.extract(&HostValue::Int(1)).is_some());
        assert!(p.extract(&HostValue::Int(1000)).is_none());
    }
}
