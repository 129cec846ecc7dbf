//! Host-side values exchanged with the VM
//!
//! [`HostValue`] is the boxed form every argument and result takes while it
//! crosses the boundary. The [`FromHost`] / [`IntoHost`] traits convert it to
//! and from plain Rust types, and [`IntoHostMulti`] turns return values into
//! result lists.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use moonbridge_vm::value::format_number;

use crate::error::{Error, Result};
use crate::function::FunctionRef;
use crate::method::HostType;
use crate::number::Number;
use crate::table::TableRef;
use crate::thread::ThreadRef;
use crate::userdata::{LightUserDataRef, UserDataRef};

// ============================================================================
// HostObject
// ============================================================================

/// An opaque host object handed to the VM as userdata
#[derive(Clone)]
pub struct HostObject {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl HostObject {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap a shared value
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Shared handle as `T`
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }

    /// Whether the object is a `T`
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Rust type name of the wrapped value
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Type id of the wrapped value
    pub fn type_id(&self) -> TypeId {
        Any::type_id(&*self.value)
    }

    /// Whether both handles wrap the same object
    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({})", self.type_name)
    }
}

// ============================================================================
// HostValue
// ============================================================================

/// A value on the host side of the boundary
#[derive(Clone, Default)]
pub enum HostValue {
    /// Nil
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    String(String),
    /// Table living in the VM
    Table(TableRef),
    /// Function living in the VM, or a host function not yet pushed
    Function(FunctionRef),
    /// Full userdata living in the VM
    UserData(UserDataRef),
    /// Light userdata
    LightUserData(LightUserDataRef),
    /// VM thread
    Thread(ThreadRef),
    /// Host object, pushed as userdata
    Object(HostObject),
    /// Host list, pushed as a fresh table
    List(Vec<HostValue>),
    /// Host map, pushed as a fresh table
    Map(Vec<(HostValue, HostValue)>),
}

impl HostValue {
    /// Type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "boolean",
            HostValue::Int(_) | HostValue::Float(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Table(_) => "table",
            HostValue::Function(_) => "function",
            HostValue::UserData(_) => "userdata",
            HostValue::LightUserData(_) => "lightuserdata",
            HostValue::Thread(_) => "thread",
            HostValue::Object(_) => "object",
            HostValue::List(_) => "list",
            HostValue::Map(_) => "map",
        }
    }

    /// Whether this is nil
    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    /// Boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value (integral floats included)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Int(i) => Some(*i),
            HostValue::Float(f) => moonbridge_vm::value::float_to_integer(*f),
            _ => None,
        }
    }

    /// Float value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Table reference
    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            HostValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Function reference
    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            HostValue::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Userdata reference
    pub fn as_userdata(&self) -> Option<&UserDataRef> {
        match self {
            HostValue::UserData(u) => Some(u),
            _ => None,
        }
    }

    /// Host object
    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            HostValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Convert into `T`
    pub fn into_typed<T: FromHost>(self) -> Result<T> {
        T::from_host(self)
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => f.write_str("Nil"),
            HostValue::Bool(b) => write!(f, "Bool({})", b),
            HostValue::Int(i) => write!(f, "Int({})", i),
            HostValue::Float(n) => write!(f, "Float({})", n),
            HostValue::String(s) => write!(f, "String({:?})", s),
            HostValue::Table(t) => fmt::Debug::fmt(t, f),
            HostValue::Function(func) => fmt::Debug::fmt(func, f),
            HostValue::UserData(u) => fmt::Debug::fmt(u, f),
            HostValue::LightUserData(u) => fmt::Debug::fmt(u, f),
            HostValue::Thread(t) => fmt::Debug::fmt(t, f),
            HostValue::Object(o) => fmt::Debug::fmt(o, f),
            HostValue::List(items) => f.debug_tuple("List").field(items).finish(),
            HostValue::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => f.write_str("nil"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(i) => write!(f, "{}", i),
            HostValue::Float(n) => f.write_str(&format_number(*n)),
            HostValue::String(s) => f.write_str(s),
            HostValue::Table(t) => f.write_str(&t.to_display_string()),
            HostValue::Function(func) => f.write_str(&func.to_display_string()),
            HostValue::UserData(u) => f.write_str(&u.to_display_string()),
            HostValue::LightUserData(u) => f.write_str(&u.to_display_string()),
            HostValue::Thread(t) => f.write_str(&t.to_display_string()),
            HostValue::Object(o) => write!(f, "object: {}", o.type_name()),
            HostValue::List(_) => f.write_str("list"),
            HostValue::Map(_) => f.write_str("map"),
        }
    }
}

/// Scalars compare by value (integers and floats mathematically), VM
/// references by VM identity, host objects by pointer.
impl PartialEq for HostValue {
    fn eq(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Nil, HostValue::Nil) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Int(a), HostValue::Int(b)) => a == b,
            (HostValue::Float(a), HostValue::Float(b)) => a == b,
            (HostValue::Int(i), HostValue::Float(f)) | (HostValue::Float(f), HostValue::Int(i)) => {
                moonbridge_vm::value::float_to_integer(*f) == Some(*i)
            }
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Table(a), HostValue::Table(b)) => a == b,
            (HostValue::Function(a), HostValue::Function(b)) => a == b,
            (HostValue::UserData(a), HostValue::UserData(b)) => a == b,
            (HostValue::LightUserData(a), HostValue::LightUserData(b)) => a == b,
            (HostValue::Thread(a), HostValue::Thread(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a.ptr_eq(b),
            (HostValue::List(a), HostValue::List(b)) => a == b,
            (HostValue::Map(a), HostValue::Map(b)) => a == b,
            _ => false,
        }
    }
}

// ============================================================================
// Conversion traits
// ============================================================================

/// Conversion from a marshalled VM value
pub trait FromHost: Sized {
    /// Parameter type used when this type appears in a host signature
    fn host_type() -> HostType;

    /// Convert, failing with [`Error::Coercion`]
    fn from_host(value: HostValue) -> Result<Self>;
}

/// Conversion into a value that can be pushed into the VM
pub trait IntoHost {
    /// Convert
    fn into_host(self) -> HostValue;
}

/// Conversion into a list of results
pub trait IntoHostMulti {
    /// Convert
    fn into_host_multi(self) -> Result<Vec<HostValue>>;
}

/// Several values returned as separate results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiValue(pub Vec<HostValue>);

/// Run `T`'s extraction, failing with a coercion error
fn extracted(value: &HostValue, ty: &HostType) -> Result<HostValue> {
    ty.extract(value)
        .map(|(v, _)| v)
        .ok_or_else(|| Error::coercion(ty, value.type_name()))
}

impl FromHost for HostValue {
    fn host_type() -> HostType {
        HostType::Any
    }

    fn from_host(value: HostValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromHost for bool {
    fn host_type() -> HostType {
        HostType::Bool
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match extracted(&value, &HostType::Bool)? {
            HostValue::Bool(b) => Ok(b),
            other => Err(Error::coercion(HostType::Bool, other.type_name())),
        }
    }
}

macro_rules! impl_int_conversions {
    ($($ty:ty => $host:ident),* $(,)?) => {
        $(
            impl FromHost for $ty {
                fn host_type() -> HostType {
                    HostType::$host
                }

                fn from_host(value: HostValue) -> Result<Self> {
                    let ty = HostType::$host;
                    match extracted(&value, &ty)? {
                        HostValue::Int(i) => {
                            <$ty>::try_from(i).map_err(|_| Error::coercion(&ty, value.type_name()))
                        }
                        other => Err(Error::coercion(&ty, other.type_name())),
                    }
                }
            }
        )*
    };
}

impl_int_conversions! {
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
}

impl FromHost for f64 {
    fn host_type() -> HostType {
        HostType::F64
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match extracted(&value, &HostType::F64)? {
            HostValue::Float(f) => Ok(f),
            other => Err(Error::coercion(HostType::F64, other.type_name())),
        }
    }
}

impl FromHost for f32 {
    fn host_type() -> HostType {
        HostType::F32
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match extracted(&value, &HostType::F32)? {
            HostValue::Float(f) => Ok(f as f32),
            other => Err(Error::coercion(HostType::F32, other.type_name())),
        }
    }
}

impl FromHost for Number {
    fn host_type() -> HostType {
        HostType::Number
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match extracted(&value, &HostType::Number)? {
            HostValue::Int(i) => Ok(Number::Int(i)),
            HostValue::Float(f) => Ok(Number::Float(f)),
            other => Err(Error::coercion(HostType::Number, other.type_name())),
        }
    }
}

impl FromHost for String {
    fn host_type() -> HostType {
        HostType::String
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match extracted(&value, &HostType::String)? {
            HostValue::String(s) => Ok(s),
            other => Err(Error::coercion(HostType::String, other.type_name())),
        }
    }
}

impl FromHost for char {
    fn host_type() -> HostType {
        HostType::Char
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match extracted(&value, &HostType::Char)? {
            HostValue::String(s) => s
                .chars()
                .next()
                .ok_or_else(|| Error::coercion(HostType::Char, "string")),
            other => Err(Error::coercion(HostType::Char, other.type_name())),
        }
    }
}

macro_rules! impl_ref_conversions {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromHost for $ty {
                fn host_type() -> HostType {
                    HostType::$variant
                }

                fn from_host(value: HostValue) -> Result<Self> {
                    match value {
                        HostValue::$variant(r) => Ok(r),
                        other => Err(Error::coercion(HostType::$variant, other.type_name())),
                    }
                }
            }

            impl IntoHost for $ty {
                fn into_host(self) -> HostValue {
                    HostValue::$variant(self)
                }
            }
        )*
    };
}

impl_ref_conversions! {
    TableRef => Table,
    FunctionRef => Function,
    UserDataRef => UserData,
    LightUserDataRef => LightUserData,
    ThreadRef => Thread,
}

impl<T: Any + Send + Sync> FromHost for Arc<T> {
    fn host_type() -> HostType {
        HostType::object::<T>()
    }

    fn from_host(value: HostValue) -> Result<Self> {
        value
            .as_object()
            .and_then(HostObject::downcast_arc::<T>)
            .ok_or_else(|| Error::coercion(Self::host_type(), value.type_name()))
    }
}

impl<T: FromHost> FromHost for Option<T> {
    fn host_type() -> HostType {
        HostType::optional(T::host_type())
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match value {
            HostValue::Nil => Ok(None),
            other => T::from_host(other).map(Some),
        }
    }
}

impl<T: FromHost> FromHost for Vec<T> {
    fn host_type() -> HostType {
        HostType::list(T::host_type())
    }

    fn from_host(value: HostValue) -> Result<Self> {
        match extracted(&value, &Self::host_type())? {
            HostValue::List(items) => items.into_iter().map(T::from_host).collect(),
            other => Err(Error::coercion(Self::host_type(), other.type_name())),
        }
    }
}

impl IntoHost for HostValue {
    fn into_host(self) -> HostValue {
        self
    }
}

impl IntoHost for bool {
    fn into_host(self) -> HostValue {
        HostValue::Bool(self)
    }
}

macro_rules! impl_into_host_int {
    ($($ty:ty),*) => {
        $(
            impl IntoHost for $ty {
                fn into_host(self) -> HostValue {
                    HostValue::Int(self as i64)
                }
            }
        )*
    };
}

impl_into_host_int!(i8, i16, i32, i64, u8, u16, u32);

impl IntoHost for u64 {
    fn into_host(self) -> HostValue {
        match i64::try_from(self) {
            Ok(i) => HostValue::Int(i),
            Err(_) => HostValue::Float(self as f64),
        }
    }
}

impl IntoHost for usize {
    fn into_host(self) -> HostValue {
        (self as u64).into_host()
    }
}

impl IntoHost for isize {
    fn into_host(self) -> HostValue {
        HostValue::Int(self as i64)
    }
}

impl IntoHost for f64 {
    fn into_host(self) -> HostValue {
        HostValue::Float(self)
    }
}

impl IntoHost for f32 {
    fn into_host(self) -> HostValue {
        HostValue::Float(self as f64)
    }
}

impl IntoHost for String {
    fn into_host(self) -> HostValue {
        HostValue::String(self)
    }
}

impl IntoHost for &str {
    fn into_host(self) -> HostValue {
        HostValue::String(self.to_string())
    }
}

impl IntoHost for char {
    fn into_host(self) -> HostValue {
        HostValue::String(self.to_string())
    }
}

/// Numbers are pushed in their normalized form
impl IntoHost for Number {
    fn into_host(self) -> HostValue {
        match self.internal_value() {
            Number::Int(i) => HostValue::Int(i),
            Number::UInt(u) => u.into_host(),
            Number::Float(f) => HostValue::Float(f),
            Number::Single(f) => HostValue::Float(f as f64),
            Number::Str(s) => HostValue::String(s),
            other => HostValue::Int(other.to_i64()),
        }
    }
}

impl IntoHost for HostObject {
    fn into_host(self) -> HostValue {
        HostValue::Object(self)
    }
}

impl<T: Any + Send + Sync> IntoHost for Arc<T> {
    fn into_host(self) -> HostValue {
        HostValue::Object(HostObject::from_arc(self))
    }
}

impl<T: IntoHost> IntoHost for Option<T> {
    fn into_host(self) -> HostValue {
        match self {
            Some(v) => v.into_host(),
            None => HostValue::Nil,
        }
    }
}

impl<T: IntoHost> IntoHost for Vec<T> {
    fn into_host(self) -> HostValue {
        HostValue::List(self.into_iter().map(IntoHost::into_host).collect())
    }
}

impl<T: IntoHost> IntoHostMulti for T {
    fn into_host_multi(self) -> Result<Vec<HostValue>> {
        Ok(vec![self.into_host()])
    }
}

impl IntoHostMulti for () {
    fn into_host_multi(self) -> Result<Vec<HostValue>> {
        Ok(Vec::new())
    }
}

impl IntoHostMulti for MultiValue {
    fn into_host_multi(self) -> Result<Vec<HostValue>> {
        Ok(self.0)
    }
}

impl<T: IntoHostMulti, E: Into<Error>> IntoHostMulti for std::result::Result<T, E> {
    fn into_host_multi(self) -> Result<Vec<HostValue>> {
        self.map_err(Into::into)?.into_host_multi()
    }
}

macro_rules! impl_into_host_multi_tuple {
    ($($name:ident),+) => {
        impl<$($name: IntoHost),+> IntoHostMulti for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_host_multi(self) -> Result<Vec<HostValue>> {
                let ($($name,)+) = self;
                Ok(vec![$($name.into_host()),+])
            }
        }
    };
}

impl_into_host_multi_tuple!(A, B);
impl_into_host_multi_tuple!(A, B, C);
impl_into_host_multi_tuple!(A, B, C, D);
impl_into_host_multi_tuple!(A, B, C, D, E);
impl_into_host_multi_tuple!(A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(i32::from_host(HostValue::Int(7)).unwrap(), 7);
        assert_eq!(f64::from_host(HostValue::Int(7)).unwrap(), 7.0);
        assert_eq!(String::from_host(HostValue::Float(1.5)).unwrap(), "1.5");
        assert_eq!(char::from_host(HostValue::String("z".into())).unwrap(), 'z');
        assert!(bool::from_host(HostValue::Int(1)).is_err());
        assert!(u8::from_host(HostValue::Int(300)).is_err());
    }

    #[test]
    fn test_coercion_error_names_types() {
        let err = i32::from_host(HostValue::Bool(true)).unwrap_err();
        assert_eq!(err.to_string(), "cannot convert boolean to i32");
    }

    #[test]
    fn test_option_and_vec() {
        assert_eq!(Option::<i32>::from_host(HostValue::Nil).unwrap(), None);
        assert_eq!(Option::<i32>::from_host(HostValue::Int(2)).unwrap(), Some(2));
        let list = HostValue::List(vec![HostValue::Int(1), HostValue::Int(2)]);
        assert_eq!(Vec::<i64>::from_host(list).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_object_roundtrip() {
        #[derive(Debug, PartialEq)]
        struct Handle(u32);

        let value = Arc::new(Handle(9)).into_host();
        assert_eq!(value.type_name(), "object");
        let back = Arc::<Handle>::from_host(value.clone()).unwrap();
        assert_eq!(*back, Handle(9));
        assert!(Arc::<String>::from_host(value).is_err());
    }

    #[test]
    fn test_number_into_host_normalizes() {
        assert_eq!(Number::from(true).into_host(), HostValue::Int(1));
        assert_eq!(Number::from("2.5").into_host(), HostValue::Float(2.5));
        assert_eq!(Number::from(3u64).into_host(), HostValue::Int(3));
        assert_eq!(u64::MAX.into_host(), HostValue::Float(u64::MAX as f64));
    }

    #[test]
    fn test_multi_results() {
        assert!(().into_host_multi().unwrap().is_empty());
        assert_eq!(
            (1i32, "a").into_host_multi().unwrap(),
            vec![HostValue::Int(1), HostValue::String("a".into())]
        );
        let failed: std::result::Result<i32, Error> = Err(Error::runtime("no"));
        assert!(failed.into_host_multi().is_err());
        assert_eq!(
            MultiValue(vec![HostValue::Nil, HostValue::Bool(true)])
                .into_host_multi()
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_int_float_equality() {
        assert_eq!(HostValue::Int(2), HostValue::Float(2.0));
        assert_ne!(HostValue::Int(2), HostValue::Float(2.5));
        assert_ne!(HostValue::Int(2), HostValue::String("2".into()));
    }
}
