//! Host parameter types and their extraction strategies
//!
//! Every [`HostType`] maps to one extraction function, chosen once when a
//! signature is registered. An extraction takes the marshalled VM argument
//! and either rejects it or returns the value normalized to the parameter
//! type together with how well it matched.

use std::any::{Any, TypeId};
use std::fmt;

use moonbridge_vm::value::{float_to_integer, format_number, parse_number};
use moonbridge_vm::Value;

use crate::value::HostValue;

/// Quality of an argument match, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Match {
    /// Accepted by a catch-all parameter
    Any,
    /// Accepted after a conversion
    Coerced,
    /// The VM type is exactly the parameter type
    Exact,
}

/// Extraction strategy: normalized value and match quality, or rejection
pub type ExtractFn = fn(&HostType, &HostValue) -> Option<(HostValue, Match)>;

/// A concrete host type carried through [`HostValue::Object`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectType {
    id: TypeId,
    name: &'static str,
}

impl ObjectType {
    /// Object type of `T`
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Type id
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Rust type name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Host parameter type vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostType {
    /// Any value, converted to its natural host form (nil included)
    Any,
    /// Any value, passed as the host wrapper itself
    Raw,
    /// Boolean
    Bool,
    /// i8
    I8,
    /// i16
    I16,
    /// i32
    I32,
    /// i64
    I64,
    /// u8
    U8,
    /// u16
    U16,
    /// u32
    U32,
    /// u64
    U64,
    /// f32
    F32,
    /// f64
    F64,
    /// Integer or float, whichever the VM holds
    Number,
    /// String
    String,
    /// Single character
    Char,
    /// Table reference
    Table,
    /// Function reference
    Function,
    /// Full userdata reference
    UserData,
    /// Light userdata reference
    LightUserData,
    /// Thread reference
    Thread,
    /// Host object of a concrete type
    Object(ObjectType),
    /// Sequence of elements (a host list or the array part of a table)
    List(Box<HostType>),
    /// Key/value pairs (a host map or a table)
    Map(Box<HostType>, Box<HostType>),
    /// Nil or the inner type; may be omitted at the end of a call
    Optional(Box<HostType>),
}

impl HostType {
    /// `List(elem)`
    pub fn list(elem: HostType) -> Self {
        HostType::List(Box::new(elem))
    }

    /// `Map(key, value)`
    pub fn map(key: HostType, value: HostType) -> Self {
        HostType::Map(Box::new(key), Box::new(value))
    }

    /// `Optional(inner)`
    pub fn optional(inner: HostType) -> Self {
        HostType::Optional(Box::new(inner))
    }

    /// `Object` for the host type `T`
    pub fn object<T: Any>() -> Self {
        HostType::Object(ObjectType::of::<T>())
    }

    /// Whether a trailing argument of this type may be omitted
    pub fn is_optional(&self) -> bool {
        matches!(self, HostType::Optional(_))
    }

    /// Extraction strategy for this type
    pub fn extractor(&self) -> ExtractFn {
        match self {
            HostType::Any | HostType::Raw => extract_any,
            HostType::Bool => extract_bool,
            HostType::I8
            | HostType::I16
            | HostType::I32
            | HostType::I64
            | HostType::U8
            | HostType::U16
            | HostType::U32
            | HostType::U64 => extract_integer,
            HostType::F32 | HostType::F64 => extract_float,
            HostType::Number => extract_number,
            HostType::String => extract_string,
            HostType::Char => extract_char,
            HostType::Table
            | HostType::Function
            | HostType::UserData
            | HostType::LightUserData
            | HostType::Thread => extract_reference,
            HostType::Object(_) => extract_object,
            HostType::List(_) => extract_list,
            HostType::Map(_, _) => extract_map,
            HostType::Optional(_) => extract_optional,
        }
    }

    /// Run this type's extraction on `value`
    pub fn extract(&self, value: &HostValue) -> Option<(HostValue, Match)> {
        (self.extractor())(self, value)
    }

    /// How narrow this type is; higher ranks win ties between equal matches
    ///
    /// Narrower integral widths rank above wider ones, concrete types above
    /// `Number`, and catch-alls last. An optional ranks just below its inner
    /// type.
    pub fn specificity(&self) -> u8 {
        match self {
            HostType::I8 | HostType::U8 => 14,
            HostType::I16 | HostType::U16 => 12,
            HostType::I32 | HostType::U32 | HostType::F32 | HostType::Char => 10,
            HostType::I64
            | HostType::U64
            | HostType::F64
            | HostType::Bool
            | HostType::String
            | HostType::Table
            | HostType::Function
            | HostType::UserData
            | HostType::LightUserData
            | HostType::Thread
            | HostType::Object(_) => 8,
            HostType::List(_) | HostType::Map(_, _) => 6,
            HostType::Number => 4,
            HostType::Any | HostType::Raw => 2,
            HostType::Optional(inner) => inner.specificity().saturating_sub(1),
        }
    }

    fn int_bounds(&self) -> Option<(i128, i128)> {
        let bounds = match self {
            HostType::I8 => (i8::MIN as i128, i8::MAX as i128),
            HostType::I16 => (i16::MIN as i128, i16::MAX as i128),
            HostType::I32 => (i32::MIN as i128, i32::MAX as i128),
            HostType::I64 => (i64::MIN as i128, i64::MAX as i128),
            HostType::U8 => (0, u8::MAX as i128),
            HostType::U16 => (0, u16::MAX as i128),
            HostType::U32 => (0, u32::MAX as i128),
            HostType::U64 => (0, u64::MAX as i128),
            _ => return None,
        };
        Some(bounds)
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Any => f.write_str("any"),
            HostType::Raw => f.write_str("raw"),
            HostType::Bool => f.write_str("bool"),
            HostType::I8 => f.write_str("i8"),
            HostType::I16 => f.write_str("i16"),
            HostType::I32 => f.write_str("i32"),
            HostType::I64 => f.write_str("i64"),
            HostType::U8 => f.write_str("u8"),
            HostType::U16 => f.write_str("u16"),
            HostType::U32 => f.write_str("u32"),
            HostType::U64 => f.write_str("u64"),
            HostType::F32 => f.write_str("f32"),
            HostType::F64 => f.write_str("f64"),
            HostType::Number => f.write_str("number"),
            HostType::String => f.write_str("string"),
            HostType::Char => f.write_str("char"),
            HostType::Table => f.write_str("table"),
            HostType::Function => f.write_str("function"),
            HostType::UserData => f.write_str("userdata"),
            HostType::LightUserData => f.write_str("lightuserdata"),
            HostType::Thread => f.write_str("thread"),
            HostType::Object(o) => f.write_str(o.name()),
            HostType::List(elem) => write!(f, "list<{}>", elem),
            HostType::Map(k, v) => write!(f, "map<{}, {}>", k, v),
            HostType::Optional(inner) => write!(f, "option<{}>", inner),
        }
    }
}

// ============================================================================
// Extraction strategies
// ============================================================================

fn extract_any(_: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    Some((value.clone(), Match::Any))
}

fn extract_bool(_: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    match value {
        HostValue::Bool(b) => Some((HostValue::Bool(*b), Match::Exact)),
        _ => None,
    }
}

/// Numeric string as the VM would read it
fn parse_numeric(s: &str) -> Option<Value> {
    parse_number(s.trim())
}

fn extract_integer(ty: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    let (min, max) = ty.int_bounds()?;
    let (i, quality) = match value {
        HostValue::Int(i) => (*i, Match::Exact),
        HostValue::Float(f) => (float_to_integer(*f)?, Match::Coerced),
        HostValue::String(s) => match parse_numeric(s)? {
            Value::Integer(i) => (i, Match::Coerced),
            Value::Number(f) => (float_to_integer(f)?, Match::Coerced),
            _ => return None,
        },
        _ => return None,
    };
    let wide = i as i128;
    (wide >= min && wide <= max).then_some((HostValue::Int(i), quality))
}

fn extract_float(_: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    match value {
        HostValue::Float(f) => Some((HostValue::Float(*f), Match::Exact)),
        HostValue::Int(i) => Some((HostValue::Float(*i as f64), Match::Coerced)),
        HostValue::String(s) => match parse_numeric(s)? {
            Value::Integer(i) => Some((HostValue::Float(i as f64), Match::Coerced)),
            Value::Number(f) => Some((HostValue::Float(f), Match::Coerced)),
            _ => None,
        },
        _ => None,
    }
}

fn extract_number(_: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    match value {
        HostValue::Int(_) | HostValue::Float(_) => Some((value.clone(), Match::Exact)),
        HostValue::String(s) => match parse_numeric(s)? {
            Value::Integer(i) => Some((HostValue::Int(i), Match::Coerced)),
            Value::Number(f) => Some((HostValue::Float(f), Match::Coerced)),
            _ => None,
        },
        _ => None,
    }
}

fn extract_string(_: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    match value {
        HostValue::String(s) => Some((HostValue::String(s.clone()), Match::Exact)),
        HostValue::Int(i) => Some((HostValue::String(i.to_string()), Match::Coerced)),
        HostValue::Float(f) => Some((HostValue::String(format_number(*f)), Match::Coerced)),
        _ => None,
    }
}

fn extract_char(_: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    match value {
        HostValue::String(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some((HostValue::String(c.to_string()), Match::Exact)),
                _ => None,
            }
        }
        HostValue::Int(i) => {
            let c = u32::try_from(*i).ok().and_then(char::from_u32)?;
            Some((HostValue::String(c.to_string()), Match::Coerced))
        }
        _ => None,
    }
}

fn extract_reference(ty: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    let accepted = matches!(
        (ty, value),
        (HostType::Table, HostValue::Table(_))
            | (HostType::Function, HostValue::Function(_))
            | (HostType::UserData, HostValue::UserData(_))
            | (HostType::LightUserData, HostValue::LightUserData(_))
            | (HostType::Thread, HostValue::Thread(_))
    );
    accepted.then(|| (value.clone(), Match::Exact))
}

fn extract_object(ty: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    match (ty, value) {
        (HostType::Object(expected), HostValue::Object(obj)) if obj.type_id() == expected.id() => {
            Some((value.clone(), Match::Exact))
        }
        _ => None,
    }
}

/// Extract every element, returning the worst match
fn extract_all<'a>(
    elem: &HostType,
    items: impl Iterator<Item = &'a HostValue>,
) -> Option<(Vec<HostValue>, Match)> {
    let mut out = Vec::new();
    let mut worst = Match::Exact;
    for item in items {
        let (v, m) = elem.extract(item)?;
        worst = worst.min(m);
        out.push(v);
    }
    Some((out, worst))
}

fn extract_list(ty: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    let HostType::List(elem) = ty else {
        return None;
    };
    match value {
        HostValue::List(items) => {
            let (out, quality) = extract_all(elem, items.iter())?;
            Some((HostValue::List(out), quality))
        }
        HostValue::Table(t) => {
            let items = t.to_list().ok()?;
            let (out, _) = extract_all(elem, items.iter())?;
            Some((HostValue::List(out), Match::Coerced))
        }
        _ => None,
    }
}

fn extract_map(ty: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    let HostType::Map(key_ty, value_ty) = ty else {
        return None;
    };
    let (entries, quality) = match value {
        HostValue::Map(entries) => (entries.clone(), Match::Exact),
        HostValue::Table(t) => (t.pairs().ok()?, Match::Coerced),
        _ => return None,
    };
    let mut worst = quality;
    let mut out = Vec::with_capacity(entries.len());
    for (k, v) in &entries {
        let (k, km) = key_ty.extract(k)?;
        let (v, vm) = value_ty.extract(v)?;
        worst = worst.min(km).min(vm);
        out.push((k, v));
    }
    Some((HostValue::Map(out), worst))
}

fn extract_optional(ty: &HostType, value: &HostValue) -> Option<(HostValue, Match)> {
    let HostType::Optional(inner) = ty else {
        return None;
    };
    match value {
        HostValue::Nil => Some((HostValue::Nil, Match::Exact)),
        other => inner.extract(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HostObject;

    #[test]
    fn test_specificity_ranks_narrow_types_first() {
        assert!(HostType::I8.specificity() > HostType::I32.specificity());
        assert!(HostType::I32.specificity() > HostType::I64.specificity());
        assert!(HostType::I64.specificity() > HostType::Number.specificity());
        assert!(HostType::Number.specificity() > HostType::Any.specificity());
        assert!(HostType::optional(HostType::I8).specificity() < HostType::I8.specificity());
    }

    #[test]
    fn test_integer_extraction() {
        let (v, m) = HostType::I32.extract(&HostValue::Int(5)).unwrap();
        assert_eq!(v, HostValue::Int(5));
        assert_eq!(m, Match::Exact);

        let (v, m) = HostType::I32.extract(&HostValue::Float(6.0)).unwrap();
        assert_eq!(v, HostValue::Int(6));
        assert_eq!(m, Match::Coerced);

        assert!(HostType::I32.extract(&HostValue::Float(6.5)).is_none());
        assert!(HostType::U8.extract(&HostValue::Int(256)).is_none());
        assert!(HostType::U8.extract(&HostValue::Int(-1)).is_none());
        assert!(HostType::I64.extract(&HostValue::Bool(true)).is_none());

        let (v, m) = HostType::I16.extract(&HostValue::String(" 12 ".into())).unwrap();
        assert_eq!(v, HostValue::Int(12));
        assert_eq!(m, Match::Coerced);
    }

    #[test]
    fn test_string_and_char_extraction() {
        let (v, m) = HostType::String.extract(&HostValue::Int(3)).unwrap();
        assert_eq!(v, HostValue::String("3".into()));
        assert_eq!(m, Match::Coerced);

        let (_, m) = HostType::String.extract(&HostValue::String("x".into())).unwrap();
        assert_eq!(m, Match::Exact);

        assert!(HostType::Char.extract(&HostValue::String("ab".into())).is_none());
        let (v, _) = HostType::Char.extract(&HostValue::Int(65)).unwrap();
        assert_eq!(v, HostValue::String("A".into()));
    }

    #[test]
    fn test_optional_and_any() {
        let opt = HostType::optional(HostType::I32);
        assert_eq!(opt.extract(&HostValue::Nil).unwrap().0, HostValue::Nil);
        assert_eq!(opt.extract(&HostValue::Int(1)).unwrap().0, HostValue::Int(1));
        assert!(opt.extract(&HostValue::Bool(true)).is_none());

        assert_eq!(HostType::Any.extract(&HostValue::Nil).unwrap().1, Match::Any);
        assert!(HostType::Bool.extract(&HostValue::Nil).is_none());
    }

    #[test]
    fn test_list_of_host_values() {
        let ty = HostType::list(HostType::F64);
        let (v, m) = ty
            .extract(&HostValue::List(vec![HostValue::Int(1), HostValue::Float(2.5)]))
            .unwrap();
        assert_eq!(v, HostValue::List(vec![HostValue::Float(1.0), HostValue::Float(2.5)]));
        assert_eq!(m, Match::Coerced);
    }

    #[test]
    fn test_object_extraction_checks_type() {
        struct Point;
        let obj = HostValue::Object(HostObject::new(Point));
        assert!(HostType::object::<Point>().extract(&obj).is_some());
        assert!(HostType::object::<String>().extract(&obj).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(HostType::optional(HostType::list(HostType::I32)).to_string(), "option<list<i32>>");
        assert_eq!(HostType::map(HostType::String, HostType::Any).to_string(), "map<string, any>");
    }
}
