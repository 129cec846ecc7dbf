//! Value representation for the VM
//!
//! Values are cheap to clone: scalars are stored inline, strings are shared
//! `Arc<str>`, and every collectable object (table, function, userdata,
//! thread) is an `Arc`. Object identity is pointer identity.

use std::fmt;
use std::sync::Arc;

use crate::function::Function;
use crate::state::VmState;
use crate::table::TableHandle;
use crate::userdata::UserData;

/// Type tag of a value (or of an empty stack index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Index does not refer to a stack slot
    None,
    /// nil
    Nil,
    /// true / false
    Boolean,
    /// Raw pointer-sized host token
    LightUserData,
    /// Integer or float
    Number,
    /// Immutable string
    String,
    /// Table
    Table,
    /// Native function
    Function,
    /// Full userdata (host payload + metatable)
    UserData,
    /// Coroutine-style thread sharing the heap
    Thread,
}

impl ValueType {
    /// Name as reported by `type()`
    pub fn name(self) -> &'static str {
        match self {
            ValueType::None => "no value",
            ValueType::Nil => "nil",
            ValueType::Boolean => "boolean",
            ValueType::LightUserData | ValueType::UserData => "userdata",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Table => "table",
            ValueType::Function => "function",
            ValueType::Thread => "thread",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A VM value
#[derive(Clone, Default)]
pub enum Value {
    /// nil
    #[default]
    Nil,
    /// Boolean
    Boolean(bool),
    /// 64-bit integer
    Integer(i64),
    /// 64-bit float
    Number(f64),
    /// String
    String(Arc<str>),
    /// Table
    Table(TableHandle),
    /// Function
    Function(Arc<Function>),
    /// Full userdata
    UserData(Arc<UserData>),
    /// Light userdata
    LightUserData(usize),
    /// Thread
    Thread(Arc<VmState>),
}

impl Value {
    /// Create a string value
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    /// Type tag
    pub fn type_of(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Integer(_) | Value::Number(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Table(_) => ValueType::Table,
            Value::Function(_) => ValueType::Function,
            Value::UserData(_) => ValueType::UserData,
            Value::LightUserData(_) => ValueType::LightUserData,
            Value::Thread(_) => ValueType::Thread,
        }
    }

    /// Check if nil
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything except nil and false is true
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Integer view, converting floats with an exact integer value and
    /// numeric strings
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) => float_to_integer(*n),
            Value::String(s) => match parse_number(s)? {
                Value::Integer(i) => Some(i),
                Value::Number(n) => float_to_integer(n),
                _ => None,
            },
            _ => None,
        }
    }

    /// Float view, converting integers and numeric strings
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            Value::String(s) => match parse_number(s)? {
                Value::Integer(i) => Some(i as f64),
                Value::Number(n) => Some(n),
                _ => None,
            },
            _ => None,
        }
    }

    /// String view, converting numbers
    pub fn as_str(&self) -> Option<Arc<str>> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Integer(_) | Value::Number(_) => Some(Arc::from(self.to_plain_string())),
            _ => None,
        }
    }

    /// Address of a collectable object (or the light userdata token)
    pub fn address(&self) -> Option<usize> {
        match self {
            Value::Table(t) => Some(t.address()),
            Value::Function(f) => Some(Arc::as_ptr(f) as usize),
            Value::UserData(u) => Some(Arc::as_ptr(u) as usize),
            Value::Thread(t) => Some(Arc::as_ptr(t) as usize),
            Value::LightUserData(p) => Some(*p),
            _ => None,
        }
    }

    /// Primitive equality: no metamethods, integers and floats compare
    /// mathematically, objects by identity
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(i), Value::Number(n)) | (Value::Number(n), Value::Integer(i)) => {
                float_to_integer(*n) == Some(*i)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::UserData(a), Value::UserData(b)) => Arc::ptr_eq(a, b),
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Default string form (what `tostring` prints without `__tostring`)
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::LightUserData(p) => format!("userdata: {:#018x}", p),
            other => format!(
                "{}: {:#018x}",
                other.type_of().name(),
                other.address().unwrap_or_default()
            ),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => f.write_str(&other.to_plain_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_plain_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Arc::from(s))
    }
}

impl From<TableHandle> for Value {
    fn from(t: TableHandle) -> Self {
        Value::Table(t)
    }
}

/// Float to integer when the float holds an exact integer in range
pub fn float_to_integer(n: f64) -> Option<i64> {
    // 2^63 is not representable as i64; -2^63 is
    if n.fract() == 0.0 && n >= -9_223_372_036_854_775_808.0 && n < 9_223_372_036_854_775_808.0 {
        Some(n as i64)
    } else {
        None
    }
}

/// Parse a numeric literal (decimal integer, hex integer or float)
pub fn parse_number(s: &str) -> Option<Value> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let (negative, digits) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t.strip_prefix('+').unwrap_or(t)),
    };
    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        // hex integers wrap around like the reference implementation
        let v = u64::from_str_radix(hex, 16).ok()? as i64;
        return Some(Value::Integer(if negative { v.wrapping_neg() } else { v }));
    }
    if let Ok(i) = t.parse::<i64>() {
        return Some(Value::Integer(i));
    }
    let lower = digits.to_ascii_lowercase();
    if lower.starts_with("inf") || lower.starts_with("nan") {
        return None;
    }
    t.parse::<f64>().ok().map(Value::Number)
}

/// Format a float the way `%.14g` does, keeping a trailing `.0` on values
/// that would otherwise read as integers
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let sci = format!("{:.13e}", n);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    let mut out = if !(-4..14).contains(&exp) {
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            if exp < 0 { '-' } else { '+' },
            exp.abs()
        )
    } else {
        let decimals = (13 - exp).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, n)).to_string()
    };

    if !out.contains(['.', 'e', 'n', 'i']) {
        out.push_str(".0");
    }
    out
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
