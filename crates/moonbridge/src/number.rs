//! Polymorphic numeric value
//!
//! [`Number`] unifies the VM's numeric representations with the host's
//! numeric types. Every conversion is a named, total function: instead of
//! failing it falls back to a documented default (saturation, zero, false).
//!
//! Arithmetic happens in the f64 domain, so integers beyond 2^53 lose
//! precision once they take part in an operation.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

/// Ticks (100 ns) per second
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Largest tick count representable as a date (9999-12-31T23:59:59.9999999)
const MAX_TICKS: i64 = 3_155_378_975_999_999_999;

/// Whether a number is integral or fractional
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericalType {
    /// No fractional part
    Integer,
    /// Has (or may have) a fractional part
    Float,
}

/// A number as seen from the host
///
/// Stores the value in the representation it was created from.
#[derive(Debug, Clone)]
pub enum Number {
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Double precision float
    Float(f64),
    /// Single precision float
    Single(f32),
    /// Boolean (1 / 0)
    Bool(bool),
    /// Character (its code point)
    Char(char),
    /// Date/time (its tick count)
    DateTime(NaiveDateTime),
    /// Numeric string
    Str(String),
}

// ============================================================================
// Construction
// ============================================================================

macro_rules! impl_from {
    ($($ty:ty => $variant:ident as $target:ty),* $(,)?) => {
        $(
            impl From<$ty> for Number {
                fn from(v: $ty) -> Self {
                    Number::$variant(v as $target)
                }
            }
        )*
    };
}

impl_from! {
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int as i64,
    isize => Int as i64,
    u8 => UInt as u64,
    u16 => UInt as u64,
    u32 => UInt as u64,
    u64 => UInt as u64,
    usize => UInt as u64,
    f32 => Single as f32,
    f64 => Float as f64,
}

impl From<bool> for Number {
    fn from(v: bool) -> Self {
        Number::Bool(v)
    }
}

impl From<char> for Number {
    fn from(v: char) -> Self {
        Number::Char(v)
    }
}

impl From<NaiveDateTime> for Number {
    fn from(v: NaiveDateTime) -> Self {
        Number::DateTime(v)
    }
}

impl From<String> for Number {
    fn from(v: String) -> Self {
        Number::Str(v)
    }
}

impl From<&str> for Number {
    fn from(v: &str) -> Self {
        Number::Str(v.to_string())
    }
}

impl Default for Number {
    fn default() -> Self {
        Number::Int(0)
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl Number {
    /// Value as f64
    ///
    /// Strings that fail to parse become 0.
    pub fn to_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::UInt(u) => *u as f64,
            Number::Float(f) => *f,
            Number::Single(f) => *f as f64,
            Number::Bool(b) => bool_to_int(*b) as f64,
            Number::Char(c) => *c as u32 as f64,
            Number::DateTime(dt) => datetime_to_ticks(dt) as f64,
            Number::Str(s) => s.trim().parse().unwrap_or(0.0),
        }
    }

    /// Value as f32
    pub fn to_f32(&self) -> f32 {
        match self {
            Number::Single(f) => *f,
            Number::Str(s) => s.trim().parse().unwrap_or(0.0),
            other => other.to_f64() as f32,
        }
    }

    /// Value as i64 (floats round half to even, saturating)
    pub fn to_i64(&self) -> i64 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), i64::MIN, i64::MAX),
        }
    }

    /// Value as i32 (saturating)
    pub fn to_i32(&self) -> i32 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), i32::MIN, i32::MAX),
        }
    }

    /// Value as i16 (saturating)
    pub fn to_i16(&self) -> i16 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), i16::MIN, i16::MAX),
        }
    }

    /// Value as i8 (saturating)
    pub fn to_i8(&self) -> i8 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), i8::MIN, i8::MAX),
        }
    }

    /// Value as u64 (saturating, negatives become 0)
    pub fn to_u64(&self) -> u64 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), u64::MIN, u64::MAX),
        }
    }

    /// Value as u32 (saturating)
    pub fn to_u32(&self) -> u32 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), u32::MIN, u32::MAX),
        }
    }

    /// Value as u16 (saturating)
    pub fn to_u16(&self) -> u16 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), u16::MIN, u16::MAX),
        }
    }

    /// Value as u8 (saturating)
    pub fn to_u8(&self) -> u8 {
        match self {
            Number::Str(s) => s.trim().parse().unwrap_or(0),
            other => clamp(other.to_i128(), u8::MIN, u8::MAX),
        }
    }

    /// Value as bool
    ///
    /// Numbers are true when non-zero. Strings accept `"true"`/`"false"` in
    /// any case and are false otherwise.
    pub fn to_bool(&self) -> bool {
        match self {
            Number::Int(i) => *i != 0,
            Number::UInt(u) => *u != 0,
            Number::Float(f) => *f != 0.0,
            Number::Single(f) => *f != 0.0,
            Number::Bool(b) => *b,
            Number::Char(c) => *c != '\0',
            Number::DateTime(dt) => datetime_to_ticks(dt) != 0,
            Number::Str(s) => s.trim().eq_ignore_ascii_case("true"),
        }
    }

    /// Value as char
    ///
    /// Booleans map to `'✓'` / `'❌'`; numbers are code points; invalid
    /// code points and unparsable strings become `'\0'`.
    pub fn to_char(&self) -> char {
        match self {
            Number::Bool(true) => '\u{2713}',
            Number::Bool(false) => '\u{274C}',
            Number::Char(c) => *c,
            Number::Str(s) => {
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => '\0',
                }
            }
            other => char::from_u32(other.to_u32()).unwrap_or('\0'),
        }
    }

    /// Value as a date/time, reading [`Number::to_i64`] as a tick count
    pub fn to_datetime(&self) -> NaiveDateTime {
        match self {
            Number::DateTime(dt) => *dt,
            other => ticks_to_datetime(other.to_i64()),
        }
    }

    /// Normalized value
    ///
    /// Strings that parse as f64 become floats and booleans become 0/1
    /// integers; everything else is returned as stored.
    pub fn internal_value(&self) -> Number {
        match self {
            Number::Str(s) => match s.trim().parse::<f64>() {
                Ok(f) => Number::Float(f),
                Err(_) => self.clone(),
            },
            Number::Bool(b) => Number::Int(bool_to_int(*b)),
            other => other.clone(),
        }
    }

    /// True when the value has no fractional part
    ///
    /// Only the float representations are checked; every other
    /// representation counts as integral.
    pub fn is_integer(&self) -> bool {
        match self {
            Number::Float(f) => *f % 1.0 == 0.0,
            Number::Single(f) => *f % 1.0 == 0.0,
            _ => true,
        }
    }

    /// [`NumericalType::Integer`] when [`Number::is_integer`] holds
    pub fn numerical_type(&self) -> NumericalType {
        if self.is_integer() {
            NumericalType::Integer
        } else {
            NumericalType::Float
        }
    }

    /// `self.to_bool() == b`
    pub fn eq_bool(&self, b: bool) -> bool {
        self.to_bool() == b
    }

    /// Inequality against a bool
    ///
    /// Note: this evaluates `self.to_bool() == b`, exactly like
    /// [`Number::eq_bool`], so it never reports inequality. Kept for
    /// compatibility with existing callers.
    pub fn ne_bool(&self, b: bool) -> bool {
        self.to_bool() == b
    }

    /// Wide integer used by the saturating conversions
    fn to_i128(&self) -> i128 {
        match self {
            Number::Int(i) => *i as i128,
            Number::UInt(u) => *u as i128,
            Number::Float(f) => round_float(*f),
            Number::Single(f) => round_float(*f as f64),
            Number::Bool(b) => bool_to_int(*b) as i128,
            Number::Char(c) => *c as u32 as i128,
            Number::DateTime(dt) => datetime_to_ticks(dt) as i128,
            Number::Str(s) => round_float(s.trim().parse().unwrap_or(0.0)),
        }
    }
}

fn bool_to_int(b: bool) -> i64 {
    if b {
        1
    } else {
        0
    }
}

/// Round half to even; `as` saturates and maps NaN to 0
fn round_float(f: f64) -> i128 {
    f.round_ties_even() as i128
}

fn clamp<T>(v: i128, min: T, max: T) -> T
where
    T: Copy + Into<i128> + TryFrom<i128>,
{
    let bounded = v.clamp(min.into(), max.into());
    T::try_from(bounded).unwrap_or(min)
}

fn tick_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Ticks (100 ns intervals) since 0001-01-01T00:00:00
pub fn datetime_to_ticks(dt: &NaiveDateTime) -> i64 {
    let delta = dt.signed_duration_since(tick_epoch());
    delta
        .num_seconds()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(delta.subsec_nanos() as i64 / 100)
}

/// Date/time for a tick count, clamped to years 1..=9999
pub fn ticks_to_datetime(ticks: i64) -> NaiveDateTime {
    let ticks = ticks.clamp(0, MAX_TICKS);
    let delta = TimeDelta::seconds(ticks / TICKS_PER_SECOND)
        + TimeDelta::nanoseconds((ticks % TICKS_PER_SECOND) * 100);
    let epoch = tick_epoch();
    epoch.checked_add_signed(delta).unwrap_or(epoch)
}

// ============================================================================
// Formatting
// ============================================================================

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.internal_value() {
            Number::Int(i) => write!(f, "{}", i),
            Number::UInt(u) => write!(f, "{}", u),
            Number::Float(v) => write!(f, "{}", v),
            Number::Single(v) => write!(f, "{}", v),
            Number::Bool(b) => write!(f, "{}", b),
            Number::Char(c) => write!(f, "{}", c),
            Number::DateTime(dt) => write!(f, "{}", dt),
            Number::Str(s) => f.write_str(&s),
        }
    }
}

// ============================================================================
// Arithmetic
// ============================================================================

macro_rules! impl_arith {
    ($($trait:ident :: $method:ident => $op:tt),* $(,)?) => {
        $(
            impl $trait for Number {
                type Output = Number;
                fn $method(self, rhs: Number) -> Number {
                    Number::Float(self.to_f64() $op rhs.to_f64())
                }
            }

            impl $trait<&Number> for &Number {
                type Output = Number;
                fn $method(self, rhs: &Number) -> Number {
                    Number::Float(self.to_f64() $op rhs.to_f64())
                }
            }

            impl $trait<f64> for Number {
                type Output = Number;
                fn $method(self, rhs: f64) -> Number {
                    Number::Float(self.to_f64() $op rhs)
                }
            }

            impl $trait<i64> for Number {
                type Output = Number;
                fn $method(self, rhs: i64) -> Number {
                    Number::Float(self.to_f64() $op rhs as f64)
                }
            }

            impl $trait<Number> for f64 {
                type Output = Number;
                fn $method(self, rhs: Number) -> Number {
                    Number::Float(self $op rhs.to_f64())
                }
            }

            impl $trait<Number> for i64 {
                type Output = Number;
                fn $method(self, rhs: Number) -> Number {
                    Number::Float(self as f64 $op rhs.to_f64())
                }
            }
        )*
    };
}

impl_arith! {
    Add::add => +,
    Sub::sub => -,
    Mul::mul => *,
    Div::div => /,
    Rem::rem => %,
}

impl Neg for Number {
    type Output = Number;

    fn neg(self) -> Number {
        if self.is_integer() {
            Number::Int(self.to_i64().saturating_neg())
        } else {
            Number::Float(-self.to_f64())
        }
    }
}

// ============================================================================
// Comparison
// ============================================================================

impl PartialEq for Number {
    fn eq(&self, other: &Number) -> bool {
        if self.is_integer() && other.is_integer() {
            self.to_i64() == other.to_i64()
        } else {
            self.to_f64() == other.to_f64()
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Number) -> Option<Ordering> {
        self.to_f64().partial_cmp(&other.to_f64())
    }
}

impl PartialEq<f64> for Number {
    fn eq(&self, other: &f64) -> bool {
        self.to_f64() == *other
    }
}

impl PartialOrd<f64> for Number {
    fn partial_cmp(&self, other: &f64) -> Option<Ordering> {
        self.to_f64().partial_cmp(other)
    }
}

impl PartialEq<i64> for Number {
    fn eq(&self, other: &i64) -> bool {
        if self.is_integer() {
            self.to_i64() == *other
        } else {
            self.to_f64() == *other as f64
        }
    }
}

impl PartialOrd<i64> for Number {
    fn partial_cmp(&self, other: &i64) -> Option<Ordering> {
        if self.is_integer() {
            Some(self.to_i64().cmp(other))
        } else {
            self.to_f64().partial_cmp(&(*other as f64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_exact_values() {
        assert_eq!(Number::from(42i32).to_i32(), 42);
        assert_eq!(Number::from(-7i8).to_i8(), -7);
        assert_eq!(Number::from(65535u16).to_u16(), 65535);
        assert_eq!(Number::from(2.5f64).to_f64(), 2.5);
        assert_eq!(Number::from(0.25f32).to_f32(), 0.25);
        assert_eq!(Number::from(1i64 << 53).to_i64(), 1i64 << 53);
        assert!(Number::from(true).to_bool());
        assert_eq!(Number::from('x').to_char(), 'x');
    }

    #[test]
    fn test_precision_loss_beyond_2_pow_53() {
        let big = Number::from(i64::MAX);
        // stored exactly
        assert_eq!(big.to_i64(), i64::MAX);
        // but arithmetic goes through f64
        let sum = Number::from(i64::MAX - 1) + 0i64;
        assert_ne!(sum.to_f64() as i128, (i64::MAX - 1) as i128);
    }

    #[test]
    fn test_float_to_int_rounds_half_even_and_saturates() {
        assert_eq!(Number::from(2.5).to_i32(), 2);
        assert_eq!(Number::from(3.5).to_i32(), 4);
        assert_eq!(Number::from(-2.5).to_i64(), -2);
        assert_eq!(Number::from(1e20).to_i32(), i32::MAX);
        assert_eq!(Number::from(-1e20).to_i8(), i8::MIN);
        assert_eq!(Number::from(-3.0).to_u32(), 0);
        assert_eq!(Number::from(f64::NAN).to_i64(), 0);
        assert_eq!(Number::from(300i64).to_u8(), u8::MAX);
    }

    #[test]
    fn test_string_conversions() {
        assert_eq!(Number::from("12").to_i32(), 12);
        assert_eq!(Number::from("abc").to_i32(), 0);
        assert_eq!(Number::from("2.5").to_f64(), 2.5);
        assert!(Number::from("TRUE").to_bool());
        assert!(!Number::from("yes").to_bool());
        assert_eq!(Number::from("q").to_char(), 'q');
        assert_eq!(Number::from("qq").to_char(), '\0');
    }

    #[test]
    fn test_bool_conversions() {
        assert_eq!(Number::from(true).to_i32(), 1);
        assert_eq!(Number::from(false).to_f64(), 0.0);
        assert_eq!(Number::from(true).to_char(), '✓');
        assert_eq!(Number::from(false).to_char(), '❌');
    }

    #[test]
    fn test_datetime_ticks() {
        let dt = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let n = Number::from(dt);
        assert_eq!(n.to_i64(), 630_822_816_000_000_000);
        assert_eq!(Number::from(n.to_i64()).to_datetime(), dt);
        assert_eq!(Number::from(0i64).to_datetime(), tick_epoch());
    }

    #[test]
    fn test_is_integer() {
        assert!(Number::from(true).is_integer());
        assert!(Number::from(u64::MAX).is_integer());
        assert!(Number::from('a').is_integer());
        assert!(Number::from(4.0).is_integer());
        assert!(!Number::from(4.5).is_integer());
        assert!(!Number::from(0.5f32).is_integer());
        assert!(!Number::from(f64::INFINITY).is_integer());
        assert_eq!(Number::from(4.5).numerical_type(), NumericalType::Float);
        assert_eq!(Number::from(4i32).numerical_type(), NumericalType::Integer);
    }

    #[test]
    fn test_internal_value_and_display() {
        assert!(matches!(Number::from("1.5").internal_value(), Number::Float(f) if f == 1.5));
        assert!(matches!(Number::from("x").internal_value(), Number::Str(_)));
        assert!(matches!(Number::from(true).internal_value(), Number::Int(1)));
        assert_eq!(Number::from(true).to_string(), "1");
        assert_eq!(Number::from(2.5).to_string(), "2.5");
        assert_eq!(Number::from(7u8).to_string(), "7");
    }

    #[test]
    fn test_arithmetic() {
        let a = Number::from(7i32);
        let b = Number::from(2i32);
        assert_eq!((a.clone() + b.clone()).to_f64(), 9.0);
        assert_eq!((a.clone() - b.clone()).to_f64(), 5.0);
        assert_eq!((a.clone() * b.clone()).to_f64(), 14.0);
        assert_eq!((a.clone() / b.clone()).to_f64(), 3.5);
        assert_eq!((a.clone() % b.clone()).to_f64(), 1.0);
        assert_eq!((&a + &b).to_f64(), 9.0);
        assert_eq!((a.clone() + 0.5).to_f64(), 7.5);
        assert_eq!((10i64 - a).to_f64(), 3.0);
    }

    #[test]
    fn test_negation() {
        assert!(matches!(-Number::from(3i32), Number::Int(-3)));
        assert!(matches!(-Number::from(1.5), Number::Float(f) if f == -1.5));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(Number::from(3i32), Number::from(3.0));
        assert_ne!(Number::from(3i32), Number::from(3.5));
        assert!(Number::from(2i32) < Number::from(2.5));
        assert_eq!(Number::from(5u8), 5i64);
        assert!(Number::from(5.5) > 5i64);
        assert_eq!(Number::from(0.5f32), 0.5f64);
        assert!(Number::from(1i32) < 1.5f64);
    }

    #[test]
    fn test_ne_bool_never_reports_inequality() {
        let one = Number::from(1i32);
        assert!(one.eq_bool(true));
        assert!(!one.eq_bool(false));
        // ne_bool mirrors eq_bool
        assert!(one.ne_bool(true));
        assert!(!one.ne_bool(false));
    }
}
