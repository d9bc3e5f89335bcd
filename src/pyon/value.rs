//! The PYON value model
//!
//! [`Value`] is the payload type for every protocol message. It is a closed
//! recursive union over the wire-representable types, plus [`Value::Opaque`]
//! for registry-backed extension types.

use num_complex::Complex64;
use num_rational::Rational64;
use thiserror::Error;

use super::registry::Opaque;

/// Errors constructing array and scalar values.
#[derive(Error, Debug)]
pub enum ValueError {
    #[error("array data is {got} bytes, shape {shape:?} of {kind} needs {want}")]
    ArrayShape {
        shape: Vec<usize>,
        kind: ScalarKind,
        want: usize,
        got: usize,
    },

    #[error("scalar data is {got} bytes, {kind} is {want} bytes wide")]
    ScalarWidth {
        kind: ScalarKind,
        want: usize,
        got: usize,
    },
}

/// Element kind of a numeric array or scalar.
///
/// The wire tags are numpy `dtype.str` strings (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    F32,
    F64,
    C64,
    C128,
}

impl ScalarKind {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::I8 | ScalarKind::U8 => 1,
            ScalarKind::I16 | ScalarKind::U16 | ScalarKind::F16 => 2,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 | ScalarKind::C64 => 8,
            ScalarKind::C128 => 16,
        }
    }

    /// The wire tag for this kind.
    pub fn dtype_str(self) -> &'static str {
        match self {
            ScalarKind::Bool => "|b1",
            ScalarKind::I8 => "|i1",
            ScalarKind::I16 => "<i2",
            ScalarKind::I32 => "<i4",
            ScalarKind::I64 => "<i8",
            ScalarKind::U8 => "|u1",
            ScalarKind::U16 => "<u2",
            ScalarKind::U32 => "<u4",
            ScalarKind::U64 => "<u8",
            ScalarKind::F16 => "<f2",
            ScalarKind::F32 => "<f4",
            ScalarKind::F64 => "<f8",
            ScalarKind::C64 => "<c8",
            ScalarKind::C128 => "<c16",
        }
    }

    /// Parses a wire tag. Big-endian tags are rejected; `<`, `|` and `=`
    /// prefixes are accepted interchangeably.
    pub fn from_dtype_str(s: &str) -> Option<Self> {
        let rest = match s.as_bytes().first()? {
            b'<' | b'|' | b'=' => &s[1..],
            _ => return None,
        };
        match rest {
            "b1" => Some(ScalarKind::Bool),
            "i1" => Some(ScalarKind::I8),
            "i2" => Some(ScalarKind::I16),
            "i4" => Some(ScalarKind::I32),
            "i8" => Some(ScalarKind::I64),
            "u1" => Some(ScalarKind::U8),
            "u2" => Some(ScalarKind::U16),
            "u4" => Some(ScalarKind::U32),
            "u8" => Some(ScalarKind::U64),
            "f2" => Some(ScalarKind::F16),
            "f4" => Some(ScalarKind::F32),
            "f8" => Some(ScalarKind::F64),
            "c8" => Some(ScalarKind::C64),
            "c16" => Some(ScalarKind::C128),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dtype_str())
    }
}

/// A Rust type usable as an array element.
pub trait ArrayElement {
    const KIND: ScalarKind;
    fn write_le(&self, out: &mut Vec<u8>);
}

macro_rules! array_element {
    ($ty:ty, $kind:expr) => {
        impl ArrayElement for $ty {
            const KIND: ScalarKind = $kind;
            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

array_element!(i8, ScalarKind::I8);
array_element!(i16, ScalarKind::I16);
array_element!(i32, ScalarKind::I32);
array_element!(i64, ScalarKind::I64);
array_element!(u8, ScalarKind::U8);
array_element!(u16, ScalarKind::U16);
array_element!(u32, ScalarKind::U32);
array_element!(u64, ScalarKind::U64);
array_element!(f32, ScalarKind::F32);
array_element!(f64, ScalarKind::F64);

impl ArrayElement for bool {
    const KIND: ScalarKind = ScalarKind::Bool;
    fn write_le(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
}

impl ArrayElement for Complex64 {
    const KIND: ScalarKind = ScalarKind::C128;
    fn write_le(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.re.to_le_bytes());
        out.extend_from_slice(&self.im.to_le_bytes());
    }
}

/// An N-dimensional numeric array: shape, element kind and raw row-major
/// little-endian bytes. Always owns a contiguous copy of its data.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    kind: ScalarKind,
    data: Vec<u8>,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, kind: ScalarKind, data: Vec<u8>) -> Result<Self, ValueError> {
        let want = shape.iter().product::<usize>() * kind.size();
        if data.len() != want {
            return Err(ValueError::ArrayShape {
                shape,
                kind,
                want,
                got: data.len(),
            });
        }
        Ok(Self { shape, kind, data })
    }

    /// Builds an array from typed elements in row-major order.
    pub fn from_elems<T: ArrayElement>(shape: Vec<usize>, elems: &[T]) -> Result<Self, ValueError> {
        let mut data = Vec::with_capacity(elems.len() * T::KIND.size());
        for e in elems {
            e.write_le(&mut data);
        }
        Self::new(shape, T::KIND, data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single fixed-width numeric value tagged with its element kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    kind: ScalarKind,
    data: Vec<u8>,
}

impl Scalar {
    pub fn new(kind: ScalarKind, data: Vec<u8>) -> Result<Self, ValueError> {
        if data.len() != kind.size() {
            return Err(ValueError::ScalarWidth {
                kind,
                want: kind.size(),
                got: data.len(),
            });
        }
        Ok(Self { kind, data })
    }

    pub fn from_elem<T: ArrayElement>(value: T) -> Self {
        let mut data = Vec::with_capacity(T::KIND.size());
        value.write_le(&mut data);
        Self {
            kind: T::KIND,
            data,
        }
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// True if this is a floating or complex scalar holding a NaN.
    ///
    /// NaN payloads never compare equal, so callers must use this instead of
    /// `==` when NaNs are possible.
    pub fn is_nan(&self) -> bool {
        fn f16_is_nan(bytes: &[u8]) -> bool {
            let bits = u16::from_le_bytes([bytes[0], bytes[1]]);
            bits & 0x7c00 == 0x7c00 && bits & 0x03ff != 0
        }
        fn f32_at(bytes: &[u8], at: usize) -> f32 {
            f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        }
        fn f64_at(bytes: &[u8], at: usize) -> f64 {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            f64::from_le_bytes(b)
        }
        match self.kind {
            ScalarKind::F16 => f16_is_nan(&self.data),
            ScalarKind::F32 => f32_at(&self.data, 0).is_nan(),
            ScalarKind::F64 => f64_at(&self.data, 0).is_nan(),
            ScalarKind::C64 => f32_at(&self.data, 0).is_nan() || f32_at(&self.data, 4).is_nan(),
            ScalarKind::C128 => f64_at(&self.data, 0).is_nan() || f64_at(&self.data, 8).is_nan(),
            _ => false,
        }
    }
}

impl<T: ArrayElement> From<T> for Scalar {
    fn from(value: T) -> Self {
        Scalar::from_elem(value)
    }
}

/// A PYON value.
///
/// Mappings keep insertion order and may use any `Value` as key;
/// [`Value::OrderedDict`] is a distinct variant whose equality is
/// order-sensitive, while [`Value::Dict`] and [`Value::Set`] compare as
/// unordered collections.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(Complex64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    OrderedDict(Vec<(Value, Value)>),
    Fraction(Rational64),
    Array(NdArray),
    Scalar(Scalar),
    Opaque(Opaque),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::List(items.into_iter().collect())
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Set(items.into_iter().collect())
    }

    pub fn dict(pairs: impl IntoIterator<Item = (Value, Value)>) -> Value {
        Value::Dict(pairs.into_iter().collect())
    }

    pub fn ordered_dict(pairs: impl IntoIterator<Item = (Value, Value)>) -> Value {
        Value::OrderedDict(pairs.into_iter().collect())
    }

    /// Wraps a custom type registered with the codec registry.
    pub fn opaque<T>(value: T) -> Value
    where
        T: std::any::Any + Send + Sync + PartialEq + std::fmt::Debug,
    {
        Value::Opaque(Opaque::new(value))
    }

    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(_) => "complex",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::OrderedDict(_) => "ordered_dict",
            Value::Fraction(_) => "fraction",
            Value::Array(_) => "nparray",
            Value::Scalar(_) => "npscalar",
            Value::Opaque(_) => "opaque",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric accessor accepting both integers and floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Elements of a list or tuple.
    pub fn as_slice(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Entries of a mapping (plain or ordered).
    pub fn as_pairs(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(pairs) | Value::OrderedDict(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Looks up a string key in a mapping.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_pairs()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// True for NaN-bearing floats, complex numbers and scalars.
    pub fn is_nan(&self) -> bool {
        match self {
            Value::Float(f) => f.is_nan(),
            Value::Complex(c) => c.re.is_nan() || c.im.is_nan(),
            Value::Scalar(s) => s.is_nan(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<Complex64> for Value {
    fn from(v: Complex64) -> Value {
        Value::Complex(v)
    }
}

impl From<Rational64> for Value {
    fn from(v: Rational64) -> Value {
        Value::Fraction(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::Str(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Value {
        Value::Array(v)
    }
}

impl From<Scalar> for Value {
    fn from(v: Scalar) -> Value {
        Value::Scalar(v)
    }
}

fn unordered_eq(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    'outer: for x in a {
        for (i, y) in b.iter().enumerate() {
            if !used[i] && x == y {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

fn unordered_pairs_eq(a: &[(Value, Value)], b: &[(Value, Value)]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    'outer: for (xk, xv) in a {
        for (i, (yk, yv)) in b.iter().enumerate() {
            if !used[i] && xk == yk && xv == yv {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Complex(a), Value::Complex(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => unordered_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => unordered_pairs_eq(a, b),
            (Value::OrderedDict(a), Value::OrderedDict(b)) => a == b,
            (Value::Fraction(a), Value::Fraction(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}
