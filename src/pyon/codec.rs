//! PYON wire syntax - encoder and parser
//!
//! The wire text is JSON extended with:
//! - `NaN`, `Infinity` and `-Infinity` number tokens,
//! - tagged values `{"__jsonclass__": [tag, [args...]]}` carrying the types
//!   JSON cannot express (tuples, sets, non-string-keyed mappings, bytes,
//!   complex numbers, fractions, numeric arrays, registered custom types).
//!
//! `serde_json` cannot produce this superset (non-finite floats are rejected,
//! and the tuple/list and key-type distinctions are lost), so both directions
//! are hand-written here.

use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use num_complex::Complex64;
use num_rational::Rational64;
use thiserror::Error;

use super::registry::{registry, TypeRegistry};
use super::value::{NdArray, Scalar, ScalarKind, Value, ValueError};
use super::MAX_DEPTH;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("type {0} is not PYON serializable")]
    Unsupported(&'static str),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Eof,

    #[error("unexpected character {found:?} at byte {at}")]
    Unexpected { found: char, at: usize },

    #[error("trailing data at byte {0}")]
    Trailing(usize),

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("invalid number at byte {0}")]
    Number(usize),

    #[error("invalid escape sequence at byte {0}")]
    Escape(usize),

    #[error("unknown type tag {0:?}")]
    UnknownTag(String),

    #[error("malformed {tag:?} value: {reason}")]
    Tag { tag: String, reason: String },

    #[error("invalid binary payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Serializes a value to compact PYON: single-line, ASCII-only.
pub fn encode(value: &Value) -> Result<String, EncodeError> {
    let reg = registry().read().unwrap_or_else(|e| e.into_inner());
    encode_with(value, false, &reg)
}

/// Serializes a value to indented PYON with string-keyed mappings sorted by
/// key, for stable human-readable output.
pub fn encode_pretty(value: &Value) -> Result<String, EncodeError> {
    let reg = registry().read().unwrap_or_else(|e| e.into_inner());
    encode_with(value, true, &reg)
}

/// Serializes against an explicit registry instead of the process-wide one.
pub fn encode_with(
    value: &Value,
    pretty: bool,
    registry: &TypeRegistry,
) -> Result<String, EncodeError> {
    let mut w = Writer {
        out: String::new(),
        pretty,
        depth: 0,
        registry,
    };
    w.value(value)?;
    Ok(w.out)
}

/// Parses a PYON string and reconstructs the value.
pub fn decode(s: &str) -> Result<Value, DecodeError> {
    let reg = registry().read().unwrap_or_else(|e| e.into_inner());
    decode_with(s, &reg)
}

/// Parses against an explicit registry instead of the process-wide one.
pub fn decode_with(s: &str, registry: &TypeRegistry) -> Result<Value, DecodeError> {
    let mut p = Parser {
        bytes: s.as_bytes(),
        pos: 0,
        depth: 0,
        registry,
    };
    p.skip_ws();
    let value = p.value()?;
    p.skip_ws();
    if p.pos != p.bytes.len() {
        return Err(DecodeError::Trailing(p.pos));
    }
    Ok(value)
}

struct Writer<'r> {
    out: String,
    pretty: bool,
    depth: usize,
    registry: &'r TypeRegistry,
}

impl Writer<'_> {
    fn value(&mut self, v: &Value) -> Result<(), EncodeError> {
        match v {
            Value::None => self.out.push_str("null"),
            Value::Bool(true) => self.out.push_str("true"),
            Value::Bool(false) => self.out.push_str("false"),
            Value::Int(i) => {
                let _ = write!(self.out, "{}", i);
            }
            Value::Float(f) => self.float(*f),
            Value::Str(s) => self.string(s),
            Value::Bytes(b) => {
                let encoded = BASE64.encode(b);
                self.jsonclass("bytes", 1, |w, _| {
                    w.string(&encoded);
                    Ok(())
                })?;
            }
            Value::List(items) => {
                self.array(items.len(), |w, i| w.value(&items[i]))?;
            }
            Value::Tuple(items) => {
                self.jsonclass("tuple", 1, |w, _| {
                    w.array(items.len(), |w, i| w.value(&items[i]))
                })?;
            }
            Value::Set(items) => {
                self.jsonclass("set", 1, |w, _| {
                    w.array(items.len(), |w, i| w.value(&items[i]))
                })?;
            }
            Value::Dict(pairs) => {
                if pairs.iter().all(|(k, _)| matches!(k, Value::Str(_))) {
                    self.object(pairs)?;
                } else {
                    self.jsonclass("dict", 1, |w, _| w.pair_list(pairs))?;
                }
            }
            Value::OrderedDict(pairs) => {
                self.jsonclass("ordered_dict", 1, |w, _| w.pair_list(pairs))?;
            }
            Value::Complex(c) => {
                let (re, im) = (c.re, c.im);
                self.jsonclass("complex", 2, |w, i| {
                    w.float(if i == 0 { re } else { im });
                    Ok(())
                })?;
            }
            Value::Fraction(f) => {
                let (n, d) = (*f.numer(), *f.denom());
                self.jsonclass("fraction", 2, |w, i| {
                    let _ = write!(w.out, "{}", if i == 0 { n } else { d });
                    Ok(())
                })?;
            }
            Value::Array(a) => {
                let data = BASE64.encode(a.data());
                self.jsonclass("nparray", 3, |w, i| {
                    match i {
                        0 => {
                            let shape = a.shape();
                            w.array(shape.len(), |w, j| {
                                let _ = write!(w.out, "{}", shape[j]);
                                Ok(())
                            })?;
                        }
                        1 => w.string(a.kind().dtype_str()),
                        _ => w.string(&data),
                    }
                    Ok(())
                })?;
            }
            Value::Scalar(s) => {
                let data = BASE64.encode(s.data());
                self.jsonclass("npscalar", 2, |w, i| {
                    if i == 0 {
                        w.string(s.kind().dtype_str());
                    } else {
                        w.string(&data);
                    }
                    Ok(())
                })?;
            }
            Value::Opaque(o) => {
                let (tag, args) = self
                    .registry
                    .encode_opaque(o)
                    .ok_or(EncodeError::Unsupported(o.type_name()))?;
                self.jsonclass(&tag, args.len(), |w, i| w.value(&args[i]))?;
            }
        }
        Ok(())
    }

    fn float(&mut self, f: f64) {
        if f.is_nan() {
            self.out.push_str("NaN");
        } else if f == f64::INFINITY {
            self.out.push_str("Infinity");
        } else if f == f64::NEG_INFINITY {
            self.out.push_str("-Infinity");
        } else {
            let start = self.out.len();
            let _ = write!(self.out, "{}", f);
            // keep the float/int distinction in the text
            if !self.out[start..].contains(['.', 'e', 'E']) {
                self.out.push_str(".0");
            }
        }
    }

    fn string(&mut self, s: &str) {
        self.out.push('"');
        for c in s.chars() {
            match c {
                '"' => self.out.push_str("\\\""),
                '\\' => self.out.push_str("\\\\"),
                '\n' => self.out.push_str("\\n"),
                '\r' => self.out.push_str("\\r"),
                '\t' => self.out.push_str("\\t"),
                '\u{08}' => self.out.push_str("\\b"),
                '\u{0c}' => self.out.push_str("\\f"),
                c if (c as u32) < 0x20 => {
                    let _ = write!(self.out, "\\u{:04x}", c as u32);
                }
                c if c.is_ascii() => self.out.push(c),
                c => {
                    let mut buf = [0u16; 2];
                    for unit in c.encode_utf16(&mut buf).iter() {
                        let _ = write!(self.out, "\\u{:04x}", unit);
                    }
                }
            }
        }
        self.out.push('"');
    }

    fn newline_indent(&mut self) {
        self.out.push('\n');
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
    }

    fn array<F>(&mut self, n: usize, mut item: F) -> Result<(), EncodeError>
    where
        F: FnMut(&mut Self, usize) -> Result<(), EncodeError>,
    {
        if n == 0 {
            self.out.push_str("[]");
            return Ok(());
        }
        self.out.push('[');
        self.depth += 1;
        for i in 0..n {
            if i > 0 {
                self.out.push(',');
            }
            if self.pretty {
                self.newline_indent();
            }
            item(self, i)?;
        }
        self.depth -= 1;
        if self.pretty {
            self.newline_indent();
        }
        self.out.push(']');
        Ok(())
    }

    fn object(&mut self, pairs: &[(Value, Value)]) -> Result<(), EncodeError> {
        let mut ordered: Vec<&(Value, Value)> = pairs.iter().collect();
        if self.pretty {
            ordered.sort_by(|a, b| a.0.as_str().cmp(&b.0.as_str()));
        }
        if ordered.is_empty() {
            self.out.push_str("{}");
            return Ok(());
        }
        self.out.push('{');
        self.depth += 1;
        for (i, (k, v)) in ordered.into_iter().enumerate() {
            if i > 0 {
                self.out.push(',');
            }
            if self.pretty {
                self.newline_indent();
            }
            if let Value::Str(k) = k {
                self.string(k);
            }
            self.out.push(':');
            if self.pretty {
                self.out.push(' ');
            }
            self.value(v)?;
        }
        self.depth -= 1;
        if self.pretty {
            self.newline_indent();
        }
        self.out.push('}');
        Ok(())
    }

    /// Key/value entries as a list of two-element lists, for tagged mappings.
    fn pair_list(&mut self, pairs: &[(Value, Value)]) -> Result<(), EncodeError> {
        self.array(pairs.len(), |w, i| {
            let (k, v) = &pairs[i];
            w.array(2, |w, j| w.value(if j == 0 { k } else { v }))
        })
    }

    fn jsonclass<F>(&mut self, tag: &str, nargs: usize, mut arg: F) -> Result<(), EncodeError>
    where
        F: FnMut(&mut Self, usize) -> Result<(), EncodeError>,
    {
        self.out.push('{');
        self.depth += 1;
        if self.pretty {
            self.newline_indent();
        }
        self.string("__jsonclass__");
        self.out.push(':');
        if self.pretty {
            self.out.push(' ');
        }
        self.out.push('[');
        self.depth += 1;
        if self.pretty {
            self.newline_indent();
        }
        self.string(tag);
        self.out.push(',');
        if self.pretty {
            self.newline_indent();
        }
        self.array(nargs, &mut arg)?;
        self.depth -= 1;
        if self.pretty {
            self.newline_indent();
        }
        self.out.push(']');
        self.depth -= 1;
        if self.pretty {
            self.newline_indent();
        }
        self.out.push('}');
        Ok(())
    }
}

struct Parser<'a, 'r> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
    registry: &'r TypeRegistry,
}

impl Parser<'_, '_> {
    fn skip_ws(&mut self) {
        while let Some(&b) = self.bytes.get(self.pos) {
            if b == b' ' || b == b'\t' || b == b'\n' || b == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.bytes.get(self.pos).copied().ok_or(DecodeError::Eof)
    }

    fn unexpected(&self) -> DecodeError {
        match self.bytes.get(self.pos) {
            Some(&b) => DecodeError::Unexpected {
                found: b as char,
                at: self.pos,
            },
            None => DecodeError::Eof,
        }
    }

    fn literal(&mut self, text: &str) -> Result<(), DecodeError> {
        if self.bytes[self.pos..].starts_with(text.as_bytes()) {
            self.pos += text.len();
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn value(&mut self) -> Result<Value, DecodeError> {
        match self.peek()? {
            b'{' => self.object(),
            b'[' => self.array().map(Value::List),
            b'"' => self.string().map(Value::Str),
            b't' => self.literal("true").map(|_| Value::Bool(true)),
            b'f' => self.literal("false").map(|_| Value::Bool(false)),
            b'n' => self.literal("null").map(|_| Value::None),
            b'N' => self.literal("NaN").map(|_| Value::Float(f64::NAN)),
            b'I' => self
                .literal("Infinity")
                .map(|_| Value::Float(f64::INFINITY)),
            b'-' if self.bytes.get(self.pos + 1) == Some(&b'I') => {
                self.literal("-Infinity")
                    .map(|_| Value::Float(f64::NEG_INFINITY))
            }
            b'-' | b'0'..=b'9' => self.number(),
            _ => Err(self.unexpected()),
        }
    }

    fn enter(&mut self) -> Result<(), DecodeError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep(MAX_DEPTH));
        }
        Ok(())
    }

    fn array(&mut self) -> Result<Vec<Value>, DecodeError> {
        self.enter()?;
        self.pos += 1; // '['
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek()? == b']' {
            self.pos += 1;
            self.depth -= 1;
            return Ok(items);
        }
        loop {
            items.push(self.value()?);
            self.skip_ws();
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    self.skip_ws();
                }
                b']' => {
                    self.pos += 1;
                    self.depth -= 1;
                    return Ok(items);
                }
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn object(&mut self) -> Result<Value, DecodeError> {
        self.enter()?;
        self.pos += 1; // '{'
        let mut pairs: Vec<(Value, Value)> = Vec::new();
        self.skip_ws();
        if self.peek()? == b'}' {
            self.pos += 1;
            self.depth -= 1;
            return Ok(Value::Dict(pairs));
        }
        loop {
            if self.peek()? != b'"' {
                return Err(self.unexpected());
            }
            let key = self.string()?;
            self.skip_ws();
            if self.peek()? != b':' {
                return Err(self.unexpected());
            }
            self.pos += 1;
            self.skip_ws();
            let value = self.value()?;
            pairs.push((Value::Str(key), value));
            self.skip_ws();
            match self.peek()? {
                b',' => {
                    self.pos += 1;
                    self.skip_ws();
                }
                b'}' => {
                    self.pos += 1;
                    self.depth -= 1;
                    break;
                }
                _ => return Err(self.unexpected()),
            }
        }
        if let Some(idx) = pairs
            .iter()
            .position(|(k, _)| k.as_str() == Some("__jsonclass__"))
        {
            let (_, tagged) = pairs.swap_remove(idx);
            return self.jsonclass(tagged);
        }
        Ok(Value::Dict(pairs))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        self.pos += 1; // '"'
        let mut out = String::new();
        loop {
            let start = self.pos;
            while let Some(&b) = self.bytes.get(self.pos) {
                if b == b'"' || b == b'\\' || b < 0x20 {
                    break;
                }
                self.pos += 1;
            }
            // the input is a &str, so the unescaped span is valid UTF-8
            out.push_str(
                std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|_| DecodeError::Escape(start))?,
            );
            match self.peek()? {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    self.escape(&mut out)?;
                }
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Result<(), DecodeError> {
        let at = self.pos - 1;
        let b = self.peek()?;
        self.pos += 1;
        match b {
            b'"' => out.push('"'),
            b'\\' => out.push('\\'),
            b'/' => out.push('/'),
            b'b' => out.push('\u{08}'),
            b'f' => out.push('\u{0c}'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b't' => out.push('\t'),
            b'u' => {
                let unit = self.hex4().ok_or(DecodeError::Escape(at))?;
                let c = if (0xd800..0xdc00).contains(&unit) {
                    // high surrogate, a \uXXXX low surrogate must follow
                    if self.peek()? != b'\\' || self.bytes.get(self.pos + 1) != Some(&b'u') {
                        return Err(DecodeError::Escape(at));
                    }
                    self.pos += 2;
                    let low = self.hex4().ok_or(DecodeError::Escape(at))?;
                    if !(0xdc00..0xe000).contains(&low) {
                        return Err(DecodeError::Escape(at));
                    }
                    let cp = 0x10000 + ((unit - 0xd800) << 10) + (low - 0xdc00);
                    char::from_u32(cp).ok_or(DecodeError::Escape(at))?
                } else {
                    char::from_u32(unit).ok_or(DecodeError::Escape(at))?
                };
                out.push(c);
            }
            _ => return Err(DecodeError::Escape(at)),
        }
        Ok(())
    }

    fn hex4(&mut self) -> Option<u32> {
        let chunk = self.bytes.get(self.pos..self.pos + 4)?;
        let s = std::str::from_utf8(chunk).ok()?;
        let v = u32::from_str_radix(s, 16).ok()?;
        self.pos += 4;
        Some(v)
    }

    fn number(&mut self) -> Result<Value, DecodeError> {
        let start = self.pos;
        if self.peek()? == b'-' {
            self.pos += 1;
        }
        let digits_start = self.pos;
        let mut fractional = false;
        while let Some(&b) = self.bytes.get(self.pos) {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' | b'e' | b'E' => {
                    fractional = true;
                    self.pos += 1;
                }
                b'+' | b'-' if fractional => self.pos += 1,
                _ => break,
            }
        }
        if self.pos == digits_start {
            return Err(DecodeError::Number(start));
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| DecodeError::Number(start))?;
        if fractional {
            let f: f64 = text.parse().map_err(|_| DecodeError::Number(start))?;
            Ok(Value::Float(f))
        } else if let Ok(i) = text.parse::<i64>() {
            Ok(Value::Int(i))
        } else {
            // out of i64 range, keep the magnitude as a float
            let f: f64 = text.parse().map_err(|_| DecodeError::Number(start))?;
            Ok(Value::Float(f))
        }
    }

    fn tag_err(tag: &str, reason: impl Into<String>) -> DecodeError {
        DecodeError::Tag {
            tag: tag.to_owned(),
            reason: reason.into(),
        }
    }

    fn jsonclass(&mut self, tagged: Value) -> Result<Value, DecodeError> {
        let items = match tagged {
            Value::List(items) if items.len() == 2 => items,
            _ => {
                return Err(Self::tag_err(
                    "__jsonclass__",
                    "expected [tag, [arguments]]",
                ))
            }
        };
        let mut it = items.into_iter();
        let tag = match it.next() {
            Some(Value::Str(tag)) => tag,
            _ => return Err(Self::tag_err("__jsonclass__", "tag must be a string")),
        };
        let args = match it.next() {
            Some(Value::List(args)) => args,
            _ => return Err(Self::tag_err(&tag, "arguments must be a list")),
        };
        self.dispatch(&tag, args)
    }

    fn dispatch(&mut self, tag: &str, args: Vec<Value>) -> Result<Value, DecodeError> {
        match tag {
            "tuple" => match into1(args) {
                Some(Value::List(items)) => Ok(Value::Tuple(items)),
                _ => Err(Self::tag_err(tag, "expected one list argument")),
            },
            "set" => match into1(args) {
                Some(Value::List(items)) => Ok(Value::Set(items)),
                _ => Err(Self::tag_err(tag, "expected one list argument")),
            },
            "dict" => Ok(Value::Dict(pairs_arg(tag, args)?)),
            "ordered_dict" => Ok(Value::OrderedDict(pairs_arg(tag, args)?)),
            "bytes" => match into1(args) {
                Some(Value::Str(s)) => Ok(Value::Bytes(BASE64.decode(s.as_bytes())?)),
                _ => Err(Self::tag_err(tag, "expected one base64 string argument")),
            },
            "complex" => match args.as_slice() {
                [re, im] => {
                    let re = re.as_f64().ok_or_else(|| Self::tag_err(tag, "non-numeric real part"))?;
                    let im = im.as_f64().ok_or_else(|| Self::tag_err(tag, "non-numeric imaginary part"))?;
                    Ok(Value::Complex(Complex64::new(re, im)))
                }
                _ => Err(Self::tag_err(tag, "expected two numeric arguments")),
            },
            "fraction" => match args.as_slice() {
                [Value::Int(n), Value::Int(d)] => {
                    if *d == 0 {
                        return Err(Self::tag_err(tag, "zero denominator"));
                    }
                    Ok(Value::Fraction(Rational64::new(*n, *d)))
                }
                _ => Err(Self::tag_err(tag, "expected two integer arguments")),
            },
            "nparray" => match args.as_slice() {
                [Value::List(shape), Value::Str(dtype), Value::Str(data)] => {
                    let shape = shape
                        .iter()
                        .map(|v| match v {
                            Value::Int(i) if *i >= 0 => Ok(*i as usize),
                            _ => Err(Self::tag_err(tag, "invalid shape")),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let kind = ScalarKind::from_dtype_str(dtype)
                        .ok_or_else(|| Self::tag_err(tag, format!("unsupported dtype {:?}", dtype)))?;
                    let data = BASE64.decode(data.as_bytes())?;
                    Ok(Value::Array(NdArray::new(shape, kind, data)?))
                }
                _ => Err(Self::tag_err(tag, "expected [shape, dtype, data]")),
            },
            "npscalar" => match args.as_slice() {
                [Value::Str(dtype), Value::Str(data)] => {
                    let kind = ScalarKind::from_dtype_str(dtype)
                        .ok_or_else(|| Self::tag_err(tag, format!("unsupported dtype {:?}", dtype)))?;
                    let data = BASE64.decode(data.as_bytes())?;
                    Ok(Value::Scalar(Scalar::new(kind, data)?))
                }
                _ => Err(Self::tag_err(tag, "expected [dtype, data]")),
            },
            _ => match self.registry.decode_tag(tag, &args) {
                Some(Ok(value)) => Ok(value),
                Some(Err(reason)) => Err(Self::tag_err(tag, reason)),
                None => Err(DecodeError::UnknownTag(tag.to_owned())),
            },
        }
    }
}

fn into1(args: Vec<Value>) -> Option<Value> {
    let mut it = args.into_iter();
    match (it.next(), it.next()) {
        (Some(v), None) => Some(v),
        _ => None,
    }
}

fn pairs_arg(tag: &str, args: Vec<Value>) -> Result<Vec<(Value, Value)>, DecodeError> {
    let entries = match into1(args) {
        Some(Value::List(entries)) => entries,
        _ => return Err(Parser::tag_err(tag, "expected one list argument")),
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            Value::List(kv) if kv.len() == 2 => {
                let mut it = kv.into_iter();
                Ok((it.next().unwrap_or(Value::None), it.next().unwrap_or(Value::None)))
            }
            _ => Err(Parser::tag_err(tag, "entries must be [key, value] pairs")),
        })
        .collect()
}
