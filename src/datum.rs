use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ErrorKind;

// ── NaN-boxed word ─────────────────────────────────────────────────

// Scalar values are packed into one 64-bit word. Any word whose exponent
// bits are not all ones is a plain double; infinities (zero mantissa) are
// also plain doubles. Everything else carries a 5-bit type id spread over
// the sign bit and the top mantissa nibble:
//
//   word = ((id & 0x10) << 11 | (id & 0xf) | 0x7ff0) << 48 | payload48
//
// NaN doubles are normalized to undefined on construction, so no stored
// double ever collides with a boxed pattern.
const BOOLEAN_ID: u8 = 0b00001;
const NULL_ID: u8 = 0b00010;
const UNDEFINED_ID: u8 = 0b00011;
const BREAK_ID: u8 = 0b00100;
const CONTINUE_ID: u8 = 0b00101;
// Integer ids are the sixteen ids with bit 3 set; the id's low three bits
// and its sign bit hold bits 48..51 of the 52-bit two's-complement value.
const INTEGER_ID_BASE: u8 = 0b01000;
// Short-string ids 0b10001..0b10111 encode length 0..6. Id 0b10000 is
// unusable (its zero-payload pattern is -inf).
const STRING_ID_BASE: u8 = 0b10001;

const PAYLOAD_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// Smallest integer that fits the boxed representation: -2^51.
pub const DATUM_MIN_INT: i64 = -(1 << 51);
/// Largest integer that fits the boxed representation: 2^51 - 1.
pub const DATUM_MAX_INT: i64 = (1 << 51) - 1;

const fn make_id(id: u8) -> u64 {
    (((id as u64 & 0x10) << 11) | (id as u64 & 0xf) | 0x7ff0) << 48
}

/// A NaN-boxed scalar: float, 52-bit int, bool, null, undefined, short
/// string (up to 6 bytes), or the break/continue control values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Word(u64);

pub(crate) enum WordKind {
    Undefined,
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    ShortString { buf: [u8; 6], len: usize },
    Break,
    Continue,
}

impl Word {
    pub(crate) const UNDEFINED: Word = Word(make_id(UNDEFINED_ID));
    pub(crate) const NULL: Word = Word(make_id(NULL_ID));
    pub(crate) const BREAK: Word = Word(make_id(BREAK_ID));
    pub(crate) const CONTINUE: Word = Word(make_id(CONTINUE_ID));

    pub(crate) fn from_bool(v: bool) -> Word {
        Word(make_id(BOOLEAN_ID) | v as u64)
    }

    /// Box a float. NaN is normalized to undefined so that boxed patterns
    /// are never observable as numbers.
    pub(crate) fn from_f64(v: f64) -> Word {
        if v.is_nan() {
            Word::UNDEFINED
        } else {
            Word(v.to_bits())
        }
    }

    /// Box an integer, wrapping into the 52-bit range.
    pub(crate) fn from_i64(v: i64) -> Word {
        let val52 = (v as u64) & 0x000f_ffff_ffff_ffff;
        let high4 = (val52 >> 48) as u8;
        let id = INTEGER_ID_BASE | (high4 & 0b0111) | ((high4 & 0b1000) << 1);
        Word(make_id(id) | (val52 & PAYLOAD_MASK))
    }

    /// Box a string of at most 6 bytes, first byte in the most
    /// significant payload byte.
    pub(crate) fn from_short_str(s: &str) -> Word {
        debug_assert!(s.len() <= 6);
        let bytes = s.as_bytes();
        let mut payload = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            payload |= (*b as u64) << (40 - 8 * i);
        }
        Word(make_id(STRING_ID_BASE + bytes.len() as u8) | payload)
    }

    fn id(self) -> Option<u8> {
        let top16 = (self.0 >> 48) as u16;
        if top16 & 0x7ff0 != 0x7ff0 {
            return None;
        }
        let id = (((top16 >> 11) & 0x10) | (top16 & 0xf)) as u8;
        if id & 0xf == 0 {
            // +inf / -inf
            None
        } else {
            Some(id)
        }
    }

    pub(crate) fn kind(self) -> WordKind {
        let id = match self.id() {
            None => return WordKind::Float(f64::from_bits(self.0)),
            Some(id) => id,
        };
        if id & 0b01000 != 0 {
            let val52 = (((id as u64 >> 4) & 1) << 51)
                | ((id as u64 & 0b0111) << 48)
                | (self.0 & PAYLOAD_MASK);
            return WordKind::Integer(((val52 << 12) as i64) >> 12);
        }
        if (STRING_ID_BASE..STRING_ID_BASE + 7).contains(&id) {
            let len = (id - STRING_ID_BASE) as usize;
            let mut buf = [0u8; 6];
            for (i, b) in buf.iter_mut().enumerate().take(len) {
                *b = (self.0 >> (40 - 8 * i)) as u8;
            }
            return WordKind::ShortString { buf, len };
        }
        match id {
            BOOLEAN_ID => WordKind::Bool(self.0 & 1 != 0),
            NULL_ID => WordKind::Null,
            UNDEFINED_ID => WordKind::Undefined,
            BREAK_ID => WordKind::Break,
            CONTINUE_ID => WordKind::Continue,
            _ => WordKind::Undefined,
        }
    }

    #[cfg(test)]
    pub(crate) fn to_bits(self) -> u64 {
        self.0
    }
}

// ── Datum ──────────────────────────────────────────────────────────

/// The dynamic value the engine computes with.
///
/// Scalars live NaN-boxed in a single word; strings longer than six
/// bytes, vectors, and maps are heap variants with the same external
/// contract. Maps are ordered by the total order of their keys so that
/// iteration is deterministic.
#[derive(Clone)]
pub struct Datum {
    repr: Repr,
}

#[derive(Clone)]
enum Repr {
    Word(Word),
    Long(Box<str>),
    Vector(Vec<Datum>),
    Map(BTreeMap<Datum, Datum>),
}

/// An operator or conversion failure; the evaluator attaches the source
/// location.
#[derive(Debug, Clone, PartialEq)]
pub struct DatumError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DatumError {
    fn type_mismatch(message: String) -> DatumError {
        DatumError {
            kind: ErrorKind::TypeMismatch,
            message,
        }
    }

    fn invalid_operation(message: String) -> DatumError {
        DatumError {
            kind: ErrorKind::InvalidOperation,
            message,
        }
    }
}

enum StrRef<'a> {
    Short { buf: [u8; 6], len: usize },
    Long(&'a str),
}

impl<'a> StrRef<'a> {
    fn as_str(&self) -> &str {
        match self {
            // The buffer holds a complete str stored earlier, so it is
            // valid UTF-8.
            StrRef::Short { buf, len } => std::str::from_utf8(&buf[..*len]).unwrap_or(""),
            StrRef::Long(s) => s,
        }
    }
}

impl Datum {
    // ── Constructors ───────────────────────────────────────────────

    pub fn undefined() -> Datum {
        Datum {
            repr: Repr::Word(Word::UNDEFINED),
        }
    }

    pub fn null() -> Datum {
        Datum {
            repr: Repr::Word(Word::NULL),
        }
    }

    pub fn break_value() -> Datum {
        Datum {
            repr: Repr::Word(Word::BREAK),
        }
    }

    pub fn continue_value() -> Datum {
        Datum {
            repr: Repr::Word(Word::CONTINUE),
        }
    }

    fn from_word(word: Word) -> Datum {
        Datum {
            repr: Repr::Word(word),
        }
    }

    // ── Predicates ─────────────────────────────────────────────────

    pub fn is_undefined(&self) -> bool {
        matches!(self.repr, Repr::Word(w) if matches!(w.kind(), WordKind::Undefined))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.repr, Repr::Word(w) if matches!(w.kind(), WordKind::Null))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.repr, Repr::Word(w) if matches!(w.kind(), WordKind::Bool(_)))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.repr, Repr::Word(w) if matches!(w.kind(), WordKind::Integer(_)))
    }

    pub fn is_float(&self) -> bool {
        matches!(self.repr, Repr::Word(w) if matches!(w.kind(), WordKind::Float(_)))
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_string(&self) -> bool {
        match &self.repr {
            Repr::Word(w) => matches!(w.kind(), WordKind::ShortString { .. }),
            Repr::Long(_) => true,
            _ => false,
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.repr, Repr::Vector(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self.repr, Repr::Map(_))
    }

    pub fn is_break(&self) -> bool {
        matches!(self.repr, Repr::Word(w) if matches!(w.kind(), WordKind::Break))
    }

    pub fn is_continue(&self) -> bool {
        matches!(self.repr, Repr::Word(w) if matches!(w.kind(), WordKind::Continue))
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn as_integer(&self) -> Option<i64> {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Integer(i) => Some(i),
                _ => None,
            },
            _ => None,
        }
    }

    /// The numeric value, promoting int to float.
    pub fn as_float(&self) -> Option<f64> {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Integer(i) => Some(i as f64),
                WordKind::Float(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Bool(b) => Some(b),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_string_ref(&self) -> Option<StrRef<'_>> {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::ShortString { buf, len } => Some(StrRef::Short { buf, len }),
                _ => None,
            },
            Repr::Long(s) => Some(StrRef::Long(s)),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        self.as_string_ref().map(|s| s.as_str().to_string())
    }

    pub fn as_vector(&self) -> Option<&Vec<Datum>> {
        match &self.repr {
            Repr::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vector_mut(&mut self) -> Option<&mut Vec<Datum>> {
        match &mut self.repr {
            Repr::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Datum, Datum>> {
        match &self.repr {
            Repr::Map(m) => Some(m),
            _ => None,
        }
    }

    /// The variant name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Undefined => "undefined",
                WordKind::Null => "null",
                WordKind::Bool(_) => "bool",
                WordKind::Integer(_) => "int",
                WordKind::Float(_) => "float",
                WordKind::ShortString { .. } => "string",
                WordKind::Break => "break",
                WordKind::Continue => "continue",
            },
            Repr::Long(_) => "string",
            Repr::Vector(_) => "vector",
            Repr::Map(_) => "map",
        }
    }

    /// Truthiness: undefined, null, false, numeric zero, and empty
    /// strings/vectors/maps are false; everything else is true.
    pub fn truthy(&self) -> bool {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Undefined | WordKind::Null => false,
                WordKind::Bool(b) => b,
                WordKind::Integer(i) => i != 0,
                WordKind::Float(f) => f != 0.0,
                WordKind::ShortString { len, .. } => len != 0,
                WordKind::Break | WordKind::Continue => true,
            },
            Repr::Long(s) => !s.is_empty(),
            Repr::Vector(v) => !v.is_empty(),
            Repr::Map(m) => !m.is_empty(),
        }
    }

    /// Element count of a string, vector, or map.
    pub fn size(&self) -> Result<usize, DatumError> {
        match &self.repr {
            Repr::Vector(v) => Ok(v.len()),
            Repr::Map(m) => Ok(m.len()),
            _ => match self.as_string_ref() {
                Some(s) => Ok(s.as_str().len()),
                None => Err(DatumError::type_mismatch(format!(
                    "Can't take the size of a {}.",
                    self.type_name()
                ))),
            },
        }
    }

    // Rank used to break ties between variants in the total order.
    fn type_order(&self) -> u8 {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Undefined => 0,
                WordKind::Null => 1,
                WordKind::Bool(_) => 2,
                WordKind::Integer(_) | WordKind::Float(_) => 3,
                WordKind::ShortString { .. } => 4,
                WordKind::Break => 7,
                WordKind::Continue => 8,
            },
            Repr::Long(_) => 4,
            Repr::Vector(_) => 5,
            Repr::Map(_) => 6,
        }
    }

    // ── Conversions ────────────────────────────────────────────────

    pub fn to_float(&self) -> Result<f64, DatumError> {
        if let Some(f) = self.as_float() {
            return Ok(f);
        }
        if let Some(b) = self.as_bool() {
            return Ok(if b { 1.0 } else { 0.0 });
        }
        if let Some(s) = self.as_string_ref() {
            if let Ok(f) = s.as_str().trim().parse::<f64>() {
                return Ok(f);
            }
        }
        Err(DatumError::type_mismatch(format!(
            "Can't convert {} to float.",
            self.repr_string()
        )))
    }

    pub fn to_integer(&self) -> Result<i64, DatumError> {
        if let Some(i) = self.as_integer() {
            return Ok(i);
        }
        if let Some(f) = self.as_float() {
            return Ok(f.trunc() as i64);
        }
        if let Some(b) = self.as_bool() {
            return Ok(b as i64);
        }
        if let Some(s) = self.as_string_ref() {
            if let Ok(i) = s.as_str().trim().parse::<i64>() {
                return Ok(i);
            }
        }
        Err(DatumError::type_mismatch(format!(
            "Can't convert {} to integer.",
            self.repr_string()
        )))
    }

    /// The quoted debug form: strings get double quotes and escapes,
    /// other variants render as `Display`.
    pub fn repr_string(&self) -> String {
        match self.as_string_ref() {
            Some(s) => {
                let mut out = String::with_capacity(s.as_str().len() + 2);
                out.push('"');
                for c in s.as_str().chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c => out.push(c),
                    }
                }
                out.push('"');
                out
            }
            None => format!("{}", self),
        }
    }

    // ── Arithmetic ─────────────────────────────────────────────────

    pub fn add(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        if let (Some(a), Some(b)) = (self.as_integer(), rhs.as_integer()) {
            return Ok(Datum::from(a.wrapping_add(b)));
        }
        if let (Some(a), Some(b)) = (self.as_float(), rhs.as_float()) {
            return Ok(Datum::from(a + b));
        }
        if let (Some(a), Some(b)) = (self.as_string_ref(), rhs.as_string_ref()) {
            let mut s = a.as_str().to_string();
            s.push_str(b.as_str());
            return Ok(Datum::from(s));
        }
        if let (Repr::Vector(a), Repr::Vector(b)) = (&self.repr, &rhs.repr) {
            let mut v = a.clone();
            v.extend(b.iter().cloned());
            return Ok(Datum::from(v));
        }
        if let (Repr::Map(a), Repr::Map(b)) = (&self.repr, &rhs.repr) {
            let mut m = a.clone();
            for (k, v) in b {
                m.insert(k.clone(), v.clone());
            }
            return Ok(Datum {
                repr: Repr::Map(m),
            });
        }
        Err(self.binary_mismatch("+", rhs))
    }

    pub fn sub(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        if let (Some(a), Some(b)) = (self.as_integer(), rhs.as_integer()) {
            return Ok(Datum::from(a.wrapping_sub(b)));
        }
        if let (Some(a), Some(b)) = (self.as_float(), rhs.as_float()) {
            return Ok(Datum::from(a - b));
        }
        Err(self.binary_mismatch("-", rhs))
    }

    pub fn mul(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        if let (Some(a), Some(b)) = (self.as_integer(), rhs.as_integer()) {
            return Ok(Datum::from(a.wrapping_mul(b)));
        }
        if let (Some(a), Some(b)) = (self.as_float(), rhs.as_float()) {
            return Ok(Datum::from(a * b));
        }
        Err(self.binary_mismatch("*", rhs))
    }

    pub fn div(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        if let (Some(a), Some(b)) = (self.as_integer(), rhs.as_integer()) {
            if b == 0 {
                return Err(DatumError::invalid_operation(
                    "Division by zero.".to_string(),
                ));
            }
            return Ok(Datum::from(a.wrapping_div(b)));
        }
        if let (Some(a), Some(b)) = (self.as_float(), rhs.as_float()) {
            return Ok(Datum::from(a / b));
        }
        Err(self.binary_mismatch("/", rhs))
    }

    pub fn rem(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        if let (Some(a), Some(b)) = (self.as_integer(), rhs.as_integer()) {
            if b == 0 {
                return Err(DatumError::invalid_operation(
                    "Modulo by zero.".to_string(),
                ));
            }
            return Ok(Datum::from(a.wrapping_rem(b)));
        }
        if let (Some(a), Some(b)) = (self.as_float(), rhs.as_float()) {
            return Ok(Datum::from(a % b));
        }
        Err(self.binary_mismatch("%", rhs))
    }

    /// Left shift. A negative amount shifts right; amounts beyond 63
    /// yield zero. The shift is logical on the 64-bit pattern and the
    /// result wraps back into the boxed integer range.
    pub fn shl(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        let (a, b) = match (self.as_integer(), rhs.as_integer()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.binary_mismatch("<<", rhs)),
        };
        if b < 0 {
            return self.shr(&Datum::from(-b));
        }
        if b > 63 {
            return Ok(Datum::from(0i64));
        }
        Ok(Datum::from(((a as u64) << b) as i64))
    }

    /// Right shift, arithmetic (sign-filling). A negative amount shifts
    /// left; amounts beyond 63 yield 0 or -1 depending on the sign.
    pub fn shr(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        let (a, b) = match (self.as_integer(), rhs.as_integer()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(self.binary_mismatch(">>", rhs)),
        };
        if b < 0 {
            return self.shl(&Datum::from(-b));
        }
        if b > 63 {
            return Ok(Datum::from(if a < 0 { -1i64 } else { 0i64 }));
        }
        Ok(Datum::from(a >> b))
    }

    pub fn bit_and(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        match (self.as_integer(), rhs.as_integer()) {
            (Some(a), Some(b)) => Ok(Datum::from(((a as u64) & (b as u64)) as i64)),
            _ => Err(self.binary_mismatch("&", rhs)),
        }
    }

    pub fn bit_or(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        match (self.as_integer(), rhs.as_integer()) {
            (Some(a), Some(b)) => Ok(Datum::from(((a as u64) | (b as u64)) as i64)),
            _ => Err(self.binary_mismatch("|", rhs)),
        }
    }

    pub fn bit_xor(&self, rhs: &Datum) -> Result<Datum, DatumError> {
        match (self.as_integer(), rhs.as_integer()) {
            (Some(a), Some(b)) => Ok(Datum::from(((a as u64) ^ (b as u64)) as i64)),
            _ => Err(self.binary_mismatch("^", rhs)),
        }
    }

    pub fn neg(&self) -> Result<Datum, DatumError> {
        if let Some(i) = self.as_integer() {
            return Ok(Datum::from(i.wrapping_neg()));
        }
        if let Some(f) = self.as_float() {
            return Ok(Datum::from(-f));
        }
        Err(DatumError::type_mismatch(format!(
            "Can't negate {}.",
            self.repr_string()
        )))
    }

    pub fn bit_not(&self) -> Result<Datum, DatumError> {
        match self.as_integer() {
            Some(i) => Ok(Datum::from(!i)),
            None => Err(DatumError::type_mismatch(format!(
                "Can't bit-invert {}.",
                self.repr_string()
            ))),
        }
    }

    pub fn logical_not(&self) -> Datum {
        Datum::from(!self.truthy())
    }

    fn binary_mismatch(&self, op: &str, rhs: &Datum) -> DatumError {
        DatumError::type_mismatch(format!(
            "Can't evaluate {} {} {}.",
            self.repr_string(),
            op,
            rhs.repr_string()
        ))
    }

    // ── Indexing ───────────────────────────────────────────────────

    /// Read `self[key]`. Vectors take integer indices, negative counts
    /// from the end; maps take any key.
    pub fn index(&self, key: &Datum) -> Result<Datum, DatumError> {
        match &self.repr {
            Repr::Vector(v) => {
                let i = vector_index(v.len(), key)?;
                match v.get(i) {
                    Some(d) => Ok(d.clone()),
                    None => Err(DatumError::invalid_operation(format!(
                        "Index {} out of range for vector of size {}.",
                        key, v.len()
                    ))),
                }
            }
            Repr::Map(m) => match m.get(key) {
                Some(d) => Ok(d.clone()),
                None => Err(DatumError {
                    kind: ErrorKind::NameNotFound,
                    message: format!("Key {} not found in map.", key.repr_string()),
                }),
            },
            _ => Err(DatumError::type_mismatch(format!(
                "Can't index a {}.",
                self.type_name()
            ))),
        }
    }

    /// Writable `self[key]`. A vector write at index == len appends; a
    /// missing map key is inserted as undefined.
    pub fn index_mut(&mut self, key: &Datum) -> Result<&mut Datum, DatumError> {
        let type_name = self.type_name();
        match &mut self.repr {
            Repr::Vector(v) => {
                let i = vector_index(v.len(), key)?;
                if i == v.len() {
                    v.push(Datum::undefined());
                }
                let len = v.len();
                match v.get_mut(i) {
                    Some(d) => Ok(d),
                    None => Err(DatumError::invalid_operation(format!(
                        "Index {} out of range for vector of size {}.",
                        key, len
                    ))),
                }
            }
            Repr::Map(m) => Ok(m.entry(key.clone()).or_insert_with(Datum::undefined)),
            _ => Err(DatumError::type_mismatch(format!(
                "Can't index a {}.",
                type_name
            ))),
        }
    }
}

fn vector_index(len: usize, key: &Datum) -> Result<usize, DatumError> {
    let i = match key.as_integer() {
        Some(i) => i,
        None => {
            return Err(DatumError::type_mismatch(format!(
                "Vector index must be an integer, got {}.",
                key.repr_string()
            )))
        }
    };
    let i = if i < 0 { i + len as i64 } else { i };
    if i < 0 {
        Err(DatumError::invalid_operation(format!(
            "Index {} out of range for vector of size {}.",
            key, len
        )))
    } else {
        Ok(i as usize)
    }
}

// ── From impls ─────────────────────────────────────────────────────

impl From<bool> for Datum {
    fn from(v: bool) -> Datum {
        Datum::from_word(Word::from_bool(v))
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Datum {
        Datum::from_word(Word::from_i64(v))
    }
}

impl From<i32> for Datum {
    fn from(v: i32) -> Datum {
        Datum::from(v as i64)
    }
}

impl From<u32> for Datum {
    fn from(v: u32) -> Datum {
        Datum::from(v as i64)
    }
}

impl From<u64> for Datum {
    fn from(v: u64) -> Datum {
        Datum::from(v as i64)
    }
}

impl From<usize> for Datum {
    fn from(v: usize) -> Datum {
        Datum::from(v as i64)
    }
}

impl From<f64> for Datum {
    fn from(v: f64) -> Datum {
        Datum::from_word(Word::from_f64(v))
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Datum {
        if v.len() <= 6 {
            Datum::from_word(Word::from_short_str(v))
        } else {
            Datum {
                repr: Repr::Long(v.into()),
            }
        }
    }
}

impl From<String> for Datum {
    fn from(v: String) -> Datum {
        Datum::from(v.as_str())
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(v: Vec<Datum>) -> Datum {
        Datum {
            repr: Repr::Vector(v),
        }
    }
}

impl From<BTreeMap<Datum, Datum>> for Datum {
    fn from(m: BTreeMap<Datum, Datum>) -> Datum {
        Datum {
            repr: Repr::Map(m),
        }
    }
}

impl Default for Datum {
    fn default() -> Datum {
        Datum::undefined()
    }
}

// ── Ordering, equality, hashing ────────────────────────────────────

impl Ord for Datum {
    /// Total order: within the numeric group int is promoted to float;
    /// strings compare byte-lexicographically; otherwise variants compare
    /// by type order.
    fn cmp(&self, other: &Datum) -> Ordering {
        let lhs_order = self.type_order();
        let rhs_order = other.type_order();
        if lhs_order != rhs_order {
            return lhs_order.cmp(&rhs_order);
        }
        match lhs_order {
            0 | 1 | 7 | 8 => Ordering::Equal,
            2 => self.as_bool().cmp(&other.as_bool()),
            3 => {
                if let (Some(a), Some(b)) = (self.as_integer(), other.as_integer()) {
                    a.cmp(&b)
                } else {
                    let a = self.as_float().unwrap_or(0.0);
                    let b = other.as_float().unwrap_or(0.0);
                    // Neither side can be NaN.
                    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
                }
            }
            4 => {
                let a = self.as_string_ref();
                let b = other.as_string_ref();
                match (a, b) {
                    (Some(a), Some(b)) => a.as_str().as_bytes().cmp(b.as_str().as_bytes()),
                    _ => Ordering::Equal,
                }
            }
            5 => match (&self.repr, &other.repr) {
                (Repr::Vector(a), Repr::Vector(b)) => a.cmp(b),
                _ => Ordering::Equal,
            },
            _ => match (&self.repr, &other.repr) {
                (Repr::Map(a), Repr::Map(b)) => a.iter().cmp(b.iter()),
                _ => Ordering::Equal,
            },
        }
    }
}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Datum) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Datum) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Undefined => state.write_u8(0),
                WordKind::Null => state.write_u8(1),
                WordKind::Bool(b) => {
                    state.write_u8(2);
                    state.write_u8(b as u8);
                }
                // Ints hash as their promoted float so that 2 and 2.0
                // hash alike; every boxed int is exact in a double.
                WordKind::Integer(i) => {
                    state.write_u8(3);
                    state.write_u64(normal_float_bits(i as f64));
                }
                WordKind::Float(f) => {
                    state.write_u8(3);
                    state.write_u64(normal_float_bits(f));
                }
                WordKind::ShortString { buf, len } => {
                    state.write_u8(4);
                    state.write(&buf[..len]);
                }
                WordKind::Break => state.write_u8(7),
                WordKind::Continue => state.write_u8(8),
            },
            Repr::Long(s) => {
                state.write_u8(4);
                state.write(s.as_bytes());
            }
            Repr::Vector(v) => {
                state.write_u8(5);
                for d in v {
                    d.hash(state);
                }
            }
            Repr::Map(m) => {
                state.write_u8(6);
                for (k, v) in m {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

fn normal_float_bits(f: f64) -> u64 {
    if f == 0.0 {
        0
    } else {
        f.to_bits()
    }
}

// ── Display ────────────────────────────────────────────────────────

fn format_float(f: f64) -> String {
    let s = format!("{}", f);
    if s.contains('.') || s.contains('e') || s.contains("inf") {
        s
    } else {
        format!("{}.0", s)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Word(w) => match w.kind() {
                WordKind::Undefined => write!(f, "undefined"),
                WordKind::Null => write!(f, "null"),
                WordKind::Bool(b) => write!(f, "{}", b),
                WordKind::Integer(i) => write!(f, "{}", i),
                WordKind::Float(v) => write!(f, "{}", format_float(v)),
                WordKind::ShortString { buf, len } => {
                    let s = StrRef::Short { buf, len };
                    write!(f, "{}", s.as_str())
                }
                WordKind::Break => write!(f, "break"),
                WordKind::Continue => write!(f, "continue"),
            },
            Repr::Long(s) => write!(f, "{}", s),
            Repr::Vector(v) => {
                write!(f, "[")?;
                for (i, d) in v.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", d.repr_string())?;
                }
                write!(f, "]")
            }
            Repr::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k.repr_string(), v.repr_string())?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl fmt::Debug for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repr_string())
    }
}
