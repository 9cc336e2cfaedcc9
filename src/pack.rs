// Copyright 2026 Joyent, Inc.

//! Field formats used by registers, commands and events.
//!
//! A format is a space separated list of type descriptions, all numbers
//! little endian:
//!
//! * `u8 u16 u32 u64 i8 i16 i32 i64 f32 f64` - plain numbers
//! * `u22.10`, `i1.15` - fixed point, stored in `N+M` bits and divided by
//!   `2^M` when unpacked
//! * `b`, `s` - bytes or utf-8 text until the end of the buffer
//! * `b[10]`, `s[10]` - fixed size; trailing NULs are stripped from text
//! * `x[4]` - padding
//! * `z` - NUL terminated utf-8 text
//! * `r: ...` - the remaining fields repeat as tuples until the input ends
//! * `u16[]` - the last field repeats until the input ends

use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::PackError;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Num(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Num(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Value {
        Value::Num(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Value {
        Value::Num(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(String::from(s))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NumberFormat {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl NumberFormat {
    fn of_type(word: &str) -> Option<NumberFormat> {
        match word {
            "u8" => Some(NumberFormat::U8),
            "u16" => Some(NumberFormat::U16),
            "u32" => Some(NumberFormat::U32),
            "u64" => Some(NumberFormat::U64),
            "i8" => Some(NumberFormat::I8),
            "i16" => Some(NumberFormat::I16),
            "i32" => Some(NumberFormat::I32),
            "i64" => Some(NumberFormat::I64),
            "f32" => Some(NumberFormat::F32),
            "f64" => Some(NumberFormat::F64),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            NumberFormat::U8 | NumberFormat::I8 => 1,
            NumberFormat::U16 | NumberFormat::I16 => 2,
            NumberFormat::U32 | NumberFormat::I32 | NumberFormat::F32 => 4,
            NumberFormat::U64 | NumberFormat::I64 | NumberFormat::F64 => 8,
        }
    }

    fn read(self, buf: &[u8]) -> f64 {
        match self {
            NumberFormat::U8 => buf[0] as f64,
            NumberFormat::I8 => buf[0] as i8 as f64,
            NumberFormat::U16 => LittleEndian::read_u16(buf) as f64,
            NumberFormat::I16 => LittleEndian::read_i16(buf) as f64,
            NumberFormat::U32 => LittleEndian::read_u32(buf) as f64,
            NumberFormat::I32 => LittleEndian::read_i32(buf) as f64,
            NumberFormat::U64 => LittleEndian::read_u64(buf) as f64,
            NumberFormat::I64 => LittleEndian::read_i64(buf) as f64,
            NumberFormat::F32 => LittleEndian::read_f32(buf) as f64,
            NumberFormat::F64 => LittleEndian::read_f64(buf),
        }
    }

    /// Integers are truncated toward zero and saturate at the storage
    /// range (`as` casts from f64 saturate).
    fn write(self, buf: &mut [u8], v: f64) {
        match self {
            NumberFormat::U8 => buf[0] = v as u8,
            NumberFormat::I8 => buf[0] = v as i8 as u8,
            NumberFormat::U16 => LittleEndian::write_u16(buf, v as u16),
            NumberFormat::I16 => LittleEndian::write_i16(buf, v as i16),
            NumberFormat::U32 => LittleEndian::write_u32(buf, v as u32),
            NumberFormat::I32 => LittleEndian::write_i32(buf, v as i32),
            NumberFormat::U64 => LittleEndian::write_u64(buf, v as u64),
            NumberFormat::I64 => LittleEndian::write_i64(buf, v as i64),
            NumberFormat::F32 => LittleEndian::write_f32(buf, v as f32),
            NumberFormat::F64 => LittleEndian::write_f64(buf, v),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Number(NumberFormat),
    Bytes,
    Text,
    ZText,
    Padding,
    Repeat,
}

#[derive(Clone, Debug, PartialEq)]
struct Token {
    kind: Kind,
    /// Fixed byte size, `None` for "until end of buffer".
    size: Option<usize>,
    div: f64,
    is_array: bool,
}

/// A parsed field format.
#[derive(Clone, Debug, PartialEq)]
pub struct PackFormat {
    tokens: Vec<Token>,
}

fn parse_word(word: &str) -> Result<Token, PackError> {
    let invalid = || PackError::InvalidFormat(String::from(word));
    let mut word = String::from(word);
    let mut div = 1.0;
    let mut is_array = false;

    let c0 = word.as_bytes()[0];
    // "u22.10" is stored as u32 with div = 1 << 10
    if (c0 == b'u' || c0 == b'i') && word.contains('.') {
        let dot = word.find('.').ok_or_else(invalid)?;
        let sz0: u32 = word[1..dot].parse().map_err(|_| invalid())?;
        let sz1: u32 = word[dot + 1..].parse().map_err(|_| invalid())?;
        if sz1 >= 64 {
            return Err(invalid());
        }
        div = (1u64 << sz1) as f64;
        word = format!("{}{}", c0 as char, sz0 + sz1);
    }

    if word.ends_with("[]") {
        word.truncate(word.len() - 2);
        is_array = true;
    }

    let mut size = None;
    if word.len() > 1 && word.as_bytes()[1] == b'[' {
        if !word.ends_with(']') {
            return Err(invalid());
        }
        let n: usize = word[2..word.len() - 1].parse().map_err(|_| invalid())?;
        size = Some(n);
    }

    if let Some(nfmt) = NumberFormat::of_type(&word) {
        return Ok(Token {
            kind: Kind::Number(nfmt),
            size: Some(nfmt.size()),
            div,
            is_array,
        });
    }

    let kind = match c0 {
        b'r' if word == "r:" => Kind::Repeat,
        b'b' if word.len() == 1 || size.is_some() => Kind::Bytes,
        b's' if word.len() == 1 || size.is_some() => Kind::Text,
        b'x' if size.is_some() => Kind::Padding,
        b'z' if word.len() == 1 => Kind::ZText,
        _ => return Err(invalid()),
    };
    Ok(Token {
        kind,
        size,
        div,
        is_array,
    })
}

impl FromStr for PackFormat {
    type Err = PackError;

    fn from_str(fmt: &str) -> Result<PackFormat, PackError> {
        let tokens = fmt
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(parse_word)
            .collect::<Result<Vec<Token>, PackError>>()?;
        for (i, t) in tokens.iter().enumerate() {
            let last = i + 1 == tokens.len();
            if t.is_array && !last {
                return Err(PackError::InvalidFormat(String::from(
                    "array field must be last",
                )));
            }
            if t.kind == Kind::Repeat && last {
                return Err(PackError::InvalidFormat(String::from(
                    "r: needs fields to repeat",
                )));
            }
        }
        Ok(PackFormat { tokens })
    }
}

impl PackFormat {
    /// Number of top level values produced by `unpack`.
    pub fn field_count(&self) -> usize {
        let mut n = 0;
        for t in &self.tokens {
            match t.kind {
                Kind::Padding => (),
                Kind::Repeat => return n + 1,
                _ => n += 1,
            }
        }
        n
    }

    pub fn unpack(&self, buf: &[u8]) -> Result<Vec<Value>, PackError> {
        let mut off = 0;
        unpack_tokens(buf, &self.tokens, &mut off)
    }

    pub fn pack(&self, values: &[Value]) -> Result<Vec<u8>, PackError> {
        let mut out = Vec::new();
        pack_tokens(&mut out, &self.tokens, values)?;
        Ok(out)
    }
}

fn unpack_one(buf: &[u8], t: &Token, off: &mut usize) -> Result<Option<Value>, PackError> {
    let rest = &buf[(*off).min(buf.len())..];
    match t.kind {
        Kind::Number(nfmt) => {
            let sz = nfmt.size();
            if rest.len() < sz {
                return Err(PackError::NotEnoughBytes {
                    needed: *off + sz,
                    available: buf.len(),
                });
            }
            *off += sz;
            Ok(Some(Value::Num(nfmt.read(&rest[..sz]) / t.div)))
        }
        Kind::Padding => {
            *off += t.size.unwrap_or(0);
            Ok(None)
        }
        Kind::ZText => {
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            let s = String::from_utf8_lossy(&rest[..end]).into_owned();
            *off += (end + 1).min(rest.len());
            Ok(Some(Value::Str(s)))
        }
        Kind::Bytes | Kind::Text => {
            let sz = t.size.unwrap_or(rest.len()).min(rest.len());
            let sub = &rest[..sz];
            *off += sz;
            if t.kind == Kind::Bytes {
                Ok(Some(Value::Bytes(sub.to_vec())))
            } else {
                let end = sub.iter().position(|&b| b == 0).unwrap_or(sub.len());
                Ok(Some(Value::Str(String::from_utf8_lossy(&sub[..end]).into_owned())))
            }
        }
        Kind::Repeat => Ok(None),
    }
}

fn unpack_tokens(buf: &[u8], tokens: &[Token], off: &mut usize) -> Result<Vec<Value>, PackError> {
    let mut res = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        if t.kind == Kind::Repeat {
            let tail = &tokens[i + 1..];
            let mut tuples = Vec::new();
            while *off < buf.len() {
                tuples.push(Value::List(unpack_tokens(buf, tail, off)?));
            }
            res.push(Value::List(tuples));
            return Ok(res);
        }
        if t.is_array {
            let mut items = Vec::new();
            while *off < buf.len() {
                if let Some(v) = unpack_one(buf, t, off)? {
                    items.push(v);
                }
            }
            res.push(Value::List(items));
            continue;
        }
        if let Some(v) = unpack_one(buf, t, off)? {
            res.push(v);
        }
    }
    Ok(res)
}

fn pack_one(out: &mut Vec<u8>, t: &Token, v: &Value) -> Result<(), PackError> {
    match (t.kind, v) {
        (Kind::Number(nfmt), Value::Num(n)) => {
            let start = out.len();
            out.resize(start + nfmt.size(), 0);
            let scaled = match nfmt {
                NumberFormat::F32 | NumberFormat::F64 => n * t.div,
                _ => (n * t.div).trunc(),
            };
            nfmt.write(&mut out[start..], scaled);
            Ok(())
        }
        (Kind::Number(_), _) => Err(PackError::TypeMismatch(String::from(
            "expecting number",
        ))),
        (Kind::Text, Value::Str(s)) | (Kind::ZText, Value::Str(s)) => {
            put_sized(out, s.as_bytes(), t.size);
            if t.kind == Kind::ZText {
                out.push(0);
            }
            Ok(())
        }
        (Kind::Bytes, Value::Bytes(b)) => {
            put_sized(out, b, t.size);
            Ok(())
        }
        _ => Err(PackError::TypeMismatch(String::from(
            "expecting string or buffer",
        ))),
    }
}

fn put_sized(out: &mut Vec<u8>, data: &[u8], size: Option<usize>) {
    match size {
        Some(sz) => {
            let n = data.len().min(sz);
            out.extend_from_slice(&data[..n]);
            out.resize(out.len() + sz - n, 0);
        }
        None => out.extend_from_slice(data),
    }
}

fn pack_tokens(out: &mut Vec<u8>, tokens: &[Token], values: &[Value]) -> Result<(), PackError> {
    let mut idx = 0;
    for (i, t) in tokens.iter().enumerate() {
        if t.kind == Kind::Padding {
            out.resize(out.len() + t.size.unwrap_or(0), 0);
            continue;
        }
        let v = values.get(idx).ok_or(PackError::FormatTooShort)?;
        idx += 1;
        if t.kind == Kind::Repeat {
            let tail = &tokens[i + 1..];
            let tuples = v.as_list().ok_or_else(|| {
                PackError::TypeMismatch(String::from("expecting list of tuples"))
            })?;
            for tuple in tuples {
                let fields = tuple.as_list().ok_or_else(|| {
                    PackError::TypeMismatch(String::from("expecting tuple"))
                })?;
                pack_tokens(out, tail, fields)?;
            }
            break;
        }
        if t.is_array {
            let items = v.as_list().ok_or_else(|| {
                PackError::TypeMismatch(String::from("expecting list"))
            })?;
            for item in items {
                pack_one(out, t, item)?;
            }
        } else {
            pack_one(out, t, v)?;
        }
    }
    if values.len() > idx {
        return Err(PackError::FormatTooShort);
    }
    Ok(())
}

pub fn pack(fmt: &str, values: &[Value]) -> Result<Vec<u8>, PackError> {
    fmt.parse::<PackFormat>()?.pack(values)
}

pub fn unpack(buf: &[u8], fmt: &str) -> Result<Vec<Value>, PackError> {
    fmt.parse::<PackFormat>()?.unpack(buf)
}
