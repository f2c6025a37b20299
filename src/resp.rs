use std::{
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    fmt,
    hash::{Hash, Hasher},
    io::{Error, ErrorKind},
    str::from_utf8,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frames server replies off the wire, and writes commands (and, for test
/// doubles, replies) back onto it.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

/// One decoded server reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    SimpleString(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    BulkString(Bytes),
    Array(Vec<Reply>),
    Map(HashMap<Reply, Reply>),
    Set(HashSet<Reply>),
    Error(String),
}

const SIMPLE_STRING_BYTE: u8 = b'+';
const ERROR_BYTE: u8 = b'-';
const INTEGER_BYTE: u8 = b':';
const BULK_STRING_BYTE: u8 = b'$';
const ARRAY_BYTE: u8 = b'*';
const NULL_BYTE: u8 = b'_';
const DOUBLE_BYTE: u8 = b',';
const BOOLEAN_BYTE: u8 = b'#';
const BLOB_ERROR_BYTE: u8 = b'!';
const VERBATIM_STRING_BYTE: u8 = b'=';
const BIG_NUMBER_BYTE: u8 = b'(';
const MAP_BYTE: u8 = b'%';
const SET_BYTE: u8 = b'~';
const ATTRIBUTE_BYTE: u8 = b'|';
const PUSH_BYTE: u8 = b'>';

pub(crate) const CRLF: &[u8] = b"\r\n";

/// `Ok(Some((reply, consumed)))` for a complete reply at the start of `src`,
/// `Ok(None)` when more bytes are needed, `Err` on a protocol violation.
pub type ParseResult = Result<Option<(Reply, usize)>, Error>;

/// Decodes one reply from the front of `src` without consuming anything.
///
/// Calling it again on the same bytes yields the same reply, so a partial
/// read can simply be retried once more data has arrived.
pub fn parse_reply(src: &[u8]) -> ParseResult {
    parse_at(src, 0)
}

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = std::io::Error;

    /// * `Ok(Some(Reply))` if a complete reply was decoded and removed from `src`.
    /// * `Ok(None)` if more data is needed to complete the reply.
    /// * `Err(std::io::Error)` if the bytes are not valid RESP.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_reply(src)? {
            Some((reply, consumed)) => {
                src.advance(consumed);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Reply> for RespCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidData, msg.into())
}

fn find_crlf(src: &[u8], from: usize) -> Option<usize> {
    src[from..]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|offset| from + offset)
}

/// Returns the line content after the type byte at `pos`, and the position
/// just past its CRLF.
fn read_line(src: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    find_crlf(src, pos + 1).map(|crlf_pos| (&src[pos + 1..crlf_pos], crlf_pos + CRLF.len()))
}

fn parse_int(line: &[u8]) -> Result<i64, Error> {
    from_utf8(line)
        .map_err(|_| invalid("Invalid UTF-8 in integer"))?
        .parse::<i64>()
        .map_err(|_| invalid("Invalid integer format"))
}

fn parse_double(line: &[u8]) -> Result<f64, Error> {
    let text = from_utf8(line).map_err(|_| invalid("Invalid UTF-8 in double"))?;
    match text {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        "nan" => Ok(f64::NAN),
        _ => text.parse::<f64>().map_err(|_| invalid("Invalid double format")),
    }
}

fn parse_at(src: &[u8], pos: usize) -> ParseResult {
    if pos >= src.len() {
        return Ok(None);
    }

    match src[pos] {
        SIMPLE_STRING_BYTE | BIG_NUMBER_BYTE => Ok(read_line(src, pos).map(|(line, next)| {
            (
                Reply::SimpleString(String::from_utf8_lossy(line).into_owned()),
                next,
            )
        })),
        ERROR_BYTE => Ok(read_line(src, pos).map(|(line, next)| {
            (
                Reply::Error(String::from_utf8_lossy(line).into_owned()),
                next,
            )
        })),
        INTEGER_BYTE => match read_line(src, pos) {
            Some((line, next)) => Ok(Some((Reply::Integer(parse_int(line)?), next))),
            None => Ok(None),
        },
        DOUBLE_BYTE => match read_line(src, pos) {
            Some((line, next)) => Ok(Some((Reply::Double(parse_double(line)?), next))),
            None => Ok(None),
        },
        BOOLEAN_BYTE => match read_line(src, pos) {
            Some((b"t", next)) => Ok(Some((Reply::Boolean(true), next))),
            Some((b"f", next)) => Ok(Some((Reply::Boolean(false), next))),
            Some(_) => Err(invalid("Invalid boolean")),
            None => Ok(None),
        },
        NULL_BYTE => match read_line(src, pos) {
            Some((b"", next)) => Ok(Some((Reply::Nil, next))),
            Some(_) => Err(invalid("Invalid null")),
            None => Ok(None),
        },
        BULK_STRING_BYTE | BLOB_ERROR_BYTE | VERBATIM_STRING_BYTE => parse_blob(src, pos),
        ARRAY_BYTE | PUSH_BYTE | SET_BYTE => parse_sequence(src, pos),
        MAP_BYTE => parse_map(src, pos),
        ATTRIBUTE_BYTE => {
            // Attributes annotate the reply that follows; only the reply is kept.
            match parse_map(src, pos)? {
                Some((_, next)) => parse_at(src, next),
                None => Ok(None),
            }
        }
        other => Err(invalid(format!("Unknown RESP type byte: {:?}", other as char))),
    }
}

// $<length>\r\n<data>\r\n, with $-1\r\n as the RESP2 null bulk string.
// Blob errors (!) and verbatim strings (=) share the framing.
fn parse_blob(src: &[u8], pos: usize) -> ParseResult {
    let Some((line, start)) = read_line(src, pos) else {
        return Ok(None);
    };

    let length = parse_int(line)?;
    if length == -1 && src[pos] == BULK_STRING_BYTE {
        return Ok(Some((Reply::Nil, start)));
    }
    if length < 0 {
        return Err(invalid("Invalid bulk string length"));
    }

    let data_len = length as usize;
    let end = start + data_len;
    if src.len() < end + CRLF.len() {
        return Ok(None);
    }
    if &src[end..end + CRLF.len()] != CRLF {
        return Err(invalid("Bulk string is not terminated by CRLF"));
    }

    let data = &src[start..end];
    let reply = match src[pos] {
        BLOB_ERROR_BYTE => Reply::Error(String::from_utf8_lossy(data).into_owned()),
        VERBATIM_STRING_BYTE if data.len() >= 4 && data[3] == b':' => {
            Reply::BulkString(Bytes::copy_from_slice(&data[4..]))
        }
        _ => Reply::BulkString(Bytes::copy_from_slice(data)),
    };
    Ok(Some((reply, end + CRLF.len())))
}

fn read_count(src: &[u8], pos: usize) -> Result<Option<(i64, usize)>, Error> {
    match read_line(src, pos) {
        Some((line, next)) => Ok(Some((parse_int(line)?, next))),
        None => Ok(None),
    }
}

// *<number-of-elements>\r\n<element-1>...<element-n>
// Pushes (>) and sets (~) use the same layout.
fn parse_sequence(src: &[u8], pos: usize) -> ParseResult {
    let Some((count, mut next)) = read_count(src, pos)? else {
        return Ok(None);
    };
    if count == -1 {
        return Ok(Some((Reply::Nil, next)));
    }
    if count < 0 {
        return Err(invalid("Invalid aggregate length"));
    }

    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        match parse_at(src, next)? {
            Some((item, after)) => {
                items.push(item);
                next = after;
            }
            None => return Ok(None),
        }
    }

    let reply = if src[pos] == SET_BYTE {
        Reply::Set(items.into_iter().collect())
    } else {
        Reply::Array(items)
    };
    Ok(Some((reply, next)))
}

// %<number-of-pairs>\r\n<key-1><value-1>...
fn parse_map(src: &[u8], pos: usize) -> ParseResult {
    let Some((count, mut next)) = read_count(src, pos)? else {
        return Ok(None);
    };
    if count < 0 {
        return Err(invalid("Invalid map length"));
    }

    let mut map = HashMap::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let Some((key, after_key)) = parse_at(src, next)? else {
            return Ok(None);
        };
        let Some((value, after_value)) = parse_at(src, after_key)? else {
            return Ok(None);
        };
        map.insert(key, value);
        next = after_value;
    }
    Ok(Some((Reply::Map(map), next)))
}

impl Reply {
    pub fn ok() -> Self {
        Reply::SimpleString("OK".into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::BulkString(data.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Reply::Nil => "nil",
            Reply::SimpleString(_) => "simple string",
            Reply::Integer(_) => "integer",
            Reply::Double(_) => "double",
            Reply::Boolean(_) => "boolean",
            Reply::BulkString(_) => "bulk string",
            Reply::Array(_) => "array",
            Reply::Map(_) => "map",
            Reply::Set(_) => "set",
            Reply::Error(_) => "error",
        }
    }

    /// Borrows simple and (UTF-8) bulk strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::SimpleString(s) => Some(s),
            Reply::BulkString(b) => from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// RESP2 servers send floats as bulk strings, so those are parsed too.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Reply::Double(d) => Some(*d),
            Reply::Integer(i) => Some(*i as f64),
            Reply::SimpleString(_) | Reply::BulkString(_) => {
                self.as_str().and_then(|s| parse_double(s.as_bytes()).ok())
            }
            _ => None,
        }
    }

    /// RESP2 servers send booleans as `:0`/`:1`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Reply::Boolean(b) => Some(*b),
            Reply::Integer(0) => Some(false),
            Reply::Integer(1) => Some(true),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Reply::SimpleString(s) => Some(s),
            Reply::BulkString(b) => String::from_utf8(b.to_vec()).ok(),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            Reply::Set(items) => Some(items.into_iter().collect()),
            _ => None,
        }
    }

    /// Accepts a RESP3 map or a RESP2 flat array of key/value pairs.
    pub fn into_map(self) -> Option<HashMap<Reply, Reply>> {
        match self {
            Reply::Map(map) => Some(map),
            Reply::Array(items) if items.len() % 2 == 0 => {
                let mut map = HashMap::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    map.insert(key, value);
                }
                Some(map)
            }
            _ => None,
        }
    }

    /// Accepts a RESP3 set or a RESP2 array.
    pub fn into_set(self) -> Option<HashSet<Reply>> {
        match self {
            Reply::Set(items) => Some(items),
            Reply::Array(items) => Some(items.into_iter().collect()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Reply::Nil => buf.put_slice(b"_\r\n"),
            Reply::SimpleString(s) => write_line(buf, SIMPLE_STRING_BYTE, s.as_bytes()),
            Reply::Error(s) => write_line(buf, ERROR_BYTE, s.as_bytes()),
            Reply::Integer(i) => write_line(buf, INTEGER_BYTE, i.to_string().as_bytes()),
            Reply::Double(d) => write_line(buf, DOUBLE_BYTE, format_double(*d).as_bytes()),
            Reply::Boolean(b) => write_line(buf, BOOLEAN_BYTE, if *b { b"t" } else { b"f" }),
            Reply::BulkString(data) => {
                write_line(buf, BULK_STRING_BYTE, data.len().to_string().as_bytes());
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            Reply::Array(items) => {
                write_line(buf, ARRAY_BYTE, items.len().to_string().as_bytes());
                for item in items {
                    item.write_to(buf);
                }
            }
            Reply::Set(items) => {
                write_line(buf, SET_BYTE, items.len().to_string().as_bytes());
                for item in items {
                    item.write_to(buf);
                }
            }
            Reply::Map(map) => {
                write_line(buf, MAP_BYTE, map.len().to_string().as_bytes());
                for (key, value) in map {
                    key.write_to(buf);
                    value.write_to(buf);
                }
            }
        }
    }
}

fn write_line(buf: &mut BytesMut, type_byte: u8, content: &[u8]) {
    buf.put_u8(type_byte);
    buf.put_slice(content);
    buf.put_slice(CRLF);
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d == f64::INFINITY {
        "inf".to_string()
    } else if d == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        d.to_string()
    }
}

// Doubles compare with `==`, so -0.0 and 0.0 must hash alike.
fn double_bits(d: f64) -> u64 {
    if d == 0.0 {
        0.0f64.to_bits()
    } else {
        d.to_bits()
    }
}

fn unordered_hash<'a, I: Iterator<Item = &'a Reply>>(items: I) -> u64 {
    items.fold(0u64, |acc, item| {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        acc.wrapping_add(hasher.finish())
    })
}

impl Eq for Reply {}

impl Hash for Reply {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Reply::Nil => {}
            Reply::SimpleString(s) | Reply::Error(s) => s.hash(state),
            Reply::Integer(i) => i.hash(state),
            Reply::Double(d) => double_bits(*d).hash(state),
            Reply::Boolean(b) => b.hash(state),
            Reply::BulkString(b) => b.hash(state),
            Reply::Array(items) => items.hash(state),
            Reply::Set(items) => {
                items.len().hash(state);
                unordered_hash(items.iter()).hash(state);
            }
            Reply::Map(map) => {
                map.len().hash(state);
                unordered_hash(map.keys()).hash(state);
                unordered_hash(map.values()).hash(state);
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "(nil)"),
            Reply::SimpleString(s) => write!(f, "{s}"),
            Reply::Error(s) => write!(f, "(error) {s}"),
            Reply::Integer(i) => write!(f, "(integer) {i}"),
            Reply::Double(d) => write!(f, "(double) {}", format_double(*d)),
            Reply::Boolean(b) => write!(f, "({b})"),
            Reply::BulkString(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Reply::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {item}", i + 1)?;
                }
                Ok(())
            }
            Reply::Set(items) if items.is_empty() => write!(f, "(empty set)"),
            Reply::Set(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}~ {item}", i + 1)?;
                }
                Ok(())
            }
            Reply::Map(map) if map.is_empty() => write!(f, "(empty hash)"),
            Reply::Map(map) => {
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}# {key} => {value}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}
