use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::message::Headers;

macro_rules! ensure {
    ($cond:expr, $e:expr) => {
        if !($cond) {
            return Err($e);
        }
    };
}

macro_rules! prim_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident {
            $(
                $( #[$enum_item_attr:meta] )*
                $var:ident=$val:expr
            ),+
        }) => {
        $( #[$enum_attr] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
        pub enum $name {
            $(
                $( #[$enum_item_attr] )*
                $var = $val
            ),+
        }
        impl std::convert::TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($val => Ok($name::$var)),+
                    ,_ => Err($crate::error::DecodeError::UnknownType(v))
                }
            }
        }
        impl From<$name> for u8 {
            fn from(v: $name) -> Self {
                v as u8
            }
        }
    };
}

const HEADER_SEP: &str = ": ";

/// Reads a `u32` length prefix followed by that many bytes.
pub(crate) fn take_block(src: &mut Bytes) -> Result<Bytes, DecodeError> {
    ensure!(src.remaining() >= 4, DecodeError::InvalidLength);
    let len = src.get_u32() as usize;
    ensure!(src.remaining() >= len, DecodeError::InvalidLength);
    Ok(src.split_to(len))
}

pub(crate) fn put_block(data: &[u8], dst: &mut BytesMut) -> Result<(), EncodeError> {
    let len = u32::try_from(data.len()).map_err(|_| EncodeError::InvalidLength)?;
    dst.put_u32(len);
    dst.extend_from_slice(data);
    Ok(())
}

/// Parses `name: value\n` lines. The trailing newline of the last line is optional.
pub(crate) fn parse_headers(block: &[u8]) -> Result<Headers, DecodeError> {
    let text = std::str::from_utf8(block).map_err(|_| DecodeError::Utf8Error)?;
    let mut headers = Headers::default();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(HEADER_SEP).ok_or(DecodeError::MalformedHeader)?;
        ensure!(!name.is_empty(), DecodeError::MalformedHeader);
        headers.insert(name.to_owned(), value.to_owned());
    }
    Ok(headers)
}

pub(crate) fn write_header(name: &str, value: &str, out: &mut String) -> Result<(), EncodeError> {
    if name.is_empty() || name.contains(HEADER_SEP) || name.contains('\n') || value.contains('\n') {
        return Err(EncodeError::InvalidHeader(name.to_owned()));
    }
    out.push_str(name);
    out.push_str(HEADER_SEP);
    out.push_str(value);
    out.push('\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let h = parse_headers(b"a: 1\nb: x: y\nc: ").unwrap();
        assert_eq!(h.get("a").map(|s| s.as_str()), Some("1"));
        assert_eq!(h.get("b").map(|s| s.as_str()), Some("x: y"));
        assert_eq!(h.get("c").map(|s| s.as_str()), Some(""));

        assert!(parse_headers(b"").unwrap().is_empty());
        assert!(matches!(parse_headers(b"novalue\n"), Err(DecodeError::MalformedHeader)));
        assert!(matches!(parse_headers(b": v\n"), Err(DecodeError::MalformedHeader)));
        assert!(matches!(parse_headers(b"a: \xff\n"), Err(DecodeError::Utf8Error)));
    }

    #[test]
    fn test_write_header() {
        let mut out = String::new();
        write_header("client_id", "c1", &mut out).unwrap();
        assert_eq!(out, "client_id: c1\n");
        assert!(write_header("bad\nname", "v", &mut out).is_err());
        assert!(write_header("name", "multi\nline", &mut out).is_err());
    }

    #[test]
    fn test_block() {
        let mut buf = BytesMut::new();
        put_block(b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        let mut src = buf.freeze();
        assert_eq!(take_block(&mut src).unwrap(), Bytes::from_static(b"hello"));
        assert!(matches!(take_block(&mut src), Err(DecodeError::InvalidLength)));
    }
}
