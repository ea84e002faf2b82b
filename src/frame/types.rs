//! CQL binary protocol in-wire types.

use crate::frame::frame_errors::ParseError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str;

fn ensure_remaining(buf: &[u8], len: usize) -> Result<(), ParseError> {
    if buf.len() < len {
        return Err(ParseError::BadIncomingData(format!(
            "Not enough bytes in buffer: expected {}, was {}",
            len,
            buf.len()
        )));
    }
    Ok(())
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, ParseError> {
    let v = buf.read_i32::<BigEndian>()?;
    Ok(v)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

#[test]
fn type_int() {
    let vals = [i32::MIN, -1, 0, 1, i32::MAX];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_int(*val, &mut buf);
        assert_eq!(read_int(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_short(buf: &mut &[u8]) -> Result<i16, ParseError> {
    let v = buf.read_i16::<BigEndian>()?;
    Ok(v)
}

pub fn write_short(v: i16, buf: &mut impl BufMut) {
    buf.put_i16(v);
}

#[test]
fn type_short() {
    let vals = [i16::MIN, -1, 0, 1, i16::MAX];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_short(*val, &mut buf);
        assert_eq!(read_short(&mut &buf[..]).unwrap(), *val);
    }
}

// https://github.com/apache/cassandra/blob/trunk/doc/native_protocol_v4.spec#L208
pub fn read_bytes_opt<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, ParseError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    ensure_remaining(buf, len)?;
    let v = Some(&buf[0..len]);
    buf.advance(len);
    Ok(v)
}

// Same as read_bytes_opt, but we assume the value won't be `null`
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Err(ParseError::BadIncomingData(format!(
            "unexpected length when deserializing `bytes` value: {}",
            len
        )));
    }
    let len = len as usize;
    ensure_remaining(buf, len)?;
    let v = &buf[0..len];
    buf.advance(len);
    Ok(v)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    let len = v.len();
    if len > i32::MAX as usize {
        return Err(ParseError::BadDataToSerialize(format!(
            "Byte slice is too long for 32-bits: {} bytes",
            len
        )));
    }
    write_int(len as i32, buf);
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(v: Option<&[u8]>, buf: &mut impl BufMut) -> Result<(), ParseError> {
    match v {
        Some(v) => write_bytes(v, buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

#[test]
fn type_bytes() {
    let vals = [vec![], vec![0u8], vec![1, 2, 3, 4, 5]];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_bytes(val, &mut buf).unwrap();
        assert_eq!(read_bytes(&mut &buf[..]).unwrap(), &val[..]);
    }
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_short(buf)?;
    if len < 0 {
        return Err(ParseError::BadIncomingData(format!(
            "unexpected length when deserializing `short bytes` value: {}",
            len
        )));
    }
    let len = len as usize;
    ensure_remaining(buf, len)?;
    let v = &buf[0..len];
    buf.advance(len);
    Ok(v)
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    let len = v.len();
    if len > i16::MAX as usize {
        return Err(ParseError::BadDataToSerialize(format!(
            "Byte slice is too long for 16-bits: {} bytes",
            len
        )));
    }
    write_short(len as i16, buf);
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_short(buf)? as usize;
    ensure_remaining(buf, len)?;
    let raw = &buf[0..len];
    let v = str::from_utf8(raw)?;
    buf.advance(len);
    Ok(v)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let raw = v.as_bytes();
    let len = raw.len();
    if len > i16::MAX as usize {
        return Err(ParseError::BadDataToSerialize(format!(
            "String is too long for 16-bits: {} bytes",
            len
        )));
    }
    write_short(len as i16, buf);
    buf.put_slice(raw);
    Ok(())
}

#[test]
fn type_string() {
    let vals = [String::from(""), String::from("hello, world!")];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_string(val, &mut buf).unwrap();
        assert_eq!(read_string(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Err(ParseError::BadIncomingData(format!(
            "unexpected length when deserializing `long string` value: {}",
            len
        )));
    }
    let len = len as usize;
    ensure_remaining(buf, len)?;
    let raw = &buf[0..len];
    let v = str::from_utf8(raw)?;
    buf.advance(len);
    Ok(v)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let raw = v.as_bytes();
    let len = raw.len();
    if len > i32::MAX as usize {
        return Err(ParseError::BadDataToSerialize(format!(
            "String is too long for 32-bits: {} bytes",
            len
        )));
    }
    write_int(len as i32, buf);
    buf.put_slice(raw);
    Ok(())
}

#[test]
fn type_long_string() {
    let vals = [String::from(""), String::from("hello, world!")];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_long_string(val, &mut buf).unwrap();
        assert_eq!(read_long_string(&mut &buf[..]).unwrap(), *val);
    }
}

pub fn read_string_map(buf: &mut &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let mut v = HashMap::new();
    let len = read_short(buf)?;
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<String, String>,
    buf: &mut impl BufMut,
) -> Result<(), ParseError> {
    let len = v.len();
    if len > i16::MAX as usize {
        return Err(ParseError::BadDataToSerialize(format!(
            "String map has too many entries for 16-bits: {}",
            len
        )));
    }
    write_short(len as i16, buf);
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_string(val, buf)?;
    }
    Ok(())
}

#[test]
fn type_string_map() {
    let mut val = HashMap::new();
    val.insert(String::from(""), String::from(""));
    val.insert(String::from("CQL_VERSION"), String::from("3.0.0"));
    val.insert(String::from("THROW_ON_OVERLOAD"), String::from(""));
    let mut buf = Vec::new();
    write_string_map(&val, &mut buf).unwrap();
    assert_eq!(read_string_map(&mut &buf[..]).unwrap(), val);
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, ParseError> {
    let mut v = Vec::new();
    let len = read_short(buf)?;
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), ParseError> {
    let len = v.len();
    if len > i16::MAX as usize {
        return Err(ParseError::BadDataToSerialize(format!(
            "String list has too many entries for 16-bits: {}",
            len
        )));
    }
    write_short(len as i16, buf);
    for v in v.iter() {
        write_string(v, buf)?;
    }
    Ok(())
}

#[test]
fn type_string_list() {
    let val = vec![
        "".to_owned(),
        "CQL_VERSION".to_owned(),
        "THROW_ON_OVERLOAD".to_owned(),
    ];
    let mut buf = Vec::new();
    write_string_list(&val, &mut buf).unwrap();
    assert_eq!(read_string_list(&mut &buf[..]).unwrap(), val);
}

// [inet] as used in EVENT bodies: one length byte, 4 or 16 address bytes, an [int] port.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, ParseError> {
    ensure_remaining(buf, 1)?;
    let len = buf.get_u8();
    let ip: IpAddr = match len {
        4 => {
            ensure_remaining(buf, 4)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[0..4]);
            buf.advance(4);
            octets.into()
        }
        16 => {
            ensure_remaining(buf, 16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[0..16]);
            buf.advance(16);
            octets.into()
        }
        _ => {
            return Err(ParseError::BadIncomingData(format!(
                "Invalid `inet` address length: {}",
                len
            )));
        }
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
    write_int(addr.port() as i32, buf);
}

#[test]
fn type_inet() {
    let vals: [SocketAddr; 2] = [
        "127.0.0.1:9042".parse().unwrap(),
        "[2001:db8::1]:19042".parse().unwrap(),
    ];
    for val in vals.iter() {
        let mut buf = Vec::new();
        write_inet(*val, &mut buf);
        assert_eq!(read_inet(&mut &buf[..]).unwrap(), *val);
    }
}
