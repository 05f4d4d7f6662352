use super::EncodingError;
use crate::config::KeyType;
use crate::error::Result;
use crate::session::Val;

// Type tags for self-describing encodings.
// Order matters: these determine cross-type ordering.
pub const TAG_NULL: u8 = 0x00;
pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_BYTE: u8 = 0x02;
pub const TAG_SHORT: u8 = 0x03;
pub const TAG_INT: u8 = 0x04;
pub const TAG_LONG: u8 = 0x05;
pub const TAG_FLOAT: u8 = 0x06;
pub const TAG_DOUBLE: u8 = 0x07;
pub const TAG_STRING: u8 = 0x08;

const STRING_TERMINATOR: [u8; 2] = [0x00, 0x00];
const ESCAPED_NULL: [u8; 2] = [0x00, 0xFF];

fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    if bytes.len() < N {
        return Err(EncodingError::TruncatedData.into());
    }
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[..N]);
    Ok(buf)
}

pub fn write_bool(b: bool, out: &mut Vec<u8>) {
    out.push(if b { 0x01 } else { 0x00 });
}

pub fn read_bool(bytes: &[u8]) -> Result<bool> {
    match take::<1>(bytes)?[0] {
        0x00 => Ok(false),
        0x01 => Ok(true),
        _ => Err(EncodingError::InvalidFormat("Invalid boolean value".to_string()).into()),
    }
}

// Flip the sign bit so negative numbers sort before positive.
pub fn write_i8(v: i8, out: &mut Vec<u8>) {
    out.push((v as u8) ^ 0x80);
}

pub fn read_i8(bytes: &[u8]) -> Result<i8> {
    Ok((take::<1>(bytes)?[0] ^ 0x80) as i8)
}

pub fn write_i16(v: i16, out: &mut Vec<u8>) {
    out.extend_from_slice(&((v as u16) ^ (1u16 << 15)).to_be_bytes());
}

pub fn read_i16(bytes: &[u8]) -> Result<i16> {
    Ok((u16::from_be_bytes(take(bytes)?) ^ (1u16 << 15)) as i16)
}

pub fn write_i32(v: i32, out: &mut Vec<u8>) {
    out.extend_from_slice(&((v as u32) ^ (1u32 << 31)).to_be_bytes());
}

pub fn read_i32(bytes: &[u8]) -> Result<i32> {
    Ok((u32::from_be_bytes(take(bytes)?) ^ (1u32 << 31)) as i32)
}

pub fn write_i64(v: i64, out: &mut Vec<u8>) {
    out.extend_from_slice(&((v as u64) ^ (1u64 << 63)).to_be_bytes());
}

pub fn read_i64(bytes: &[u8]) -> Result<i64> {
    Ok((u64::from_be_bytes(take(bytes)?) ^ (1u64 << 63)) as i64)
}

// IEEE 754 ordering: flip every bit of negatives, only the sign bit of positives.
pub fn write_f32(f: f32, out: &mut Vec<u8>) {
    let bits = f.to_bits();
    let ordered = if bits & (1u32 << 31) != 0 {
        !bits
    } else {
        bits | (1u32 << 31)
    };
    out.extend_from_slice(&ordered.to_be_bytes());
}

pub fn read_f32(bytes: &[u8]) -> Result<f32> {
    let ordered = u32::from_be_bytes(take(bytes)?);
    let bits = if ordered & (1u32 << 31) != 0 {
        ordered & !(1u32 << 31)
    } else {
        !ordered
    };
    Ok(f32::from_bits(bits))
}

pub fn write_f64(f: f64, out: &mut Vec<u8>) {
    let bits = f.to_bits();
    let ordered = if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    };
    out.extend_from_slice(&ordered.to_be_bytes());
}

pub fn read_f64(bytes: &[u8]) -> Result<f64> {
    let ordered = u64::from_be_bytes(take(bytes)?);
    let bits = if ordered & (1u64 << 63) != 0 {
        ordered & !(1u64 << 63)
    } else {
        !ordered
    };
    Ok(f64::from_bits(bits))
}

/// Width of `s` once escaped and terminated.
pub fn string_width(s: &str) -> usize {
    s.len() + s.bytes().filter(|b| *b == 0x00).count() + STRING_TERMINATOR.len()
}

/// Writes a self-delimiting, order-preserving string: null bytes are escaped
/// as `00 FF` and the string ends with `00 00`.
pub fn write_string(s: &str, out: &mut Vec<u8>) {
    for byte in s.bytes() {
        if byte == 0x00 {
            out.extend_from_slice(&ESCAPED_NULL);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&STRING_TERMINATOR);
}

/// Reads a string written by [`write_string`], returning it with the number
/// of bytes consumed.
pub fn read_string(bytes: &[u8]) -> Result<(String, usize)> {
    let mut result = Vec::new();
    let mut i = 0;

    loop {
        match bytes.get(i) {
            None => return Err(EncodingError::TruncatedData.into()),
            Some(0x00) => match bytes.get(i + 1) {
                Some(0x00) => {
                    i += 2;
                    break;
                }
                Some(0xFF) => {
                    result.push(0x00);
                    i += 2;
                }
                Some(_) => {
                    return Err(EncodingError::InvalidFormat(
                        "Invalid null byte escape".to_string(),
                    )
                    .into())
                }
                None => return Err(EncodingError::TruncatedData.into()),
            },
            Some(byte) => {
                result.push(*byte);
                i += 1;
            }
        }
    }

    let s = String::from_utf8(result).map_err(|_| EncodingError::InvalidUtf8)?;
    Ok((s, i))
}

/// Fixed width of a primitive key type, `None` for variable width types.
pub fn fixed_width(key_type: KeyType) -> Option<usize> {
    match key_type {
        KeyType::Boolean | KeyType::Byte => Some(1),
        KeyType::Short => Some(2),
        KeyType::Int | KeyType::Float => Some(4),
        KeyType::Long | KeyType::Double => Some(8),
        _ => None,
    }
}

fn unsupported(val: &Val, key_type: KeyType) -> crate::Error {
    EncodingError::UnsupportedType(format!(
        "cannot store {} value '{}' as {}",
        val.type_name(),
        val,
        key_type
    ))
    .into()
}

fn integer<T: TryFrom<i64>>(val: &Val, key_type: KeyType) -> Result<T> {
    val.to_i64()
        .and_then(|i| T::try_from(i).ok())
        .ok_or_else(|| unsupported(val, key_type))
}

fn exact_f32(val: &Val) -> Option<f32> {
    let wide = val.to_f64()?;
    let narrow = wide as f32;
    (narrow as f64 == wide || wide.is_nan()).then_some(narrow)
}

/// Writes `val` using the order-preserving encoding of `key_type`, coercing
/// the value when that is lossless.
pub fn write_as(key_type: KeyType, val: &Val, out: &mut Vec<u8>) -> Result<()> {
    match key_type {
        KeyType::Boolean => write_bool(
            val.to_bool().ok_or_else(|| unsupported(val, key_type))?,
            out,
        ),
        KeyType::Byte => write_i8(integer(val, key_type)?, out),
        KeyType::Short => write_i16(integer(val, key_type)?, out),
        KeyType::Int => write_i32(integer(val, key_type)?, out),
        KeyType::Long => write_i64(integer(val, key_type)?, out),
        KeyType::Float => match val {
            Val::Float(f) => write_f32(*f, out),
            other => write_f32(
                exact_f32(other).ok_or_else(|| unsupported(val, key_type))?,
                out,
            ),
        },
        KeyType::Double => write_f64(val.to_f64().ok_or_else(|| unsupported(val, key_type))?, out),
        KeyType::String => match val {
            Val::Null => return Err(unsupported(val, key_type)),
            Val::String(s) => write_string(s, out),
            other => write_string(&other.to_string(), out),
        },
        _ => return Err(unsupported(val, key_type)),
    }
    Ok(())
}

/// Reads a value written by [`write_as`], returning it with the number of
/// bytes consumed.
pub fn read_as(key_type: KeyType, bytes: &[u8]) -> Result<(Val, usize)> {
    let val = match key_type {
        KeyType::Boolean => Val::Boolean(read_bool(bytes)?),
        KeyType::Byte => Val::Byte(read_i8(bytes)?),
        KeyType::Short => Val::Short(read_i16(bytes)?),
        KeyType::Int => Val::Int(read_i32(bytes)?),
        KeyType::Long => Val::Long(read_i64(bytes)?),
        KeyType::Float => Val::Float(read_f32(bytes)?),
        KeyType::Double => Val::Double(read_f64(bytes)?),
        KeyType::String => {
            let (s, consumed) = read_string(bytes)?;
            return Ok((Val::String(s), consumed));
        }
        other => {
            return Err(EncodingError::UnsupportedType(format!(
                "{} has no inline encoding",
                other
            ))
            .into())
        }
    };
    let width = fixed_width(key_type).unwrap_or(0);
    Ok((val, width))
}

pub fn tag_of(val: &Val) -> u8 {
    match val {
        Val::Null => TAG_NULL,
        Val::Boolean(_) => TAG_BOOLEAN,
        Val::Byte(_) => TAG_BYTE,
        Val::Short(_) => TAG_SHORT,
        Val::Int(_) => TAG_INT,
        Val::Long(_) => TAG_LONG,
        Val::Float(_) => TAG_FLOAT,
        Val::Double(_) => TAG_DOUBLE,
        Val::String(_) => TAG_STRING,
    }
}

/// Payload width following a fixed-width tag, `None` for strings and unknown tags.
pub fn tagged_width(tag: u8) -> Option<usize> {
    match tag {
        TAG_NULL => Some(0),
        TAG_BOOLEAN | TAG_BYTE => Some(1),
        TAG_SHORT => Some(2),
        TAG_INT | TAG_FLOAT => Some(4),
        TAG_LONG | TAG_DOUBLE => Some(8),
        _ => None,
    }
}

/// Writes a self-describing encoding: a type tag followed by the payload.
/// String payloads are raw UTF-8 running to the end of the buffer.
pub fn write_tagged(val: &Val, out: &mut Vec<u8>) {
    out.push(tag_of(val));
    match val {
        Val::Null => {}
        Val::Boolean(b) => write_bool(*b, out),
        Val::Byte(v) => write_i8(*v, out),
        Val::Short(v) => write_i16(*v, out),
        Val::Int(v) => write_i32(*v, out),
        Val::Long(v) => write_i64(*v, out),
        Val::Float(v) => write_f32(*v, out),
        Val::Double(v) => write_f64(*v, out),
        Val::String(s) => out.extend_from_slice(s.as_bytes()),
    }
}

/// Reads the payload of a fixed-width tag.
pub fn read_tagged_payload(tag: u8, payload: &[u8]) -> Result<Val> {
    Ok(match tag {
        TAG_NULL => Val::Null,
        TAG_BOOLEAN => Val::Boolean(read_bool(payload)?),
        TAG_BYTE => Val::Byte(read_i8(payload)?),
        TAG_SHORT => Val::Short(read_i16(payload)?),
        TAG_INT => Val::Int(read_i32(payload)?),
        TAG_LONG => Val::Long(read_i64(payload)?),
        TAG_FLOAT => Val::Float(read_f32(payload)?),
        TAG_DOUBLE => Val::Double(read_f64(payload)?),
        TAG_STRING => Val::String(
            std::str::from_utf8(payload)
                .map_err(|_| EncodingError::InvalidUtf8)?
                .to_string(),
        ),
        other => {
            return Err(
                EncodingError::InvalidFormat(format!("Unknown type tag {:#04x}", other)).into(),
            )
        }
    })
}

/// Reads a value written by [`write_tagged`].
pub fn read_tagged(bytes: &[u8]) -> Result<Val> {
    let (&tag, payload) = bytes.split_first().ok_or(EncodingError::TruncatedData)?;
    read_tagged_payload(tag, payload)
}
