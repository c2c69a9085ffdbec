//! Wire format codec (C1)
//!
//! Wayland-style messages are framed as an 8-byte header followed by a
//! signature-driven argument list, all little-endian on the wire regardless
//! of host byte order. File descriptors never appear in the byte stream;
//! they travel alongside it in an ancillary fd queue (see [`crate::transport`]).

use std::collections::VecDeque;
use std::ffi::CString;
use std::io::Cursor;
use std::os::fd::OwnedFd;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::object::ObjectId;

/// Size of the fixed message header in bytes.
pub const HEADER_SIZE: usize = 8;
/// Maximum byte length of a `string` argument, NUL included.
pub const MAX_STRING_LEN: usize = 4096;
/// Maximum byte length of an `array` argument.
pub const MAX_ARRAY_LEN: usize = 65536;
/// Maximum total message size (fits the 16-bit size field).
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// The kind of a single argument in a method signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int32,
    Uint32,
    Fixed,
    String,
    Object,
    NewId,
    Array,
    Fd,
}

/// A method signature: its ordered argument kinds.
pub type Signature = &'static [ArgKind];

/// Signed 24.8 fixed-point number, transported as a plain `int32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(pub i32);

impl Fixed {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(256);

    pub fn from_int(v: i32) -> Self {
        Self(v * 256)
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

/// A single decoded or to-be-encoded argument.
#[derive(Debug)]
pub enum Argument {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    /// `None` represents the wire's null-string (length field 0).
    String(Option<CString>),
    /// `None` represents the wire's null object (id 0).
    Object(Option<ObjectId>),
    NewId(ObjectId),
    Array(Vec<u8>),
    Fd(OwnedFd),
}

impl Argument {
    fn kind(&self) -> ArgKind {
        match self {
            Argument::Int(_) => ArgKind::Int32,
            Argument::Uint(_) => ArgKind::Uint32,
            Argument::Fixed(_) => ArgKind::Fixed,
            Argument::String(_) => ArgKind::String,
            Argument::Object(_) => ArgKind::Object,
            Argument::NewId(_) => ArgKind::NewId,
            Argument::Array(_) => ArgKind::Array,
            Argument::Fd(_) => ArgKind::Fd,
        }
    }
}

/// Message header: target object, opcode, and total byte size (header included).
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub object_id: ObjectId,
    pub opcode: u16,
    pub size: u16,
}

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn arg_encoded_len(arg: &Argument) -> Result<usize> {
    Ok(match arg {
        Argument::Int(_)
        | Argument::Uint(_)
        | Argument::Fixed(_)
        | Argument::Object(_)
        | Argument::NewId(_) => 4,
        Argument::String(None) => 4,
        Argument::String(Some(s)) => {
            let bytes_with_nul = s.as_bytes_with_nul().len();
            if bytes_with_nul > MAX_STRING_LEN {
                return Err(Error::InvalidArgument(format!(
                    "string of {bytes_with_nul} bytes exceeds max {MAX_STRING_LEN}"
                )));
            }
            4 + bytes_with_nul + padding(bytes_with_nul)
        }
        Argument::Array(data) => {
            if data.len() > MAX_ARRAY_LEN {
                return Err(Error::InvalidArgument(format!(
                    "array of {} bytes exceeds max {MAX_ARRAY_LEN}",
                    data.len()
                )));
            }
            4 + data.len() + padding(data.len())
        }
        Argument::Fd(_) => 0,
    })
}

/// Encode a message into `out_bytes`, appending any fd arguments to `out_fds`
/// in signature order. Returns the number of bytes written (including the
/// header).
///
/// `target_id` can never be 0 — that invariant is enforced by `ObjectId`'s
/// type, not by a runtime check here. Fails with [`Error::InvalidArgument`]
/// if an argument's kind does not match `signature` or a string/array
/// exceeds its bound, and with [`Error::InvalidArgument`] if the resulting
/// message would not fit the 16-bit size field.
pub fn encode(
    target_id: ObjectId,
    opcode: u16,
    signature: Signature,
    args: Vec<Argument>,
    out_bytes: &mut Vec<u8>,
    out_fds: &mut Vec<OwnedFd>,
) -> Result<usize> {
    if args.len() != signature.len() {
        return Err(Error::InvalidArgument(format!(
            "expected {} arguments, got {}",
            signature.len(),
            args.len()
        )));
    }
    for (arg, kind) in args.iter().zip(signature.iter()) {
        if arg.kind() != *kind {
            return Err(Error::InvalidArgument(format!(
                "expected {kind:?}, got {:?}",
                arg.kind()
            )));
        }
    }

    let mut body_len = 0usize;
    for arg in &args {
        body_len += arg_encoded_len(arg)?;
    }
    let total_len = HEADER_SIZE + body_len;
    if total_len > MAX_MESSAGE_SIZE {
        return Err(Error::InvalidArgument(format!(
            "message of {total_len} bytes exceeds max {MAX_MESSAGE_SIZE}"
        )));
    }

    let start = out_bytes.len();
    out_bytes
        .write_u32::<LittleEndian>(target_id.get())
        .map_err(Error::Io)?;
    out_bytes
        .write_u16::<LittleEndian>(opcode)
        .map_err(Error::Io)?;
    out_bytes
        .write_u16::<LittleEndian>(total_len as u16)
        .map_err(Error::Io)?;

    for arg in args {
        match arg {
            Argument::Int(v) => out_bytes.write_i32::<LittleEndian>(v).map_err(Error::Io)?,
            Argument::Uint(v) => out_bytes.write_u32::<LittleEndian>(v).map_err(Error::Io)?,
            Argument::Object(id) => out_bytes
                .write_u32::<LittleEndian>(id.map_or(0, ObjectId::get))
                .map_err(Error::Io)?,
            Argument::NewId(id) => out_bytes
                .write_u32::<LittleEndian>(id.get())
                .map_err(Error::Io)?,
            Argument::Fixed(Fixed(v)) => {
                out_bytes.write_i32::<LittleEndian>(v).map_err(Error::Io)?
            }
            Argument::String(None) => out_bytes.write_u32::<LittleEndian>(0).map_err(Error::Io)?,
            Argument::String(Some(s)) => write_bytes_padded(out_bytes, s.as_bytes_with_nul())?,
            Argument::Array(data) => write_bytes_padded(out_bytes, &data)?,
            Argument::Fd(fd) => out_fds.push(fd),
        }
    }

    Ok(out_bytes.len() - start)
}

fn write_bytes_padded(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    out.write_u32::<LittleEndian>(data.len() as u32)
        .map_err(Error::Io)?;
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(0u8).take(padding(data.len())));
    Ok(())
}

/// Decode a single message from `in_bytes`, consuming fd-typed arguments
/// from the front of `in_fds`. Returns the header, the decoded arguments,
/// the number of bytes consumed (header included), and the number of fds
/// consumed.
///
/// Fails with [`Error::MalformedMessage`] if the header is short, has a size
/// below 8, a size not a multiple of 4, claims more bytes than are
/// available, or targets object id 0; with [`Error::MissingFd`] if the fd
/// queue runs out for an `Fd`-typed argument; with [`Error::InvalidArgument`]
/// for a non-terminated or oversized string, an oversized array, or a
/// `new_id` argument of 0.
pub fn decode(
    in_bytes: &[u8],
    signature: Signature,
    in_fds: &mut VecDeque<OwnedFd>,
) -> Result<(Header, Vec<Argument>, usize, usize)> {
    if in_bytes.len() < HEADER_SIZE {
        return Err(Error::MalformedMessage(format!(
            "{} bytes available, need at least {HEADER_SIZE}",
            in_bytes.len()
        )));
    }

    let mut cursor = Cursor::new(in_bytes);
    let raw_object_id = cursor.read_u32::<LittleEndian>().map_err(Error::Io)?;
    let object_id = ObjectId::new(raw_object_id)
        .ok_or_else(|| Error::MalformedMessage("message targets object id 0".into()))?;
    let opcode = cursor.read_u16::<LittleEndian>().map_err(Error::Io)?;
    let size = cursor.read_u16::<LittleEndian>().map_err(Error::Io)?;

    let size_usize = size as usize;
    if size_usize < HEADER_SIZE || size_usize % 4 != 0 {
        return Err(Error::MalformedMessage(format!(
            "invalid header size {size_usize}"
        )));
    }
    if in_bytes.len() < size_usize {
        return Err(Error::MalformedMessage(format!(
            "message claims {size_usize} bytes, only {} available",
            in_bytes.len()
        )));
    }

    let mut args = Vec::with_capacity(signature.len());
    let mut fds_consumed = 0usize;
    for kind in signature {
        let arg = match kind {
            ArgKind::Int32 => Argument::Int(cursor.read_i32::<LittleEndian>().map_err(Error::Io)?),
            ArgKind::Uint32 => {
                Argument::Uint(cursor.read_u32::<LittleEndian>().map_err(Error::Io)?)
            }
            ArgKind::Fixed => {
                Argument::Fixed(Fixed(cursor.read_i32::<LittleEndian>().map_err(Error::Io)?))
            }
            ArgKind::Object => Argument::Object(ObjectId::new(
                cursor.read_u32::<LittleEndian>().map_err(Error::Io)?,
            )),
            ArgKind::NewId => {
                let raw = cursor.read_u32::<LittleEndian>().map_err(Error::Io)?;
                Argument::NewId(
                    ObjectId::new(raw)
                        .ok_or_else(|| Error::InvalidArgument("new_id argument is 0".into()))?,
                )
            }
            ArgKind::String => Argument::String(read_string(&mut cursor)?),
            ArgKind::Array => Argument::Array(read_array(&mut cursor)?),
            ArgKind::Fd => {
                let fd = in_fds.pop_front().ok_or(Error::MissingFd)?;
                fds_consumed += 1;
                Argument::Fd(fd)
            }
        };
        args.push(arg);
    }

    Ok((
        Header {
            object_id,
            opcode,
            size,
        },
        args,
        size_usize,
        fds_consumed,
    ))
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<Option<CString>> {
    let len = cursor.read_u32::<LittleEndian>().map_err(Error::Io)? as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_STRING_LEN {
        return Err(Error::InvalidArgument(format!(
            "string of {len} bytes exceeds max {MAX_STRING_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    std::io::Read::read_exact(cursor, &mut buf).map_err(Error::Io)?;
    skip_padding(cursor, len)?;
    if buf.last() != Some(&0) {
        return Err(Error::InvalidArgument(
            "string argument not NUL-terminated".into(),
        ));
    }
    buf.pop();
    CString::new(buf)
        .map(Some)
        .map_err(|e| Error::InvalidArgument(format!("embedded NUL in string: {e}")))
}

fn read_array(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>().map_err(Error::Io)? as usize;
    if len > MAX_ARRAY_LEN {
        return Err(Error::InvalidArgument(format!(
            "array of {len} bytes exceeds max {MAX_ARRAY_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    std::io::Read::read_exact(cursor, &mut buf).map_err(Error::Io)?;
    skip_padding(cursor, len)?;
    Ok(buf)
}

fn skip_padding(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<()> {
    let pad = padding(len);
    if pad > 0 {
        let mut discard = [0u8; 3];
        std::io::Read::read_exact(cursor, &mut discard[..pad]).map_err(Error::Io)?;
    }
    Ok(())
}
