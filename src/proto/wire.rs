//! On-wire layout of the client protocol.
//!
//! Every frame starts with [`MsgHeader`]: total length, version octet,
//! opcode, request id. The version is checked before anything else; a
//! mismatch aborts the connection with a protocol-unsupported error.
//! Payload structures are packed `#[repr(C)]` without implicit padding;
//! variable-length parts (names, paths, tags) follow as NUL-terminated
//! UTF-8 strings.

#![allow(missing_docs)]

use num_enum::TryFromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::types::{AddrType, Family, FsType};

/// Current protocol version. Fits the single version octet; bump past 127
/// requires widening the field.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame opcodes. Responses mirror requests in the upper range.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub(crate) enum Opcode {
    Ping = 0,
    Format = 1,
    ReadAlloc = 2,
    WriteAlloc = 3,
    Release = 4,
    Notify = 5,

    RespPing = 0x40,
    RespError = 0x41,
    RespFormat = 0x42,
    RespReadAlloc = 0x43,
    RespWriteAlloc = 0x44,
    RespRelease = 0x45,
    RespNotify = 0x46,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct MsgHeader {
    /// Total frame length, header included.
    pub(crate) len: u32,
    pub(crate) version: u8,
    pub(crate) opcode: u8,
    pub(crate) padding: u16,
    pub(crate) req_id: u64,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<MsgHeader>();

/// Reference to one medium in a request tail; the name follows as a
/// NUL-terminated string.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct medium_ref {
    pub(crate) family: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct format_in {
    pub(crate) family: u8,
    pub(crate) fs_type: u8,
    pub(crate) unlock: u8,
    pub(crate) padding: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct read_alloc_in {
    pub(crate) n_required: u32,
    pub(crate) n_media: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct write_alloc_in {
    pub(crate) n_required: u32,
    pub(crate) n_tags: u32,
    pub(crate) min_size: u64,
    pub(crate) family: u8,
    pub(crate) padding: [u8; 7],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct release_in {
    pub(crate) n_media: u32,
    pub(crate) padding: u32,
}

/// One released medium; the medium name follows as a string.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct release_elt_in {
    pub(crate) size_written: u64,
    pub(crate) nb_obj: i64,
    pub(crate) rc: i32,
    pub(crate) to_sync: u8,
    pub(crate) family: u8,
    pub(crate) padding: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct notify_in {
    pub(crate) family: u8,
    /// 1 = add device.
    pub(crate) op: u8,
    pub(crate) padding: u16,
}

pub(crate) const NOTIFY_OP_ADD_DEVICE: u8 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct error_out {
    /// Negative errno observed first on the request.
    pub(crate) rc: i32,
    /// Kind of the failed request, [`crate::proto::RequestKind`] as u8.
    pub(crate) kind: u8,
    pub(crate) padding: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct format_out {
    pub(crate) family: u8,
    pub(crate) padding: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct alloc_out {
    pub(crate) n_media: u32,
    pub(crate) padding: u32,
}

/// One allocated medium; the medium name and the mount root path follow
/// as strings.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct alloc_elt_out {
    pub(crate) avail_size: u64,
    pub(crate) family: u8,
    pub(crate) fs_type: u8,
    pub(crate) addr_type: u8,
    pub(crate) padding: [u8; 5],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub(crate) struct release_out {
    pub(crate) n_media: u32,
    pub(crate) padding: u32,
}

pub(crate) fn family_code(family: Family) -> u8 {
    match family {
        Family::Tape => 0,
        Family::Disk => 1,
        Family::RadosPool => 2,
    }
}

pub(crate) fn family_from_code(code: u8) -> Option<Family> {
    match code {
        0 => Some(Family::Tape),
        1 => Some(Family::Disk),
        2 => Some(Family::RadosPool),
        _ => None,
    }
}

pub(crate) fn fs_type_code(fs: FsType) -> u8 {
    match fs {
        FsType::Posix => 0,
        FsType::Ltfs => 1,
        FsType::Rados => 2,
    }
}

pub(crate) fn fs_type_from_code(code: u8) -> Option<FsType> {
    match code {
        0 => Some(FsType::Posix),
        1 => Some(FsType::Ltfs),
        2 => Some(FsType::Rados),
        _ => None,
    }
}

pub(crate) fn addr_type_code(addr: AddrType) -> u8 {
    match addr {
        AddrType::Path => 0,
        AddrType::Hash1 => 1,
        AddrType::Opaque => 2,
    }
}

pub(crate) fn addr_type_from_code(code: u8) -> Option<AddrType> {
    match code {
        0 => Some(AddrType::Path),
        1 => Some(AddrType::Hash1),
        2 => Some(AddrType::Opaque),
        _ => None,
    }
}

/// Frame encoder: header reserved up front, length backfilled on finish.
pub(crate) struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    pub(crate) fn new(opcode: Opcode, req_id: u64) -> Self {
        let header = MsgHeader {
            len: 0,
            version: PROTOCOL_VERSION,
            opcode: opcode as u8,
            padding: 0,
            req_id,
        };
        FrameBuilder {
            buf: header.as_bytes().to_vec(),
        }
    }

    pub(crate) fn push<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub(crate) fn push_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_fixed() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(std::mem::size_of::<release_elt_in>(), 24);
        assert_eq!(std::mem::size_of::<alloc_elt_out>(), 16);
    }

    #[test]
    fn frame_length_backfilled() {
        let mut b = FrameBuilder::new(Opcode::Ping, 7);
        b.push_str("x");
        let frame = b.finish();
        assert_eq!(frame.len(), HEADER_SIZE + 2);
        let (header, _) = MsgHeader::read_from_prefix(&frame).unwrap();
        assert_eq!(header.len as usize, frame.len());
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.req_id, 7);
    }

    #[test]
    fn family_codes_round_trip() {
        for family in [Family::Tape, Family::Disk, Family::RadosPool] {
            assert_eq!(family_from_code(family_code(family)), Some(family));
        }
        assert_eq!(family_from_code(0xff), None);
    }
}
