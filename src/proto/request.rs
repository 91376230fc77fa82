//! Decoded client requests.
//!
//! A request frame is parsed into a [`Message`]: the request id plus a
//! typed [`Operation`]. Parsing is strict; any malformed frame yields a
//! [`DecodeError`] and the embedder is expected to abort the connection
//! without touching engine state.

use std::{error, fmt};

use crate::proto::argument::ArgumentIterator;
use crate::proto::wire::{self, HEADER_SIZE, MsgHeader, Opcode, PROTOCOL_VERSION};
use crate::types::{Family, FsType, ResourceId};

use zerocopy::FromBytes;

/// Error that may occur while parsing a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data for the frame header (short read).
    ShortReadHeader(usize),
    /// The version octet does not match [`PROTOCOL_VERSION`]; the
    /// connection must be closed.
    UnsupportedVersion(u8),
    /// Unknown opcode.
    UnknownOpcode(u8),
    /// The frame is shorter than its header announces.
    ShortRead(usize, usize),
    /// A payload field held an invalid value.
    InsufficientData,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ShortReadHeader(len) => {
                write!(f, "Short read of frame header ({} < {})", len, HEADER_SIZE)
            }
            DecodeError::UnsupportedVersion(v) => {
                write!(
                    f,
                    "Unsupported protocol version {} (expected {})",
                    v, PROTOCOL_VERSION
                )
            }
            DecodeError::UnknownOpcode(opcode) => write!(f, "Unknown opcode ({opcode})"),
            DecodeError::ShortRead(len, total) => {
                write!(f, "Short read of frame ({len} < {total})")
            }
            DecodeError::InsufficientData => write!(f, "Insufficient argument data"),
        }
    }
}

impl error::Error for DecodeError {}

/// Kind of a client request, echoed in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Ping,
    Format,
    Read,
    Write,
    Release,
    Notify,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Ping => "ping",
            RequestKind::Format => "format",
            RequestKind::Read => "read_alloc",
            RequestKind::Write => "write_alloc",
            RequestKind::Release => "release",
            RequestKind::Notify => "notify",
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            RequestKind::Ping => 0,
            RequestKind::Format => 1,
            RequestKind::Read => 2,
            RequestKind::Write => 3,
            RequestKind::Release => 4,
            RequestKind::Notify => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RequestKind::Ping),
            1 => Some(RequestKind::Format),
            2 => Some(RequestKind::Read),
            3 => Some(RequestKind::Write),
            4 => Some(RequestKind::Release),
            5 => Some(RequestKind::Notify),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One medium acknowledged by a release request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseElt {
    pub medium: ResourceId,
    /// Bytes the client wrote on the medium.
    pub size_written: u64,
    /// Object count delta.
    pub nb_obj: i64,
    /// Client-side I/O return code; non-zero poisons the sync epoch.
    pub client_rc: i32,
    /// Whether the medium must be synchronized before acknowledging.
    pub to_sync: bool,
}

/// A client operation, decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Ping,
    Format {
        medium: ResourceId,
        fs_type: FsType,
        /// Clear the admin lock once the format succeeds.
        unlock: bool,
    },
    ReadAlloc {
        n_required: usize,
        /// Ordered candidates; at least `n_required` entries.
        candidates: Vec<ResourceId>,
    },
    WriteAlloc {
        n_required: usize,
        family: Family,
        tags: Vec<String>,
        /// Minimum free space wanted on each allocated medium.
        min_size: u64,
    },
    Release {
        media: Vec<ReleaseElt>,
    },
    Notify {
        target: ResourceId,
        /// True to register the device with the engine.
        add_device: bool,
    },
}

impl Operation {
    pub fn kind(&self) -> RequestKind {
        match self {
            Operation::Ping => RequestKind::Ping,
            Operation::Format { .. } => RequestKind::Format,
            Operation::ReadAlloc { .. } => RequestKind::Read,
            Operation::WriteAlloc { .. } => RequestKind::Write,
            Operation::Release { .. } => RequestKind::Release,
            Operation::Notify { .. } => RequestKind::Notify,
        }
    }
}

/// A decoded request frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub req_id: u64,
    pub op: Operation,
}

fn fetch_medium(it: &mut ArgumentIterator<'_>) -> Result<ResourceId, DecodeError> {
    let mref: wire::medium_ref = it.fetch().ok_or(DecodeError::InsufficientData)?;
    let family = wire::family_from_code(mref.family).ok_or(DecodeError::InsufficientData)?;
    let name = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
    Ok(ResourceId::new(family, name))
}

/// Parse one request frame. The buffer must hold exactly one frame.
pub fn decode_request(buf: &[u8]) -> Result<Message, DecodeError> {
    let (header, payload) =
        MsgHeader::read_from_prefix(buf).map_err(|_| DecodeError::ShortReadHeader(buf.len()))?;
    if header.version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(header.version));
    }
    if buf.len() < header.len as usize {
        return Err(DecodeError::ShortRead(buf.len(), header.len as usize));
    }
    let opcode =
        Opcode::try_from(header.opcode).map_err(|_| DecodeError::UnknownOpcode(header.opcode))?;

    let mut it = ArgumentIterator::new(payload);
    let op = match opcode {
        Opcode::Ping => Operation::Ping,
        Opcode::Format => {
            let arg: wire::format_in = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let family =
                wire::family_from_code(arg.family).ok_or(DecodeError::InsufficientData)?;
            let fs_type =
                wire::fs_type_from_code(arg.fs_type).ok_or(DecodeError::InsufficientData)?;
            let name = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
            Operation::Format {
                medium: ResourceId::new(family, name),
                fs_type,
                unlock: arg.unlock != 0,
            }
        }
        Opcode::ReadAlloc => {
            let arg: wire::read_alloc_in = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let mut candidates = Vec::with_capacity(arg.n_media as usize);
            for _ in 0..arg.n_media {
                candidates.push(fetch_medium(&mut it)?);
            }
            if (arg.n_required as usize) > candidates.len() {
                return Err(DecodeError::InsufficientData);
            }
            Operation::ReadAlloc {
                n_required: arg.n_required as usize,
                candidates,
            }
        }
        Opcode::WriteAlloc => {
            let arg: wire::write_alloc_in = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let family =
                wire::family_from_code(arg.family).ok_or(DecodeError::InsufficientData)?;
            let mut tags = Vec::with_capacity(arg.n_tags as usize);
            for _ in 0..arg.n_tags {
                tags.push(
                    it.fetch_str()
                        .ok_or(DecodeError::InsufficientData)?
                        .to_string(),
                );
            }
            Operation::WriteAlloc {
                n_required: arg.n_required as usize,
                family,
                tags,
                min_size: arg.min_size,
            }
        }
        Opcode::Release => {
            let arg: wire::release_in = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let mut media = Vec::with_capacity(arg.n_media as usize);
            for _ in 0..arg.n_media {
                let elt: wire::release_elt_in = it.fetch().ok_or(DecodeError::InsufficientData)?;
                let family =
                    wire::family_from_code(elt.family).ok_or(DecodeError::InsufficientData)?;
                let name = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
                media.push(ReleaseElt {
                    medium: ResourceId::new(family, name),
                    size_written: elt.size_written,
                    nb_obj: elt.nb_obj,
                    client_rc: elt.rc,
                    to_sync: elt.to_sync != 0,
                });
            }
            Operation::Release { media }
        }
        Opcode::Notify => {
            let arg: wire::notify_in = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let family =
                wire::family_from_code(arg.family).ok_or(DecodeError::InsufficientData)?;
            let name = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
            Operation::Notify {
                target: ResourceId::new(family, name),
                add_device: arg.op == wire::NOTIFY_OP_ADD_DEVICE,
            }
        }
        _ => return Err(DecodeError::UnknownOpcode(header.opcode)),
    };

    Ok(Message {
        req_id: header.req_id,
        op,
    })
}

/// Encode a request frame; the client-side counterpart of
/// [`decode_request`].
pub fn encode_request(msg: &Message) -> Vec<u8> {
    use wire::FrameBuilder;

    let mut b;
    match &msg.op {
        Operation::Ping => {
            b = FrameBuilder::new(Opcode::Ping, msg.req_id);
        }
        Operation::Format {
            medium,
            fs_type,
            unlock,
        } => {
            b = FrameBuilder::new(Opcode::Format, msg.req_id);
            b.push(&wire::format_in {
                family: wire::family_code(medium.family),
                fs_type: wire::fs_type_code(*fs_type),
                unlock: *unlock as u8,
                padding: 0,
            });
            b.push_str(&medium.name);
        }
        Operation::ReadAlloc {
            n_required,
            candidates,
        } => {
            b = FrameBuilder::new(Opcode::ReadAlloc, msg.req_id);
            b.push(&wire::read_alloc_in {
                n_required: *n_required as u32,
                n_media: candidates.len() as u32,
            });
            for medium in candidates {
                b.push(&wire::medium_ref {
                    family: wire::family_code(medium.family),
                });
                b.push_str(&medium.name);
            }
        }
        Operation::WriteAlloc {
            n_required,
            family,
            tags,
            min_size,
        } => {
            b = FrameBuilder::new(Opcode::WriteAlloc, msg.req_id);
            b.push(&wire::write_alloc_in {
                n_required: *n_required as u32,
                n_tags: tags.len() as u32,
                min_size: *min_size,
                family: wire::family_code(*family),
                padding: [0; 7],
            });
            for tag in tags {
                b.push_str(tag);
            }
        }
        Operation::Release { media } => {
            b = FrameBuilder::new(Opcode::Release, msg.req_id);
            b.push(&wire::release_in {
                n_media: media.len() as u32,
                padding: 0,
            });
            for elt in media {
                b.push(&wire::release_elt_in {
                    size_written: elt.size_written,
                    nb_obj: elt.nb_obj,
                    rc: elt.client_rc,
                    to_sync: elt.to_sync as u8,
                    family: wire::family_code(elt.medium.family),
                    padding: 0,
                });
                b.push_str(&elt.medium.name);
            }
        }
        Operation::Notify { target, add_device } => {
            b = FrameBuilder::new(Opcode::Notify, msg.req_id);
            b.push(&wire::notify_in {
                family: wire::family_code(target.family),
                op: if *add_device {
                    wire::NOTIFY_OP_ADD_DEVICE
                } else {
                    0
                },
                padding: 0,
            });
            b.push_str(&target.name);
        }
    }
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(op: Operation) -> Message {
        let msg = Message { req_id: 99, op };
        let buf = encode_request(&msg);
        let back = decode_request(&buf).unwrap();
        assert_eq!(back, msg);
        back
    }

    #[test]
    fn format_round_trip() {
        round_trip(Operation::Format {
            medium: ResourceId::new(Family::Tape, "T1"),
            fs_type: FsType::Ltfs,
            unlock: true,
        });
    }

    #[test]
    fn read_alloc_round_trip() {
        round_trip(Operation::ReadAlloc {
            n_required: 1,
            candidates: vec![
                ResourceId::new(Family::Tape, "T1"),
                ResourceId::new(Family::Tape, "T2"),
            ],
        });
    }

    #[test]
    fn release_round_trip() {
        round_trip(Operation::Release {
            media: vec![ReleaseElt {
                medium: ResourceId::new(Family::Disk, "d0"),
                size_written: 4096,
                nb_obj: 2,
                client_rc: 0,
                to_sync: true,
            }],
        });
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut buf = encode_request(&Message {
            req_id: 1,
            op: Operation::Ping,
        });
        buf[4] = PROTOCOL_VERSION + 1;
        assert_eq!(
            decode_request(&buf),
            Err(DecodeError::UnsupportedVersion(PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn read_alloc_requires_enough_candidates() {
        let buf = encode_request(&Message {
            req_id: 1,
            op: Operation::ReadAlloc {
                n_required: 3,
                candidates: vec![ResourceId::new(Family::Tape, "T1")],
            },
        });
        assert_eq!(decode_request(&buf), Err(DecodeError::InsufficientData));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let buf = encode_request(&Message {
            req_id: 1,
            op: Operation::Format {
                medium: ResourceId::new(Family::Tape, "T1"),
                fs_type: FsType::Ltfs,
                unlock: false,
            },
        });
        assert!(matches!(
            decode_request(&buf[..6]),
            Err(DecodeError::ShortReadHeader(6))
        ));
        assert!(matches!(
            decode_request(&buf[..17]),
            Err(DecodeError::ShortRead(17, _))
        ));
    }
}
