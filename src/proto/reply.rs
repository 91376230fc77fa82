//! Responses sent back to clients.
//!
//! Every response carries the id of the request it answers. Inside the
//! engine responses travel through the response queue as
//! [`RespContainer`] values; encoding to a frame happens at the socket
//! boundary, owned by the embedder.

use std::path::PathBuf;

use zerocopy::FromBytes;

use crate::proto::argument::ArgumentIterator;
use crate::proto::request::{DecodeError, RequestKind};
use crate::proto::wire::{self, MsgHeader, Opcode, PROTOCOL_VERSION};
use crate::types::{AddrType, FsType, ResourceId};

/// One allocated medium in a read/write allocation response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocElt {
    pub medium: ResourceId,
    /// Mount root under which the client performs its I/O.
    pub root_path: PathBuf,
    pub fs_type: FsType,
    pub addr_type: AddrType,
    /// Physically available bytes (write allocations).
    pub avail_size: u64,
}

/// A response, typed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ping {
        req_id: u64,
    },
    /// Single error response of a failed request; carries the first
    /// non-zero return code observed.
    Error {
        req_id: u64,
        kind: RequestKind,
        /// Negative errno.
        rc: i32,
    },
    Format {
        req_id: u64,
        medium: ResourceId,
    },
    ReadAlloc {
        req_id: u64,
        media: Vec<AllocElt>,
    },
    WriteAlloc {
        req_id: u64,
        media: Vec<AllocElt>,
    },
    Release {
        req_id: u64,
        media: Vec<ResourceId>,
    },
    Notify {
        req_id: u64,
    },
}

impl Response {
    /// Id of the request this response answers.
    pub fn req_id(&self) -> u64 {
        match self {
            Response::Ping { req_id }
            | Response::Error { req_id, .. }
            | Response::Format { req_id, .. }
            | Response::ReadAlloc { req_id, .. }
            | Response::WriteAlloc { req_id, .. }
            | Response::Release { req_id, .. }
            | Response::Notify { req_id } => *req_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// A response bound to the client socket it must reach. Owned by the
/// response queue from enqueue onward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RespContainer {
    pub socket_id: u64,
    pub resp: Response,
}

fn push_alloc_elts(b: &mut wire::FrameBuilder, media: &[AllocElt]) {
    b.push(&wire::alloc_out {
        n_media: media.len() as u32,
        padding: 0,
    });
    for elt in media {
        b.push(&wire::alloc_elt_out {
            avail_size: elt.avail_size,
            family: wire::family_code(elt.medium.family),
            fs_type: wire::fs_type_code(elt.fs_type),
            addr_type: wire::addr_type_code(elt.addr_type),
            padding: [0; 5],
        });
        b.push_str(&elt.medium.name);
        b.push_str(&elt.root_path.to_string_lossy());
    }
}

/// Encode a response frame.
pub fn encode_response(resp: &Response) -> Vec<u8> {
    use wire::FrameBuilder;

    let mut b;
    match resp {
        Response::Ping { req_id } => {
            b = FrameBuilder::new(Opcode::RespPing, *req_id);
        }
        Response::Error { req_id, kind, rc } => {
            b = FrameBuilder::new(Opcode::RespError, *req_id);
            b.push(&wire::error_out {
                rc: *rc,
                kind: kind.code(),
                padding: [0; 3],
            });
        }
        Response::Format { req_id, medium } => {
            b = FrameBuilder::new(Opcode::RespFormat, *req_id);
            b.push(&wire::format_out {
                family: wire::family_code(medium.family),
                padding: [0; 3],
            });
            b.push_str(&medium.name);
        }
        Response::ReadAlloc { req_id, media } => {
            b = FrameBuilder::new(Opcode::RespReadAlloc, *req_id);
            push_alloc_elts(&mut b, media);
        }
        Response::WriteAlloc { req_id, media } => {
            b = FrameBuilder::new(Opcode::RespWriteAlloc, *req_id);
            push_alloc_elts(&mut b, media);
        }
        Response::Release { req_id, media } => {
            b = FrameBuilder::new(Opcode::RespRelease, *req_id);
            b.push(&wire::release_out {
                n_media: media.len() as u32,
                padding: 0,
            });
            for medium in media {
                b.push(&wire::medium_ref {
                    family: wire::family_code(medium.family),
                });
                b.push_str(&medium.name);
            }
        }
        Response::Notify { req_id } => {
            b = FrameBuilder::new(Opcode::RespNotify, *req_id);
        }
    }
    b.finish()
}

fn fetch_alloc_elts(it: &mut ArgumentIterator<'_>) -> Result<Vec<AllocElt>, DecodeError> {
    let arg: wire::alloc_out = it.fetch().ok_or(DecodeError::InsufficientData)?;
    let mut media = Vec::with_capacity(arg.n_media as usize);
    for _ in 0..arg.n_media {
        let elt: wire::alloc_elt_out = it.fetch().ok_or(DecodeError::InsufficientData)?;
        let family = wire::family_from_code(elt.family).ok_or(DecodeError::InsufficientData)?;
        let fs_type = wire::fs_type_from_code(elt.fs_type).ok_or(DecodeError::InsufficientData)?;
        let addr_type =
            wire::addr_type_from_code(elt.addr_type).ok_or(DecodeError::InsufficientData)?;
        let name = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
        let root = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
        media.push(AllocElt {
            medium: ResourceId::new(family, name),
            root_path: PathBuf::from(root),
            fs_type,
            addr_type,
            avail_size: elt.avail_size,
        });
    }
    Ok(media)
}

/// Parse one response frame; the client-side counterpart of
/// [`encode_response`].
pub fn decode_response(buf: &[u8]) -> Result<Response, DecodeError> {
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
    let req_id = header.req_id;

    let mut it = ArgumentIterator::new(payload);
    let resp = match opcode {
        Opcode::RespPing => Response::Ping { req_id },
        Opcode::RespError => {
            let arg: wire::error_out = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let kind = RequestKind::from_code(arg.kind).ok_or(DecodeError::InsufficientData)?;
            Response::Error {
                req_id,
                kind,
                rc: arg.rc,
            }
        }
        Opcode::RespFormat => {
            let arg: wire::format_out = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let family =
                wire::family_from_code(arg.family).ok_or(DecodeError::InsufficientData)?;
            let name = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
            Response::Format {
                req_id,
                medium: ResourceId::new(family, name),
            }
        }
        Opcode::RespReadAlloc => Response::ReadAlloc {
            req_id,
            media: fetch_alloc_elts(&mut it)?,
        },
        Opcode::RespWriteAlloc => Response::WriteAlloc {
            req_id,
            media: fetch_alloc_elts(&mut it)?,
        },
        Opcode::RespRelease => {
            let arg: wire::release_out = it.fetch().ok_or(DecodeError::InsufficientData)?;
            let mut media = Vec::with_capacity(arg.n_media as usize);
            for _ in 0..arg.n_media {
                let mref: wire::medium_ref = it.fetch().ok_or(DecodeError::InsufficientData)?;
                let family =
                    wire::family_from_code(mref.family).ok_or(DecodeError::InsufficientData)?;
                let name = it.fetch_str().ok_or(DecodeError::InsufficientData)?;
                media.push(ResourceId::new(family, name));
            }
            Response::Release { req_id, media }
        }
        Opcode::RespNotify => Response::Notify { req_id },
        _ => return Err(DecodeError::UnknownOpcode(header.opcode)),
    };
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Family;

    fn round_trip(resp: Response) {
        let buf = encode_response(&resp);
        assert_eq!(decode_response(&buf).unwrap(), resp);
    }

    #[test]
    fn error_round_trip() {
        round_trip(Response::Error {
            req_id: 12,
            kind: RequestKind::Format,
            rc: -(libc::EIO),
        });
    }

    #[test]
    fn read_alloc_round_trip() {
        round_trip(Response::ReadAlloc {
            req_id: 5,
            media: vec![AllocElt {
                medium: ResourceId::new(Family::Tape, "T2"),
                root_path: PathBuf::from("/mnt/lrs-st0"),
                fs_type: FsType::Ltfs,
                addr_type: AddrType::Path,
                avail_size: 0,
            }],
        });
    }

    #[test]
    fn release_round_trip() {
        round_trip(Response::Release {
            req_id: 8,
            media: vec![
                ResourceId::new(Family::Disk, "d0"),
                ResourceId::new(Family::Disk, "d1"),
            ],
        });
    }
}
