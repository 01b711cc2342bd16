//! Wire codec for the fabric manager's request/response protocol.
//!
//! Every message is a fixed-size, packed, little-endian struct whose first
//! byte is a tag (see `Tag`). Structs use `zerocopy`'s byteorder-aware
//! integer types so they can be read/written directly as byte slices with
//! no intermediate (de)serialization step, the same approach
//! `peerofs`'s on-disk superblock/inode structs use.

use zerocopy::byteorder::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Servers may serve the same name from several instances; fabric-wide.
pub const NUM_REPLICAS: usize = 3;

/// Per-channel logical window size. Not negotiated per-service.
pub const REPLICA_REGION_SIZE: u64 = 256 * 1024 * 1024;

/// Width in bytes of the fixed, NUL-padded `service_name`/`instance_id`
/// string fields.
pub const NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    GetMemSizeReq = 0,
    GetMemSizeResp = 1,
    WriteReq = 2,
    WriteResp = 3,
    ReadReq = 4,
    ReadResp = 5,
    RpcRegisterServiceReq = 6,
    RpcRegisterServiceResp = 7,
    RpcDeregisterServiceReq = 8,
    RpcDeregisterServiceResp = 9,
    RpcRequestChannelReq = 10,
    RpcRequestChannelResp = 11,
    RpcReleaseChannelReq = 12,
    RpcReleaseChannelResp = 13,
    RpcNewClientNotify = 14,
    RpcCloseChannelNotify = 15,
    ErrorResp = 16,
    FailReplicaReq = 17,
    FailReplicaResp = 18,
}

impl Tag {
    pub fn from_u8(b: u8) -> Option<Tag> {
        use Tag::*;
        Some(match b {
            0 => GetMemSizeReq,
            1 => GetMemSizeResp,
            2 => WriteReq,
            3 => WriteResp,
            4 => ReadReq,
            5 => ReadResp,
            6 => RpcRegisterServiceReq,
            7 => RpcRegisterServiceResp,
            8 => RpcDeregisterServiceReq,
            9 => RpcDeregisterServiceResp,
            10 => RpcRequestChannelReq,
            11 => RpcRequestChannelResp,
            12 => RpcReleaseChannelReq,
            13 => RpcReleaseChannelResp,
            14 => RpcNewClientNotify,
            15 => RpcCloseChannelNotify,
            16 => ErrorResp,
            17 => FailReplicaReq,
            18 => FailReplicaResp,
            _ => return None,
        })
    }

    /// Number of bytes (including the tag byte itself) that make up a
    /// complete request of this tag. Only defined for requests the FM
    /// reads off the wire (client/server/admin -> FM); responses and
    /// notifies are only ever written by the FM.
    pub fn request_body_len(self) -> Option<usize> {
        use Tag::*;
        Some(match self {
            GetMemSizeReq => size_of::<GetMemSizeReq>(),
            WriteReq => size_of::<WriteReq>(),
            ReadReq => size_of::<ReadReq>(),
            RpcRegisterServiceReq => size_of::<RpcRegisterServiceReq>(),
            RpcDeregisterServiceReq => size_of::<RpcDeregisterServiceReq>(),
            RpcRequestChannelReq => size_of::<RpcRequestChannelReq>(),
            RpcReleaseChannelReq => size_of::<RpcReleaseChannelReq>(),
            FailReplicaReq => size_of::<FailReplicaReq>(),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    ErrGeneric = 1,
    InvalidReq = 2,
    Io = 3,
    NoHealthyBackend = 4,
    OutOfBounds = 5,
    ServiceNotFound = 6,
    ChannelAllocFailed = 7,
    RegistrationFailed = 8,
}

impl Status {
    pub fn from_u8(b: u8) -> Option<Status> {
        use Status::*;
        Some(match b {
            0 => Ok,
            1 => ErrGeneric,
            2 => InvalidReq,
            3 => Io,
            4 => NoHealthyBackend,
            5 => OutOfBounds,
            6 => ServiceNotFound,
            7 => ChannelAllocFailed,
            8 => RegistrationFailed,
            _ => return None,
        })
    }
}

fn size_of<T>() -> usize {
    std::mem::size_of::<T>()
}

/// Pads/truncates `s` into a fixed-width NUL-padded byte array.
pub fn encode_name(s: &str, out: &mut [u8; NAME_LEN]) {
    out.fill(0);
    let bytes = s.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
}

/// Reads a NUL-padded fixed-width field back into a `String`, stopping at
/// the first NUL (or the end of the field if there is none).
pub fn decode_name(buf: &[u8; NAME_LEN]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

macro_rules! wire_struct {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
        #[repr(C)]
        pub struct $name {
            pub tag: u8,
            $(pub $field: $ty,)*
        }
    };
}

wire_struct!(GetMemSizeReq {});
wire_struct!(GetMemSizeResp { status: u8, total_size: U64 });

wire_struct!(WriteReq {
    channel_id: U64,
    addr: U64,
    size: u8,
    value: U64,
});
wire_struct!(WriteResp { status: u8 });

wire_struct!(ReadReq {
    channel_id: U64,
    addr: U64,
    size: u8,
});
wire_struct!(ReadResp { status: u8, value: U64 });

wire_struct!(RpcRegisterServiceReq {
    service_name: [u8; NAME_LEN],
    instance_id: [u8; NAME_LEN],
});
wire_struct!(RpcRegisterServiceResp { status: u8 });

wire_struct!(RpcDeregisterServiceReq {
    service_name: [u8; NAME_LEN],
    instance_id: [u8; NAME_LEN],
});
wire_struct!(RpcDeregisterServiceResp { status: u8 });

wire_struct!(RpcRequestChannelReq {
    service_name: [u8; NAME_LEN],
    instance_id: [u8; NAME_LEN],
});
wire_struct!(RpcRequestChannelResp {
    status: u8,
    channel_id: U64,
    offset: U64,
    size: U64,
});

wire_struct!(RpcReleaseChannelReq { channel_id: U64 });
wire_struct!(RpcReleaseChannelResp { status: u8 });

wire_struct!(RpcNewClientNotify {
    channel_id: U64,
    offset: U64,
    size: U64,
    service_name: [u8; NAME_LEN],
    client_instance_id: [u8; NAME_LEN],
});

wire_struct!(RpcCloseChannelNotify { channel_id: U64 });

wire_struct!(ErrorResp { status: u8 });

wire_struct!(FailReplicaReq { device_index: U64 });
wire_struct!(FailReplicaResp { status: u8 });

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let mut buf = [0u8; NAME_LEN];
        encode_name("svc", &mut buf);
        assert_eq!(decode_name(&buf), "svc");
    }

    #[test]
    fn name_truncates() {
        let long = "x".repeat(NAME_LEN + 10);
        let mut buf = [0u8; NAME_LEN];
        encode_name(&long, &mut buf);
        assert_eq!(decode_name(&buf), "x".repeat(NAME_LEN));
    }

    #[test]
    fn tag_roundtrip() {
        for b in 0..=18u8 {
            assert_eq!(Tag::from_u8(b).map(|t| t as u8), Some(b));
        }
        assert_eq!(Tag::from_u8(19), None);
    }

    #[test]
    fn write_req_encodes_fixed_size() {
        let req = WriteReq {
            tag: Tag::WriteReq as u8,
            channel_id: U64::new(7),
            addr: U64::new(0),
            size: 8,
            value: U64::new(0xDEADBEEF),
        };
        let bytes = req.as_bytes();
        assert_eq!(bytes.len(), Tag::WriteReq.request_body_len().unwrap());
        let decoded = WriteReq::read_from_bytes(bytes).unwrap();
        assert_eq!(decoded.channel_id.get(), 7);
        assert_eq!(decoded.value.get(), 0xDEADBEEF);
    }
}
