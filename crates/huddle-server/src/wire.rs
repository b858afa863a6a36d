//! Packet framing.
//!
//! Every message on a stream is one packet:
//!
//! ```text
//! [kind: u8][mid: u64][route_len: u16][data_len: u32] + route + data
//! ```
//!
//! All integers are big endian. `mid` pairs a `Response` with the `Request`
//! it answers and is zero for `Notify` and `Push`. `Response` packets carry no
//! route; every other kind must name one. The route is UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 15;

/// Largest accepted data section (16 MiB).
pub const MAX_DATA_SIZE: usize = 16 * 1024 * 1024;

/// Longest accepted route.
pub const MAX_ROUTE_LEN: usize = u16::MAX as usize;

/// Packet direction and purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Client call expecting a `Response` with the same `mid`.
    Request = 0,
    /// Client call without a response.
    Notify = 1,
    /// Server answer to a `Request`.
    Response = 2,
    /// Server-initiated message on a route.
    Push = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Notify),
            2 => Ok(Self::Response),
            3 => Ok(Self::Push),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Parsed fixed header. Tells a reader how many body bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet kind.
    pub kind: PacketKind,
    /// Message ID.
    pub mid: u64,
    /// Route length in bytes.
    pub route_len: u16,
    /// Data length in bytes.
    pub data_len: u32,
}

impl PacketHeader {
    /// Parse and validate the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Rejects unknown kinds and oversized data before anything is allocated.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::Truncated { expected: HEADER_SIZE, actual: bytes.len() });
        }

        let mut buf = &bytes[..HEADER_SIZE];
        let kind = PacketKind::try_from(buf.get_u8())?;
        let mid = buf.get_u64();
        let route_len = buf.get_u16();
        let data_len = buf.get_u32();

        if data_len as usize > MAX_DATA_SIZE {
            return Err(ProtocolError::DataTooLarge { size: data_len as usize, max: MAX_DATA_SIZE });
        }

        Ok(Self { kind, mid, route_len, data_len })
    }

    /// Bytes following the header.
    pub fn body_len(&self) -> usize {
        self.route_len as usize + self.data_len as usize
    }

    fn put(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.kind as u8);
        dst.put_u64(self.mid);
        dst.put_u16(self.route_len);
        dst.put_u32(self.data_len);
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Message ID, zero unless `Request`/`Response`.
    pub mid: u64,
    /// Handler route, empty for `Response`.
    pub route: String,
    /// Encoded payload.
    pub data: Bytes,
}

impl Packet {
    /// Client request expecting a response.
    pub fn request(mid: u64, route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { kind: PacketKind::Request, mid, route: route.into(), data: data.into() }
    }

    /// Client notification.
    pub fn notify(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { kind: PacketKind::Notify, mid: 0, route: route.into(), data: data.into() }
    }

    /// Server response to request `mid`.
    pub fn response(mid: u64, data: impl Into<Bytes>) -> Self {
        Self { kind: PacketKind::Response, mid, route: String::new(), data: data.into() }
    }

    /// Server push on `route`.
    pub fn push(route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self { kind: PacketKind::Push, mid: 0, route: route.into(), data: data.into() }
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.route.len() + self.data.len()
    }

    /// Append the encoded packet to `dst`.
    ///
    /// # Errors
    ///
    /// - `DataTooLarge` / `RouteTooLong` past the size limits
    /// - `MissingRoute` / `UnexpectedRoute` if the route does not fit the kind
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        self.validate_route()?;
        if self.data.len() > MAX_DATA_SIZE {
            return Err(ProtocolError::DataTooLarge { size: self.data.len(), max: MAX_DATA_SIZE });
        }
        let route_len = u16::try_from(self.route.len())
            .map_err(|_| ProtocolError::RouteTooLong { len: self.route.len(), max: MAX_ROUTE_LEN })?;

        let header = PacketHeader {
            kind: self.kind,
            mid: self.mid,
            route_len,
            data_len: self.data.len() as u32,
        };
        header.put(dst);
        dst.put_slice(self.route.as_bytes());
        dst.put_slice(&self.data);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one packet from the front of `bytes`. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header = PacketHeader::parse(bytes)?;
        Self::from_parts(header, &bytes[HEADER_SIZE..])
    }

    /// Build a packet from a parsed header and the bytes that followed it.
    pub fn from_parts(header: PacketHeader, body: &[u8]) -> Result<Self, ProtocolError> {
        let route_len = header.route_len as usize;
        let body_len = header.body_len();
        if body.len() < body_len {
            return Err(ProtocolError::Truncated { expected: body_len, actual: body.len() });
        }

        let route = std::str::from_utf8(&body[..route_len]).map_err(|_| ProtocolError::InvalidRoute)?;
        let packet = Self {
            kind: header.kind,
            mid: header.mid,
            route: route.to_string(),
            data: Bytes::copy_from_slice(&body[route_len..body_len]),
        };
        packet.validate_route()?;
        Ok(packet)
    }

    fn validate_route(&self) -> Result<(), ProtocolError> {
        match (self.kind, self.route.is_empty()) {
            (PacketKind::Response, false) => Err(ProtocolError::UnexpectedRoute),
            (PacketKind::Request | PacketKind::Notify | PacketKind::Push, true) => {
                Err(ProtocolError::MissingRoute)
            },
            _ => Ok(()),
        }
    }
}

/// Packet framing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Fewer bytes than the header or body requires.
    #[error("packet truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Kind byte is not a known [`PacketKind`].
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),

    /// Data section exceeds [`MAX_DATA_SIZE`].
    #[error("packet data too large: {size} > {max}")]
    DataTooLarge {
        /// Claimed or actual size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Route exceeds [`MAX_ROUTE_LEN`].
    #[error("route too long: {len} > {max}")]
    RouteTooLong {
        /// Route length
        len: usize,
        /// Limit
        max: usize,
    },

    /// Route is not UTF-8.
    #[error("route is not valid UTF-8")]
    InvalidRoute,

    /// Request, notify, or push without a route.
    #[error("packet kind requires a route")]
    MissingRoute,

    /// Response carrying a route.
    #[error("response packets carry no route")]
    UnexpectedRoute,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let bytes = Packet::request(0x0102, "room.join", &b"{}"[..]).to_bytes().unwrap();

        assert_eq!(bytes[0], PacketKind::Request as u8);
        assert_eq!(&bytes[1..9], &0x0102u64.to_be_bytes());
        assert_eq!(&bytes[9..11], &9u16.to_be_bytes());
        assert_eq!(&bytes[11..15], &2u32.to_be_bytes());
        assert_eq!(&bytes[15..24], b"room.join");
        assert_eq!(&bytes[24..], b"{}");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut bytes = Packet::push("onMessage", Bytes::new()).to_bytes().unwrap().to_vec();
        bytes[0] = 9;

        assert_eq!(Packet::decode(&bytes), Err(ProtocolError::UnknownKind(9)));
    }

    #[test]
    fn oversized_data_is_rejected_from_header_alone() {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = PacketKind::Notify as u8;
        header[11..15].copy_from_slice(&(MAX_DATA_SIZE as u32 + 1).to_be_bytes());

        assert!(matches!(PacketHeader::parse(&header), Err(ProtocolError::DataTooLarge { .. })));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let bytes = Packet::notify("room.message", &b"hello"[..]).to_bytes().unwrap();

        let err = Packet::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { expected: 17, actual: 16 });
        assert!(matches!(Packet::decode(&bytes[..4]), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn route_rules_follow_kind() {
        let mut response = Packet::response(1, Bytes::new());
        response.route = "oops".to_string();
        assert_eq!(response.to_bytes(), Err(ProtocolError::UnexpectedRoute));

        assert_eq!(Packet::push("", Bytes::new()).to_bytes(), Err(ProtocolError::MissingRoute));
    }

    #[test]
    fn non_utf8_route_is_rejected() {
        let mut bytes = Packet::notify("ab", Bytes::new()).to_bytes().unwrap().to_vec();
        bytes[HEADER_SIZE] = 0xff;

        assert_eq!(Packet::decode(&bytes), Err(ProtocolError::InvalidRoute));
    }
}
