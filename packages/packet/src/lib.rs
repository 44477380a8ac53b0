#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Wire format for packets exchanged between relaynet nodes.
//!
//! Every packet is framed with a fixed eight byte header followed by the
//! payload:
//!
//! ```text
//! dest(1) | src(1) | protocol(1) | flags(1) | length(4, big-endian) | payload(length)
//! ```
//!
//! Decoding fails closed. A stream that ends before the first header byte is
//! a normal "nothing to read" condition and yields `Ok(None)`, while a frame
//! that ends early or carries an impossible header is a
//! [`PacketError::Corrupt`] error.

use std::{
    fmt,
    io::{ErrorKind, Read},
    ops::BitOr,
};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use thiserror::Error;

/// A one byte virtual node address.
pub type Address = u8;

/// Reserved destination meaning "every other node".
pub const BROADCAST: Address = 255;

/// Highest address that may be assigned to a node.
pub const MAX_ADDRESS: Address = 254;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest framed packet, header included.
pub const MAX_PACKET_SIZE: usize = 65_507;

/// Largest payload that fits in a single framed packet.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Invalid source address {0}")]
    InvalidSource(Address),
    #[error("Payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Corrupt packet: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Control bits carried in the packet header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Self = Self(0);
    /// One side of a graceful connection close.
    pub const FIN: Self = Self(0b01);
    /// A non-packet input carried through the replay log.
    pub const REPLAY: Self = Self(0b10);

    const KNOWN: u8 = Self::FIN.0 | Self::REPLAY.0;

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `None` if any unknown bit is set.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::KNOWN == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    dest: Address,
    src: Address,
    protocol: u8,
    flags: Flags,
    payload: Bytes,
}

impl Packet {
    /// Creates an ordinary packet from `src` to `dest`.
    ///
    /// # Errors
    ///
    /// * If `src` is not a node address
    /// * If the payload does not fit in a single packet
    pub fn new(
        dest: Address,
        src: Address,
        protocol: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, PacketError> {
        Self::with_flags(dest, src, protocol, Flags::NONE, payload)
    }

    /// # Errors
    ///
    /// * If `src` is not a node address and the packet is not a replay packet
    /// * If the payload does not fit in a single packet
    pub fn with_flags(
        dest: Address,
        src: Address,
        protocol: u8,
        flags: Flags,
        payload: impl Into<Bytes>,
    ) -> Result<Self, PacketError> {
        let packet = Self {
            dest,
            src,
            protocol,
            flags,
            payload: payload.into(),
        };
        packet.validate()?;
        Ok(packet)
    }

    /// Self-addressed, empty control packet marking one side of a close.
    #[must_use]
    pub const fn fin(addr: Address) -> Self {
        Self {
            dest: addr,
            src: addr,
            protocol: 0,
            flags: Flags::FIN,
            payload: Bytes::new(),
        }
    }

    /// Creates a replay control packet. Its source is always [`BROADCAST`].
    ///
    /// # Errors
    ///
    /// * If the payload does not fit in a single packet
    pub fn replay(
        dest: Address,
        protocol: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, PacketError> {
        Self::with_flags(dest, BROADCAST, protocol, Flags::REPLAY, payload)
    }

    #[must_use]
    pub const fn dest(&self) -> Address {
        self.dest
    }

    #[must_use]
    pub const fn src(&self) -> Address {
        self.src
    }

    #[must_use]
    pub const fn protocol(&self) -> u8 {
        self.protocol
    }

    #[must_use]
    pub const fn flags(&self) -> Flags {
        self.flags
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub const fn is_fin(&self) -> bool {
        self.flags.contains(Flags::FIN)
    }

    #[must_use]
    pub const fn is_replay(&self) -> bool {
        self.flags.contains(Flags::REPLAY)
    }

    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        self.dest == BROADCAST
    }

    /// Size of this packet once framed, header included.
    #[must_use]
    pub fn framed_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Returns a copy of this packet addressed to `dest`.
    #[must_use]
    pub fn readdressed(&self, dest: Address) -> Self {
        Self {
            dest,
            ..self.clone()
        }
    }

    /// # Errors
    ///
    /// * If the source is not a node address and the packet is not a replay packet
    /// * If the framed size exceeds [`MAX_PACKET_SIZE`]
    pub fn validate(&self) -> Result<(), PacketError> {
        if self.src > MAX_ADDRESS && !self.is_replay() {
            return Err(PacketError::InvalidSource(self.src));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Encodes the packet into its wire representation.
    #[must_use]
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.framed_len());
        buf.put_u8(self.dest);
        buf.put_u8(self.src);
        buf.put_u8(self.protocol);
        buf.put_u8(self.flags.bits());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes exactly one packet from `buf`.
    ///
    /// # Errors
    ///
    /// * If the buffer is shorter than the header
    /// * If the length field does not match the number of payload bytes
    /// * If the header carries unknown flags or an invalid source address
    pub fn unpack(buf: &[u8]) -> Result<Self, PacketError> {
        let Some((header, mut body)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Err(PacketError::Corrupt("truncated header"));
        };
        let header = Header::decode(*header)?;

        if body.len() < header.len {
            return Err(PacketError::Corrupt("truncated payload"));
        }
        if body.len() > header.len {
            return Err(PacketError::Corrupt("trailing bytes after payload"));
        }

        let payload = body.copy_to_bytes(header.len);
        header.into_packet(payload)
    }

    /// Reads the next packet from a blocking stream.
    ///
    /// Returns `Ok(None)` if the stream is closed before the first byte of a
    /// header.
    ///
    /// # Errors
    ///
    /// * If the stream ends partway through a packet
    /// * If the header is corrupt
    /// * If the underlying reader fails
    pub fn read_from(reader: &mut impl Read) -> Result<Option<Self>, PacketError> {
        let mut header = [0u8; HEADER_SIZE];

        loop {
            match reader.read(&mut header[..1]) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        reader.read_exact(&mut header[1..]).map_err(eof_is_corrupt)?;
        let header = Header::decode(header)?;

        let mut payload = vec![0u8; header.len];
        reader.read_exact(&mut payload).map_err(eof_is_corrupt)?;

        header.into_packet(payload.into()).map(Some)
    }

    /// Async variant of [`Packet::read_from`].
    ///
    /// # Errors
    ///
    /// * If the stream ends partway through a packet
    /// * If the header is corrupt
    /// * If the underlying reader fails
    #[cfg(feature = "tokio")]
    pub async fn read_from_async(
        reader: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> Result<Option<Self>, PacketError> {
        use tokio::io::AsyncReadExt as _;

        let mut header = [0u8; HEADER_SIZE];

        if reader.read(&mut header[..1]).await? == 0 {
            return Ok(None);
        }

        reader
            .read_exact(&mut header[1..])
            .await
            .map_err(eof_is_corrupt)?;
        let header = Header::decode(header)?;

        let mut payload = vec![0u8; header.len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(eof_is_corrupt)?;

        header.into_packet(payload.into()).map(Some)
    }

    /// Single-line rendering used in the trace logs.
    #[must_use]
    pub fn to_trace_string(&self) -> String {
        format!(
            "src:{} dest:{} protocol:{} contents:{}",
            self.src,
            self.dest,
            self.protocol,
            String::from_utf8_lossy(&self.payload),
        )
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet: {}->{} protocol: {} contents: {}",
            self.src,
            self.dest,
            self.protocol,
            String::from_utf8_lossy(&self.payload),
        )
    }
}

struct Header {
    dest: Address,
    src: Address,
    protocol: u8,
    flags: Flags,
    len: usize,
}

impl Header {
    fn decode(raw: [u8; HEADER_SIZE]) -> Result<Self, PacketError> {
        let mut buf = &raw[..];
        let dest = buf.get_u8();
        let src = buf.get_u8();
        let protocol = buf.get_u8();
        let flags =
            Flags::from_bits(buf.get_u8()).ok_or(PacketError::Corrupt("unknown flag bits"))?;
        let len = buf.get_u32() as usize;

        if len > MAX_PAYLOAD_SIZE {
            return Err(PacketError::Corrupt("length exceeds maximum payload"));
        }

        Ok(Self {
            dest,
            src,
            protocol,
            flags,
            len,
        })
    }

    fn into_packet(self, payload: Bytes) -> Result<Packet, PacketError> {
        let packet = Packet {
            dest: self.dest,
            src: self.src,
            protocol: self.protocol,
            flags: self.flags,
            payload,
        };

        if !packet.is_valid() {
            log::debug!("into_packet: rejecting packet with src={}", packet.src);
            return Err(PacketError::Corrupt("invalid source address"));
        }

        Ok(packet)
    }
}

fn eof_is_corrupt(e: std::io::Error) -> PacketError {
    if e.kind() == ErrorKind::UnexpectedEof {
        PacketError::Corrupt("stream ended mid-packet")
    } else {
        PacketError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    fn hello() -> Packet {
        Packet::new(1, 0, 7, &b"hello"[..]).unwrap()
    }

    #[test_log::test]
    fn pack_writes_header_fields_in_order() {
        let bytes = hello().pack();

        assert_eq!(&bytes[..], &[1, 0, 7, 0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test_log::test]
    fn unpack_restores_packed_packets() {
        let packets = [
            hello(),
            Packet::new(BROADCAST, MAX_ADDRESS, 255, Bytes::new()).unwrap(),
            Packet::fin(3),
            Packet::replay(BROADCAST, 2, &b"fail 1"[..]).unwrap(),
            Packet::new(9, 4, 1, vec![0xAB; MAX_PAYLOAD_SIZE]).unwrap(),
        ];

        for packet in packets {
            assert_eq!(Packet::unpack(&packet.pack()).unwrap(), packet);
        }
    }

    #[test_log::test]
    fn new_rejects_broadcast_source() {
        let err = Packet::new(1, BROADCAST, 0, Bytes::new()).unwrap_err();

        assert!(matches!(err, PacketError::InvalidSource(BROADCAST)));
    }

    #[test_log::test]
    fn new_rejects_oversize_payload() {
        let err = Packet::new(1, 0, 0, vec![0; MAX_PAYLOAD_SIZE + 1]).unwrap_err();

        assert!(matches!(
            err,
            PacketError::PayloadTooLarge { len, max } if len == MAX_PAYLOAD_SIZE + 1 && max == MAX_PAYLOAD_SIZE
        ));
    }

    #[test_log::test]
    fn fin_is_self_addressed_and_empty() {
        let fin = Packet::fin(12);

        assert!(fin.is_fin());
        assert!(!fin.is_replay());
        assert_eq!(fin.src(), fin.dest());
        assert!(fin.payload().is_empty());
    }

    #[test_log::test]
    fn unpack_rejects_truncated_buffers() {
        let bytes = hello().pack();

        for len in 0..bytes.len() {
            assert!(
                matches!(Packet::unpack(&bytes[..len]), Err(PacketError::Corrupt(_))),
                "prefix of {len} bytes decoded",
            );
        }
    }

    #[test_log::test]
    fn unpack_rejects_trailing_bytes() {
        let mut bytes = hello().pack().to_vec();
        bytes.push(0);

        assert!(matches!(
            Packet::unpack(&bytes),
            Err(PacketError::Corrupt("trailing bytes after payload"))
        ));
    }

    #[test_log::test]
    fn unpack_rejects_unknown_flags() {
        let mut bytes = hello().pack().to_vec();
        bytes[3] = 0b100;

        assert!(matches!(
            Packet::unpack(&bytes),
            Err(PacketError::Corrupt("unknown flag bits"))
        ));
    }

    #[test_log::test]
    fn unpack_rejects_oversize_length_field() {
        let mut bytes = hello().pack().to_vec();
        bytes[4..8].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            Packet::unpack(&bytes),
            Err(PacketError::Corrupt("length exceeds maximum payload"))
        ));
    }

    #[test_log::test]
    fn read_from_distinguishes_eof_from_corruption() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(Packet::read_from(&mut empty).unwrap().is_none());

        let bytes = hello().pack();
        let mut truncated = Cursor::new(bytes[..bytes.len() - 1].to_vec());
        assert!(matches!(
            Packet::read_from(&mut truncated),
            Err(PacketError::Corrupt("stream ended mid-packet"))
        ));
    }

    #[test_log::test]
    fn read_from_reads_consecutive_frames() {
        let second = Packet::new(0, 1, 2, &b"world"[..]).unwrap();
        let mut stream = hello().pack().to_vec();
        stream.extend_from_slice(&second.pack());
        let mut stream = Cursor::new(stream);

        assert_eq!(Packet::read_from(&mut stream).unwrap(), Some(hello()));
        assert_eq!(Packet::read_from(&mut stream).unwrap(), Some(second));
        assert_eq!(Packet::read_from(&mut stream).unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn read_from_async_matches_blocking_reader() {
        let mut stream = hello().pack().to_vec();
        stream.extend_from_slice(&Packet::fin(1).pack());
        stream.push(1);
        let mut stream = &stream[..];

        assert_eq!(
            Packet::read_from_async(&mut stream).await.unwrap(),
            Some(hello())
        );
        assert_eq!(
            Packet::read_from_async(&mut stream).await.unwrap(),
            Some(Packet::fin(1))
        );
        assert!(matches!(
            Packet::read_from_async(&mut stream).await,
            Err(PacketError::Corrupt(_))
        ));
    }

    #[test_log::test]
    fn display_shows_route_and_contents() {
        assert_eq!(
            hello().to_string(),
            "Packet: 0->1 protocol: 7 contents: hello"
        );
        assert_eq!(
            hello().to_trace_string(),
            "src:0 dest:1 protocol:7 contents:hello"
        );
    }
}
