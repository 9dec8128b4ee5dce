//! RTP (Real-time Transport Protocol) framing
//!
//! Builds and parses the fixed 12-byte RTP header (RFC 3550) and hands out
//! per-call media sockets from the configured even-numbered port range.

use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use bytes::{BufMut, Bytes, BytesMut};

use super::SipError;

/// Fixed RTP header length. The adapter never sends CSRC lists or extensions.
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet header (12 bytes minimum)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (always 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (0 = PCMU, 101 = telephone-event)
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Timestamp
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize header into a buffer
    pub fn write_to(&self, buf: &mut BytesMut) {
        // First byte: V(2) P(1) X(1) CC(4)
        let first_byte = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0F);
        buf.put_u8(first_byte);

        // Second byte: M(1) PT(7)
        let second_byte = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    /// Parse header from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, SipError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(SipError::Rtp(format!(
                "RTP packet too short: {} bytes",
                data.len()
            )));
        }

        let first_byte = data[0];
        let second_byte = data[1];

        Ok(Self {
            version: first_byte >> 6,
            padding: (first_byte >> 5) & 1 == 1,
            extension: (first_byte >> 4) & 1 == 1,
            csrc_count: first_byte & 0x0F,
            marker: (second_byte >> 7) & 1 == 1,
            payload_type: second_byte & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// RTP packet with header and payload
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + self.payload.len());
        self.header.write_to(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse packet from bytes. The payload starts right after the fixed header.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SipError> {
        let header = RtpHeader::from_bytes(data)?;
        let payload = Bytes::copy_from_slice(&data[RTP_HEADER_LEN..]);

        Ok(Self { header, payload })
    }
}

/// Outbound stream counters for one sender
///
/// Sequence numbers advance by one and timestamps by the frame's sample count,
/// both wrapping, for as long as the stream lives.
#[derive(Debug)]
pub struct RtpStream {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpStream {
    /// New stream with random SSRC and random initial counters
    pub fn new(payload_type: u8) -> Self {
        Self::with_initial(
            payload_type,
            rand::random::<u32>(),
            rand::random::<u16>(),
            rand::random::<u32>(),
        )
    }

    pub fn with_initial(payload_type: u8, ssrc: u32, sequence: u16, timestamp: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            sequence,
            timestamp,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Frame a payload covering `samples` sample periods and advance the counters
    pub fn packetize(&mut self, payload: impl Into<Bytes>, samples: u32) -> RtpPacket {
        let header = RtpHeader::new(self.payload_type, self.sequence, self.timestamp, self.ssrc);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);

        RtpPacket::new(header, payload)
    }
}

/// RTP port allocator
///
/// Hands out one even-numbered port per call from `[start, end]`, walking the
/// range in steps of two and skipping ports that are already bound.
pub struct RtpPortAllocator {
    ip: IpAddr,
    start: u16,
    end: u16,
    next: Mutex<u16>,
}

impl RtpPortAllocator {
    pub fn new(ip: IpAddr, start: u16, end: u16) -> Self {
        // Ensure even port
        let start = start.saturating_add(start % 2);
        Self {
            ip,
            start,
            end,
            next: Mutex::new(start),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Check that at least one port in the range can be bound
    pub async fn probe(&self) -> Result<u16, SipError> {
        let (_socket, port) = self.bind().await?;
        Ok(port)
    }

    /// Bind the next free even port in the range
    pub async fn bind(&self) -> Result<(UdpSocket, u16), SipError> {
        let mut next = self.next.lock().await;
        let slots = ((self.end.saturating_sub(self.start)) / 2) as u32 + 1;
        let mut port = *next;

        for attempt in 0..slots {
            let addr = SocketAddr::new(self.ip, port);
            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    if attempt > 0 {
                        tracing::debug!("RTP bound to port {} after {} attempts", port, attempt + 1);
                    }
                    *next = self.step(port);
                    return Ok((socket, port));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    port = self.step(port);
                }
                Err(e) => {
                    return Err(SipError::Bind { addr, source: e });
                }
            }
        }

        Err(SipError::NoMediaPort {
            start: self.start,
            end: self.end,
        })
    }

    // RTP uses even ports, RTCP the odd one above
    fn step(&self, port: u16) -> u16 {
        match port.checked_add(2) {
            Some(p) if p <= self.end => p,
            _ => self.start,
        }
    }
}
