//! DTMF detection from RFC 4733 telephone-event packets
//!
//! The adapter sends digits out of band as RTP telephone events. Every
//! matching packet counts as a detection unless de-duplication is enabled;
//! real devices repeat the end packet of each key press three times.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

use super::call::CallSession;
use super::rtp::{RtpHeader, RTP_HEADER_LEN};

/// Telephone-event payload length
const EVENT_LEN: usize = 4;

/// One telephone-event payload block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    /// Event code (0-15 for DTMF)
    pub event: u8,
    /// End-of-event (E) bit
    pub end: bool,
    /// Volume in -dBm0 (0-63)
    pub volume: u8,
    /// Duration in timestamp units
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < EVENT_LEN {
            return None;
        }

        Some(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    /// DTMF symbol for this event, if it is one
    pub fn digit(&self) -> Option<char> {
        event_to_digit(self.event)
    }
}

/// Convert DTMF event code to digit
pub fn event_to_digit(event: u8) -> Option<char> {
    match event {
        0..=9 => Some((b'0' + event) as char),
        10 => Some('*'),
        11 => Some('#'),
        12 => Some('A'),
        13 => Some('B'),
        14 => Some('C'),
        15 => Some('D'),
        _ => None,
    }
}

/// A recognized digit and where it came from in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub digit: char,
    pub event: TelephoneEvent,
    pub timestamp: u32,
}

/// Listens on a call's media socket for telephone events
pub struct DigitDetector {
    payload_type: u8,
    read_timeout: Duration,
    dedup: bool,
    last: Option<(u8, u32)>,
}

impl DigitDetector {
    pub fn new(payload_type: u8, read_timeout: Duration, dedup: bool) -> Self {
        Self {
            payload_type,
            read_timeout,
            dedup,
            last: None,
        }
    }

    /// Inspect one datagram. Short packets, other payload types and
    /// unknown event codes yield nothing.
    pub fn inspect(&mut self, packet: &[u8]) -> Option<Detection> {
        let header = match RtpHeader::from_bytes(packet) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!("Dropping media packet: {}", e);
                return None;
            }
        };

        if header.payload_type != self.payload_type {
            return None;
        }

        let event = TelephoneEvent::parse(&packet[RTP_HEADER_LEN..])?;
        let digit = event.digit()?;

        if self.dedup {
            // Retransmissions of one key press share the RTP timestamp
            let key = (event.event, header.timestamp);
            if self.last == Some(key) {
                return None;
            }
            self.last = Some(key);
        }

        Some(Detection {
            digit,
            event,
            timestamp: header.timestamp,
        })
    }

    /// Read loop; exits when the call's token is cancelled
    pub async fn run(mut self, session: Arc<CallSession>, socket: Arc<UdpSocket>) {
        tracing::info!("Starting DTMF detection for call {}", session.call_id);

        let mut buf = [0u8; 1500];
        let cancel = session.cancel_token().clone();

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                res = tokio::time::timeout(self.read_timeout, socket.recv_from(&mut buf)) => res,
            };

            let (len, from) = match received {
                // Quiet line; poll again
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::warn!("Error reading RTP packet for call {}: {}", session.call_id, e);
                    continue;
                }
                Ok(Ok(v)) => v,
            };

            if let Some(detection) = self.inspect(&buf[..len]) {
                tracing::info!(
                    "DTMF detected on call {}: {} (from {})",
                    session.call_id,
                    detection.digit,
                    from
                );
                session.on_digit(detection.digit, detection.event, from).await;
            }
        }

        tracing::info!("DTMF detection stopped for call {}", session.call_id);
    }
}
