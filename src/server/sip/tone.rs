//! Dial tone generation
//!
//! North American precise dial tone: 350 Hz + 440 Hz at equal level, streamed
//! as PCMU in 20ms packets until the call leaves the ToneActive state.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;

use super::call::CallSession;
use super::codec::{self, PCMU_PAYLOAD_TYPE, SAMPLES_PER_PACKET, SAMPLE_RATE};
use super::rtp::{RtpPacket, RtpStream};

/// Dial tone frequencies (Hz)
pub const DIAL_TONE_FREQS: (f64, f64) = (350.0, 440.0);

/// Packetization interval
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Peak of the summed tone; keeps headroom below i16::MAX
const AMPLITUDE: f64 = 16383.0;

/// Phase-continuous dual-tone synthesizer
#[derive(Debug, Default)]
pub struct DialTone {
    sample_index: u32,
}

impl DialTone {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next 20ms of 16-bit PCM
    pub fn next_frame(&mut self) -> Vec<i16> {
        let (f1, f2) = DIAL_TONE_FREQS;
        let rate = SAMPLE_RATE as f64;

        (0..SAMPLES_PER_PACKET)
            .map(|_| {
                let t = self.sample_index as f64 / rate;
                let low = 0.5 * (2.0 * std::f64::consts::PI * f1 * t).sin();
                let high = 0.5 * (2.0 * std::f64::consts::PI * f2 * t).sin();

                // Both tones are whole hertz, so the waveform repeats every second
                self.sample_index = (self.sample_index + 1) % SAMPLE_RATE;

                ((low + high) * AMPLITUDE) as i16
            })
            .collect()
    }
}

/// Produces one framed PCMU packet per tick
pub struct ToneGenerator {
    tone: DialTone,
    stream: RtpStream,
}

impl ToneGenerator {
    pub fn new() -> Self {
        Self::with_stream(RtpStream::new(PCMU_PAYLOAD_TYPE))
    }

    pub fn with_stream(stream: RtpStream) -> Self {
        Self {
            tone: DialTone::new(),
            stream,
        }
    }

    /// Synthesize, encode and frame the next packet
    pub fn next_packet(&mut self) -> RtpPacket {
        let pcm = self.tone.next_frame();
        let payload = codec::encode_frame(&pcm);
        self.stream.packetize(payload, SAMPLES_PER_PACKET as u32)
    }

    /// Stream until the tone is silenced or the call is cancelled.
    /// Returns the number of packets sent.
    pub async fn run(mut self, session: Arc<CallSession>, socket: Arc<UdpSocket>) -> u64 {
        tracing::info!(
            "Starting dial tone for call {} (ssrc {:#010x})",
            session.call_id,
            self.stream.ssrc()
        );

        let cancel = session.cancel_token().clone();
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Checked once per tick, so at most one more frame goes out after silencing
            if !session.is_tone_active().await {
                break;
            }

            let packet = self.next_packet();

            let Some(target) = session.media_target().await else {
                continue;
            };

            match socket.send_to(&packet.to_bytes(), target).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!("Error sending RTP packet to {}: {}", target, e);
                }
            }
        }

        tracing::info!(
            "Dial tone stopped for call {} after {} packets",
            session.call_id,
            sent
        );
        sent
    }
}

impl Default for ToneGenerator {
    fn default() -> Self {
        Self::new()
    }
}
