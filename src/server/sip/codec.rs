//! G.711 μ-law (PCMU) encoder
//!
//! Pure Rust implementation of the ITU-T G.711 μ-law compander, the one
//! audio format the bridge offers. Only the encode direction is needed on the
//! wire: the dial tone is synthesized locally and the far end sends digits as
//! telephone events, not audio.

/// RTP payload type for PCMU
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

/// Codec name for SDP
pub const PCMU_SDP_NAME: &str = "PCMU";

/// Sample rate in Hz (G.711 always uses 8kHz)
pub const SAMPLE_RATE: u32 = 8000;

/// Samples per RTP packet (20ms of audio)
pub const SAMPLES_PER_PACKET: usize = 160;

// μ-law encoding constants
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Encode a frame of 16-bit PCM samples to μ-law, one byte per sample
pub fn encode_frame(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().map(|&s| linear_to_ulaw(s)).collect()
}

/// Convert 16-bit linear PCM to μ-law
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };

    // Widen before taking the magnitude so i16::MIN does not overflow
    let magnitude = (sample as i32).abs().min(ULAW_CLIP) + ULAW_BIAS;

    // Position of the highest set bit among bits 7..=14
    let exponent: u8 = match magnitude {
        s if s >= 0x4000 => 7,
        s if s >= 0x2000 => 6,
        s if s >= 0x1000 => 5,
        s if s >= 0x0800 => 4,
        s if s >= 0x0400 => 3,
        s if s >= 0x0200 => 2,
        s if s >= 0x0100 => 1,
        _ => 0,
    };

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}
