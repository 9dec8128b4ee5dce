//! Pure Rust SIP dial tone bridge
//!
//! Answers calls from a single analog telephone adapter, plays dial tone and
//! listens for dialed digits. Features:
//! - REGISTER / OPTIONS / INVITE / ACK / BYE handling over UDP
//! - SDP offer parsing and PCMU + telephone-event answers
//! - Dial tone streamed as G.711 μ-law RTP, one media port per call
//! - RFC 4733 DTMF detection; the first digit silences the tone

mod call;
mod codec;
mod config;
mod dispatcher;
mod dtmf;
mod message;
mod registrar;
mod rtp;
mod sdp;
mod server;
mod session;
mod tone;


pub use call::{CallEvent, CallState};
pub use config::SipConfig;
pub use server::SipServer;

use std::net::SocketAddr;
use thiserror::Error;

/// SIP-related errors
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("No available RTP ports in range {start}-{end}")]
    NoMediaPort { start: u16, end: u16 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Unsupported SIP method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
