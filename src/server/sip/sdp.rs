//! SDP offer/answer handling
//!
//! The remote offer is only mined for its media endpoint; the codec list it
//! declares is ignored. The answer always offers PCMU plus telephone-event.

use std::net::{IpAddr, SocketAddr};

use super::codec::{PCMU_PAYLOAD_TYPE, PCMU_SDP_NAME, SAMPLE_RATE};

/// Session name advertised in every answer
pub const SESSION_NAME: &str = "Travel by Telephone";

/// Media endpoint declared by a remote offer
///
/// `c=` supplies the address and `m=audio` the port. A missing connection line
/// falls back to `default_ip` (the signaling source). A missing or unusable
/// audio line means there is no media endpoint at all.
pub fn parse_remote_media(body: &str, default_ip: IpAddr) -> Option<SocketAddr> {
    let mut connection_ip = None;
    let mut media_port = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(rest) = line.strip_prefix("c=") {
            if let Some(ip) = parse_connection(rest) {
                connection_ip = Some(ip);
            }
        } else if let Some(rest) = line.strip_prefix("m=") {
            if let Some(port) = parse_audio_port(rest) {
                media_port = Some(port);
            }
        }
    }

    let port = media_port?;
    Some(SocketAddr::new(connection_ip.unwrap_or(default_ip), port))
}

// c=<nettype> <addrtype> <address>
fn parse_connection(rest: &str) -> Option<IpAddr> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }

    match parts[1] {
        "IP4" | "IP6" => parts[2].parse().ok(),
        _ => None,
    }
}

// m=audio <port> <proto> <fmt>...
fn parse_audio_port(rest: &str) -> Option<u16> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "audio" {
        return None;
    }

    // Leading run of digits, so "16384/2" still yields 16384
    let digits: String = parts[1].chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        _ => None,
    }
}

/// Build the SDP answer for a call bound to `rtp_port`
pub fn build_answer(
    local_ip: IpAddr,
    rtp_port: u16,
    session_id: u32,
    session_version: u32,
    dtmf_payload_type: u8,
) -> String {
    let addr_type = if local_ip.is_ipv4() { "IP4" } else { "IP6" };

    format!(
        "v=0\r\n\
         o=- {session_id} {session_version} IN {addr_type} {local_ip}\r\n\
         s={SESSION_NAME}\r\n\
         c=IN {addr_type} {local_ip}\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP {PCMU_PAYLOAD_TYPE} {dtmf_payload_type}\r\n\
         a=rtpmap:{PCMU_PAYLOAD_TYPE} {PCMU_SDP_NAME}/{SAMPLE_RATE}\r\n\
         a=rtpmap:{dtmf_payload_type} telephone-event/{SAMPLE_RATE}\r\n\
         a=fmtp:{dtmf_payload_type} 0-15\r\n\
         a=sendrecv\r\n"
    )
}
