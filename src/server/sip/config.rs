//! Bridge Configuration
//!
//! Ports and media settings for the dial tone bridge. Everything has a
//! default; environment variables (optionally from `.env`) override.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Well-known SIP port
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// Local IP to bind signaling and media to (all interfaces if None)
    pub bind_ip: Option<String>,

    /// SIP listening port
    pub sip_port: u16,

    /// Address written into SDP and Contact (auto-detected if None)
    pub advertised_ip: Option<String>,

    /// Local RTP port range start
    pub rtp_port_start: u16,

    /// Local RTP port range end
    pub rtp_port_end: u16,

    /// Registration expiry granted to every REGISTER, in seconds
    pub register_expires: u32,

    /// RTP payload type offered for telephone-event
    pub dtmf_payload_type: u8,

    /// Upper bound on one media socket read, in milliseconds
    pub media_read_timeout_ms: u64,

    /// Report repeated end packets of one key press only once
    pub dedup_digit_events: bool,

    /// Periodically drop lapsed registrations
    pub sweep_registrations: bool,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            sip_port: DEFAULT_SIP_PORT,
            advertised_ip: None,
            rtp_port_start: 10000,
            rtp_port_end: 20000,
            register_expires: 3600,
            dtmf_payload_type: 101,
            media_read_timeout_ms: 100,
            dedup_digit_events: false,
            sweep_registrations: false,
        }
    }
}

impl SipConfig {
    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_ip: env_string("DIALTONE_BIND_IP"),
            sip_port: env_parse("DIALTONE_SIP_PORT").unwrap_or(defaults.sip_port),
            advertised_ip: env_string("DIALTONE_ADVERTISED_IP"),
            rtp_port_start: env_parse("DIALTONE_RTP_PORT_START").unwrap_or(defaults.rtp_port_start),
            rtp_port_end: env_parse("DIALTONE_RTP_PORT_END").unwrap_or(defaults.rtp_port_end),
            register_expires: env_parse("DIALTONE_REGISTER_EXPIRES")
                .unwrap_or(defaults.register_expires),
            dtmf_payload_type: env_parse("DIALTONE_DTMF_PAYLOAD_TYPE")
                .unwrap_or(defaults.dtmf_payload_type),
            media_read_timeout_ms: env_parse("DIALTONE_MEDIA_READ_TIMEOUT_MS")
                .unwrap_or(defaults.media_read_timeout_ms),
            dedup_digit_events: env_flag("DIALTONE_DEDUP_DIGITS")
                .unwrap_or(defaults.dedup_digit_events),
            sweep_registrations: env_flag("DIALTONE_SWEEP_REGISTRATIONS")
                .unwrap_or(defaults.sweep_registrations),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.rtp_port_start == 0 {
            return Err("RTP port range must not start at 0".to_string());
        }
        if self.rtp_port_start >= self.rtp_port_end {
            return Err("RTP port range is invalid".to_string());
        }
        if !(96..=127).contains(&self.dtmf_payload_type) {
            return Err(format!(
                "DTMF payload type must be dynamic (96-127), got {}",
                self.dtmf_payload_type
            ));
        }
        if self.media_read_timeout_ms == 0 {
            return Err("Media read timeout must be non-zero".to_string());
        }
        if let Some(ip) = &self.bind_ip {
            ip.parse::<IpAddr>()
                .map_err(|_| format!("Invalid bind IP: {}", ip))?;
        }
        if let Some(ip) = &self.advertised_ip {
            ip.parse::<IpAddr>()
                .map_err(|_| format!("Invalid advertised IP: {}", ip))?;
        }
        Ok(())
    }

    /// Address sockets bind to
    pub fn bind_addr(&self) -> IpAddr {
        self.bind_ip
            .as_deref()
            .and_then(|ip| ip.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Address the far end should send to: explicit setting, then a specific
    /// bind address, then the first non-loopback IPv4 interface.
    pub fn advertised_addr(&self) -> IpAddr {
        if let Some(ip) = self.advertised_ip.as_deref().and_then(|ip| ip.parse().ok()) {
            return ip;
        }

        let bind = self.bind_addr();
        if !bind.is_unspecified() {
            return bind;
        }

        match get_local_ipv4() {
            Some(ip) => ip,
            None => {
                tracing::warn!("No IPv4 interface found, advertising 127.0.0.1");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        }
    }

    pub fn media_read_timeout(&self) -> Duration {
        Duration::from_millis(self.media_read_timeout_ms)
    }
}

/// Get the first non-loopback IPv4 address
fn get_local_ipv4() -> Option<IpAddr> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("Interface enumeration failed: {}", e);
            return None;
        }
    };

    interfaces.into_iter().find_map(|iface| match iface.addr {
        get_if_addrs::IfAddr::V4(ref addr) if !iface.is_loopback() => Some(IpAddr::V4(addr.ip)),
        _ => None,
    })
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
