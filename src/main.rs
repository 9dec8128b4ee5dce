//! Dial Tone Bridge
//!
//! SIP endpoint for an analog telephone adapter: pick up the handset, hear
//! dial tone, and the first key pressed silences it.

mod server;

use anyhow::Context;
use server::sip::SipConfig;

const USAGE: &str = "\
Dial Tone Bridge - SIP server for an analog telephone adapter

Usage: dialtone-bridge [--ip <addr>] [--help]

Options:
  --ip <addr>   IP address to bind to (default: all interfaces, advertised
                address auto-detected)
  --help        Show this message

Every setting can also come from DIALTONE_* environment variables or .env.
Point the adapter's proxy/registrar at this host, port 5060.";

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("dialtone_bridge=info".parse()?))
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.contains(&"--help".to_string()) || args.contains(&"-h".to_string()) {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = SipConfig::from_env();
    if let Some(ip) = cli_value(&args, "--ip")? {
        config.bind_ip = Some(ip);
    }
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    tracing::info!(
        "Starting dial tone bridge on port {} (RTP {}-{})",
        config.sip_port,
        config.rtp_port_start,
        config.rtp_port_end
    );

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(server::run_server(config))
}

/// Value following `flag`, accepting both `--flag value` and `--flag=value`
fn cli_value(args: &[String], flag: &str) -> anyhow::Result<Option<String>> {
    let prefix = format!("{}=", flag);

    for (i, arg) in args.iter().enumerate() {
        if arg == flag {
            let value = args
                .get(i + 1)
                .with_context(|| format!("{} requires a value", flag))?;
            return Ok(Some(value.clone()));
        }
        if let Some(value) = arg.strip_prefix(&prefix) {
            return Ok(Some(value.to_string()));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli_value_forms() {
        assert_eq!(
            cli_value(&args(&["--ip", "192.168.1.20"]), "--ip").unwrap(),
            Some("192.168.1.20".to_string())
        );
        assert_eq!(
            cli_value(&args(&["--ip=10.0.0.2"]), "--ip").unwrap(),
            Some("10.0.0.2".to_string())
        );
        assert_eq!(cli_value(&args(&[]), "--ip").unwrap(), None);
        assert!(cli_value(&args(&["--ip"]), "--ip").is_err());
    }
}
