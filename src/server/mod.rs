//! Server-side code for the dial tone bridge
//!
//! - SIP signaling over UDP (registration, calls, keep-alives)
//! - Per-call dial tone and DTMF detection over RTP
#![allow(dead_code)]

pub mod sip;

use sip::{CallEvent, SipConfig, SipServer};

/// Run the bridge until Ctrl-C
pub async fn run_server(config: SipConfig) -> anyhow::Result<()> {
    let server = SipServer::bind(&config).await?;

    if let Some(mut events) = server.take_event_receiver().await {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CallEvent::StateChanged { call_id, state } => {
                        tracing::info!("Call {} is now {}", call_id, state);
                    }
                    CallEvent::DigitDetected { call_id, digit, event, from } => {
                        tracing::info!(
                            "Call {} dialed {} (event {}, {} ms, from {})",
                            call_id,
                            digit,
                            event.event,
                            u32::from(event.duration) / 8,
                            from
                        );
                    }
                }
            }
        });
    }

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::error!("Unable to listen for shutdown signal: {}", e),
        }
        cancel.cancel();
    });

    server.run().await;
    Ok(())
}
