//! SIP listener
//!
//! One receive loop on the signaling socket; every datagram is handled on
//! its own task, so requests arriving together are processed in no
//! particular order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::call::CallEvent;
use super::config::SipConfig;
use super::dispatcher::Dispatcher;
use super::registrar::Registrar;
use super::rtp::RtpPortAllocator;
use super::session::{MediaSettings, SessionController};
use super::SipError;

/// How often lapsed registrations are purged when sweeping is on
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct SipServer {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    cancel_token: CancellationToken,
    sweep_registrations: bool,
}

impl SipServer {
    /// Bind the signaling socket and check the media port range
    pub async fn bind(config: &SipConfig) -> Result<Self, SipError> {
        config.validate().map_err(SipError::Config)?;

        let bind_ip = config.bind_addr();
        let addr = SocketAddr::new(bind_ip, config.sip_port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SipError::Bind { addr, source })?;
        let socket = Arc::new(socket);

        let ports = RtpPortAllocator::new(bind_ip, config.rtp_port_start, config.rtp_port_end);
        let probed = ports.probe().await?;
        tracing::debug!("RTP port range usable, first free port {}", probed);

        let cancel_token = CancellationToken::new();
        let sessions = Arc::new(SessionController::new(
            ports,
            MediaSettings {
                dtmf_payload_type: config.dtmf_payload_type,
                read_timeout: config.media_read_timeout(),
                dedup_digits: config.dedup_digit_events,
            },
            cancel_token.child_token(),
        ));

        let local_ip = config.advertised_addr();
        let sip_port = socket.local_addr()?.port();
        let dispatcher = Arc::new(Dispatcher::new(
            socket.clone(),
            Arc::new(Registrar::new(config.register_expires)),
            sessions,
            local_ip,
            sip_port,
        ));

        tracing::info!("SIP server listening on {} (advertising {})", socket.local_addr()?, local_ip);

        Ok(Self {
            socket,
            dispatcher,
            cancel_token,
            sweep_registrations: config.sweep_registrations,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Take the call event receiver (can only be called once)
    pub async fn take_event_receiver(&self) -> Option<mpsc::Receiver<CallEvent>> {
        self.dispatcher.sessions().take_event_receiver().await
    }

    /// Token that stops the receive loop and every call
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Receive loop; returns once the cancel token fires
    pub async fn run(&self) {
        if self.sweep_registrations {
            self.spawn_registration_sweep();
        }

        let mut buf = vec![0u8; 4096];
        tracing::info!("SIP server ready and listening for packets");

        loop {
            let (len, source) = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!("Error reading UDP packet: {}", e);
                        continue;
                    }
                },
            };

            let text = String::from_utf8_lossy(&buf[..len]).into_owned();
            tracing::debug!("Received SIP message from {} ({} bytes):\n{}", source, len, text);

            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.handle(&text, source).await;
            });
        }

        self.dispatcher.sessions().shutdown().await;
        tracing::info!("SIP server stopped");
    }

    fn spawn_registration_sweep(&self) {
        let registrar = self.dispatcher.registrar().clone();
        let token = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = registrar.purge_expired(Utc::now()).await;
                        if purged > 0 {
                            tracing::info!("Purged {} expired registrations", purged);
                        }
                    }
                }
            }
        });
    }
}
