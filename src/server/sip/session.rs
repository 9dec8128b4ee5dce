//! Session controller
//!
//! Owns every live call: binds its media port, starts and stops the dial
//! tone and digit detector, and forwards call events to one consumer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::call::{CallEvent, CallSession, CallState};
use super::dtmf::DigitDetector;
use super::rtp::RtpPortAllocator;
use super::tone::ToneGenerator;
use super::SipError;

/// Media settings shared by every call
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub dtmf_payload_type: u8,
    pub read_timeout: Duration,
    pub dedup_digits: bool,
}

pub struct SessionController {
    ports: RtpPortAllocator,
    settings: MediaSettings,
    /// Active calls by Call-ID
    calls: RwLock<HashMap<String, Arc<CallSession>>>,
    /// Parent of every call's token
    cancel_token: CancellationToken,
    event_tx: mpsc::Sender<CallEvent>,
    event_rx: RwLock<Option<mpsc::Receiver<CallEvent>>>,
}

impl SessionController {
    pub fn new(
        ports: RtpPortAllocator,
        settings: MediaSettings,
        cancel_token: CancellationToken,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            ports,
            settings,
            calls: RwLock::new(HashMap::new()),
            cancel_token,
            event_tx,
            event_rx: RwLock::new(Some(event_rx)),
        }
    }

    pub fn settings(&self) -> &MediaSettings {
        &self.settings
    }

    /// Take the call event receiver (can only be called once)
    pub async fn take_event_receiver(&self) -> Option<mpsc::Receiver<CallEvent>> {
        self.event_rx.write().await.take()
    }

    pub async fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.calls.read().await.get(call_id).cloned()
    }

    /// Get all active calls
    pub async fn active_calls(&self) -> Vec<String> {
        self.calls.read().await.keys().cloned().collect()
    }

    /// Create the call for an INVITE, or return the live one for a re-INVITE.
    ///
    /// The flag is true when the call is new. A re-INVITE only updates the
    /// media target; it never binds a second port.
    pub async fn prepare(
        &self,
        call_id: &str,
        signaling_peer: SocketAddr,
        media_target: Option<SocketAddr>,
    ) -> Result<(Arc<CallSession>, bool), SipError> {
        let mut calls = self.calls.write().await;

        if let Some(existing) = calls.get(call_id) {
            existing.set_media_target(media_target).await;
            return Ok((existing.clone(), false));
        }

        let (socket, port) = self.ports.bind().await?;
        tracing::info!("Call {} - media port {}", call_id, port);

        let session = Arc::new(CallSession::new(
            call_id.to_string(),
            signaling_peer,
            media_target,
            socket,
            port,
            self.cancel_token.child_token(),
            self.event_tx.clone(),
        ));
        calls.insert(call_id.to_string(), session.clone());

        Ok((session, true))
    }

    /// Start dial tone and digit detection for a call that has been answered
    pub async fn start(&self, session: Arc<CallSession>) -> Result<(), SipError> {
        session.transition(CallState::ToneActive).await?;

        let socket = session
            .take_socket()
            .await
            .ok_or_else(|| SipError::InvalidState(format!("call {} already started", session.call_id)))?;
        let socket = Arc::new(socket);

        match session.media_target().await {
            Some(target) => tracing::info!("Call {} - remote RTP address {}", session.call_id, target),
            None => tracing::warn!("Call {} - no remote RTP address, tone will not be sent", session.call_id),
        }

        let detector = DigitDetector::new(
            self.settings.dtmf_payload_type,
            self.settings.read_timeout,
            self.settings.dedup_digits,
        );

        tokio::spawn(ToneGenerator::new().run(session.clone(), socket.clone()));
        tokio::spawn(detector.run(session, socket));

        Ok(())
    }

    /// Tear down a call: stop its media tasks and forget it.
    /// Returns false when no such call exists.
    pub async fn terminate(&self, call_id: &str) -> bool {
        let session = self.calls.write().await.remove(call_id);

        match session {
            Some(session) => {
                session.terminate().await;
                tracing::info!("SIP call ended: {}", call_id);
                true
            }
            None => false,
        }
    }

    /// Terminate every call
    pub async fn shutdown(&self) {
        let call_ids = self.active_calls().await;
        for call_id in call_ids {
            self.terminate(&call_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket;

    fn controller(start: u16, end: u16) -> SessionController {
        SessionController::new(
            RtpPortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST), start, end),
            MediaSettings {
                dtmf_payload_type: 101,
                read_timeout: Duration::from_millis(20),
                dedup_digits: false,
            },
            CancellationToken::new(),
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    #[tokio::test]
    async fn test_reinvite_reuses_session() {
        let controller = controller(42000, 42020);

        let (first, new_first) = controller.prepare("c1", peer(), None).await.unwrap();
        let target = Some("127.0.0.1:30000".parse().unwrap());
        let (second, new_second) = controller.prepare("c1", peer(), target).await.unwrap();

        assert!(new_first);
        assert!(!new_second);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.media_target().await, target);
        assert_eq!(controller.active_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_calls_get_distinct_ports() {
        let controller = controller(42100, 42120);

        let (a, _) = controller.prepare("a", peer(), None).await.unwrap();
        let (b, _) = controller.prepare("b", peer(), None).await.unwrap();

        assert_ne!(a.local_rtp_port(), b.local_rtp_port());
    }

    #[tokio::test]
    async fn test_start_requires_ringing() {
        let controller = controller(42200, 42220);
        let (session, _) = controller.prepare("c1", peer(), None).await.unwrap();

        // Still Negotiating
        assert!(controller.start(session.clone()).await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_releases_media_port() {
        let controller = controller(42300, 42320);
        let (session, _) = controller.prepare("c1", peer(), None).await.unwrap();
        let port = session.local_rtp_port();

        session.transition(CallState::Ringing).await.unwrap();
        controller.start(session.clone()).await.unwrap();
        assert!(controller.start(session.clone()).await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.terminate("c1").await);
        assert!(!controller.terminate("c1").await);
        assert_eq!(session.state().await, CallState::Terminated);

        // Both tasks drop the socket once they observe cancellation
        let mut rebound = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if UdpSocket::bind(("127.0.0.1", port)).await.is_ok() {
                rebound = true;
                break;
            }
        }
        assert!(rebound, "media port {} was not released", port);
    }

    #[tokio::test]
    async fn test_event_receiver_taken_once() {
        let controller = controller(42400, 42420);
        assert!(controller.take_event_receiver().await.is_some());
        assert!(controller.take_event_receiver().await.is_none());
    }
}
