//! SIP Call Management
//!
//! One inbound call: where its media goes, which state it is in, and the
//! cancellation token that stops its dial tone and digit detector.

use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use chrono::{DateTime, Utc};

use super::dtmf::TelephoneEvent;
use super::sdp;
use super::SipError;

/// Call state
///
/// Negotiating → Ringing → ToneActive → DigitReceived, and any live state
/// → Terminated. The tone never comes back once a digit has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// INVITE accepted, media socket bound, answer not yet sent
    Negotiating,
    /// 200 OK sent, media tasks not started
    Ringing,
    /// Dial tone is being streamed
    ToneActive,
    /// First digit seen; tone silenced, detector still listening
    DigitReceived,
    /// BYE received or server shutting down
    Terminated,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Negotiating, Ringing) | (Ringing, ToneActive) | (ToneActive, DigitReceived) => true,
            (Terminated, _) => false,
            (_, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Negotiating => write!(f, "Negotiating"),
            CallState::Ringing => write!(f, "Ringing"),
            CallState::ToneActive => write!(f, "ToneActive"),
            CallState::DigitReceived => write!(f, "DigitReceived"),
            CallState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Call event for state updates
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Call state changed
    StateChanged { call_id: String, state: CallState },
    /// DTMF digit received
    DigitDetected {
        call_id: String,
        digit: char,
        event: TelephoneEvent,
        from: SocketAddr,
    },
}

/// Represents an inbound call
pub struct CallSession {
    /// SIP Call-ID header
    pub call_id: String,
    /// Where the INVITE came from
    pub signaling_peer: SocketAddr,
    /// Our media port for this call
    local_rtp_port: u16,
    /// Remote RTP endpoint; absent when the offer had no audio line
    media_target: RwLock<Option<SocketAddr>>,
    /// Current call state
    state: RwLock<CallState>,
    /// Media socket, held until the media tasks take it
    socket: Mutex<Option<UdpSocket>>,
    /// SDP origin session id
    sdp_session_id: u32,
    /// Call start time
    pub started_at: DateTime<Utc>,
    cancel_token: CancellationToken,
    event_tx: mpsc::Sender<CallEvent>,
}

impl CallSession {
    pub fn new(
        call_id: String,
        signaling_peer: SocketAddr,
        media_target: Option<SocketAddr>,
        socket: UdpSocket,
        local_rtp_port: u16,
        cancel_token: CancellationToken,
        event_tx: mpsc::Sender<CallEvent>,
    ) -> Self {
        Self {
            call_id,
            signaling_peer,
            local_rtp_port,
            media_target: RwLock::new(media_target),
            state: RwLock::new(CallState::Negotiating),
            socket: Mutex::new(Some(socket)),
            sdp_session_id: rand::random::<u32>(),
            started_at: Utc::now(),
            cancel_token,
            event_tx,
        }
    }

    pub fn local_rtp_port(&self) -> u16 {
        self.local_rtp_port
    }

    pub async fn state(&self) -> CallState {
        *self.state.read().await
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub async fn transition(&self, next: CallState) -> Result<CallState, SipError> {
        let previous = {
            let mut current = self.state.write().await;
            if !current.can_transition_to(next) {
                return Err(SipError::InvalidState(format!(
                    "call {}: {} -> {}",
                    self.call_id, *current, next
                )));
            }
            std::mem::replace(&mut *current, next)
        };

        tracing::debug!("Call {} - {} -> {}", self.call_id, previous, next);
        self.emit(CallEvent::StateChanged {
            call_id: self.call_id.clone(),
            state: next,
        });

        Ok(previous)
    }

    pub async fn is_tone_active(&self) -> bool {
        self.state().await == CallState::ToneActive
    }

    pub async fn media_target(&self) -> Option<SocketAddr> {
        *self.media_target.read().await
    }

    pub async fn set_media_target(&self, target: Option<SocketAddr>) {
        *self.media_target.write().await = target;
    }

    /// Media socket for the tone and detector tasks; only handed out once
    pub async fn take_socket(&self) -> Option<UdpSocket> {
        self.socket.lock().await.take()
    }

    /// SDP answer for this call. Stable across re-INVITEs.
    pub fn answer_sdp(&self, local_ip: IpAddr, dtmf_payload_type: u8) -> String {
        sdp::build_answer(
            local_ip,
            self.local_rtp_port,
            self.sdp_session_id,
            1,
            dtmf_payload_type,
        )
    }

    /// Report a detected digit. The first one silences the tone; returns
    /// whether this call did so.
    pub async fn on_digit(&self, digit: char, event: TelephoneEvent, from: SocketAddr) -> bool {
        self.emit(CallEvent::DigitDetected {
            call_id: self.call_id.clone(),
            digit,
            event,
            from,
        });

        let silenced = {
            let mut state = self.state.write().await;
            if *state == CallState::ToneActive {
                *state = CallState::DigitReceived;
                true
            } else {
                false
            }
        };

        if silenced {
            tracing::info!("Call {} - stopping dial tone, digit detected", self.call_id);
            self.emit(CallEvent::StateChanged {
                call_id: self.call_id.clone(),
                state: CallState::DigitReceived,
            });
        }

        silenced
    }

    /// Stop media tasks and mark the call terminated
    pub async fn terminate(&self) {
        self.cancel_token.cancel();
        // Already terminated is fine
        let _ = self.transition(CallState::Terminated).await;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    fn emit(&self, event: CallEvent) {
        // Never block a media task on a slow or absent consumer
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::debug!("Call {} - dropping event: {}", self.call_id, e);
        }
    }
}
