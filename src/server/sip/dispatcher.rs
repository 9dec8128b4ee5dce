//! SIP request dispatch
//!
//! Classifies each inbound datagram and routes requests to a per-method
//! handler. There is no transaction layer: responses are sent once, never
//! retransmitted, and requests for methods without a handler are dropped
//! without an error response.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

use super::call::{CallSession, CallState};
use super::message::{SipMessage, SipMethod, SipResponse, StartLine};
use super::registrar::Registrar;
use super::sdp;
use super::session::SessionController;

/// To-tag on REGISTER and OPTIONS responses
pub const REGISTER_TAG: &str = "12345";

/// To-tag on INVITE and BYE responses
pub const DIALOG_TAG: &str = "54321";

/// Methods listed in OPTIONS responses
pub const ALLOWED_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER";

pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    registrar: Arc<Registrar>,
    sessions: Arc<SessionController>,
    /// Address placed in SDP and Contact
    local_ip: IpAddr,
    sip_port: u16,
}

impl Dispatcher {
    pub fn new(
        socket: Arc<UdpSocket>,
        registrar: Arc<Registrar>,
        sessions: Arc<SessionController>,
        local_ip: IpAddr,
        sip_port: u16,
    ) -> Self {
        Self {
            socket,
            registrar,
            sessions,
            local_ip,
            sip_port,
        }
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    /// Handle one received datagram
    pub async fn handle(&self, text: &str, source: SocketAddr) {
        let message = match SipMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Ignoring datagram from {}: {}", source, e);
                return;
            }
        };

        let method = match &message.start_line {
            StartLine::Status(line) => {
                tracing::info!("Received SIP response from {}: {}", source, line);
                return;
            }
            StartLine::Request { method, .. } => method,
        };

        let method = match SipMethod::parse(method) {
            Ok(method) => method,
            Err(e) => {
                tracing::warn!("Dropping request from {}: {}", source, e);
                return;
            }
        };

        match method {
            SipMethod::Register => {
                let response = self.handle_register(&message, source).await;
                self.send_response(&response, source).await;
            }
            SipMethod::Invite => {
                let (response, started) = self.handle_invite(&message, source).await;
                self.send_response(&response, source).await;

                // Tone starts right after the 200 OK, without waiting for ACK
                if let Some(session) = started {
                    if let Err(e) = self.sessions.start(session).await {
                        tracing::error!("Failed to start call media: {}", e);
                    }
                }
            }
            SipMethod::Ack => self.handle_ack(&message, source),
            SipMethod::Bye => {
                let response = self.handle_bye(&message, source).await;
                self.send_response(&response, source).await;
            }
            SipMethod::Options => {
                let response = self.handle_options(&message, source);
                self.send_response(&response, source).await;
            }
        }
    }

    async fn handle_register(&self, request: &SipMessage, source: SocketAddr) -> SipResponse {
        let call_id = request.header("Call-ID");
        let contact = request.header("Contact");

        // No authentication: every REGISTER is accepted
        self.registrar.register(call_id, contact, source).await;
        tracing::info!("Registered UA: {} (call id {}, from {})", contact, call_id, source);

        SipResponse::ok()
            .echo_dialog(request, REGISTER_TAG)
            .header("Contact", contact)
            .header("Expires", self.registrar.expires().to_string())
    }

    fn handle_options(&self, request: &SipMessage, source: SocketAddr) -> SipResponse {
        tracing::debug!("OPTIONS keep-alive from {}", source);

        SipResponse::ok()
            .echo_dialog(request, REGISTER_TAG)
            .header("Allow", ALLOWED_METHODS)
    }

    /// Answer an INVITE. Returns the call to start when this INVITE created it.
    async fn handle_invite(
        &self,
        request: &SipMessage,
        source: SocketAddr,
    ) -> (SipResponse, Option<Arc<CallSession>>) {
        let call_id = request.header("Call-ID");
        tracing::info!("Incoming call {} from {} - phone off hook", call_id, source);

        let media_target = sdp::parse_remote_media(&request.body, source.ip());

        let (session, is_new) = match self.sessions.prepare(call_id, source, media_target).await {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::error!("Rejecting call {}: {}", call_id, e);
                let response = SipResponse::new(503, "Service Unavailable")
                    .echo_dialog(request, DIALOG_TAG);
                return (response, None);
            }
        };

        let answer = session.answer_sdp(self.local_ip, self.sessions.settings().dtmf_payload_type);

        let response = SipResponse::ok()
            .echo_dialog(request, DIALOG_TAG)
            .header("Contact", format!("<sip:server@{}:{}>", self.local_ip, self.sip_port))
            .body("application/sdp", answer);

        if !is_new {
            tracing::info!("Re-INVITE for call {}, media target {:?}", call_id, media_target);
            return (response, None);
        }

        if let Err(e) = session.transition(CallState::Ringing).await {
            tracing::error!("Call {} not startable: {}", call_id, e);
            return (response, None);
        }

        (response, Some(session))
    }

    fn handle_ack(&self, request: &SipMessage, source: SocketAddr) {
        tracing::info!("ACK for call {} from {} - call established", request.header("Call-ID"), source);
    }

    async fn handle_bye(&self, request: &SipMessage, source: SocketAddr) -> SipResponse {
        let call_id = request.header("Call-ID");
        tracing::info!("BYE for call {} from {} - call terminated", call_id, source);

        if !self.sessions.terminate(call_id).await {
            tracing::debug!("BYE for unknown call {}", call_id);
        }

        SipResponse::ok().echo_dialog(request, DIALOG_TAG)
    }

    async fn send_response(&self, response: &SipResponse, target: SocketAddr) {
        let text = response.render();

        if let Err(e) = self.socket.send_to(text.as_bytes(), target).await {
            tracing::error!("Error sending response to {}: {}", target, e);
            return;
        }

        tracing::debug!("Sent SIP {} response to {}:\n{}", response.status(), target, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::rtp::RtpPortAllocator;
    use super::super::session::MediaSettings;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        dispatcher: Dispatcher,
        phone: UdpSocket,
        phone_addr: SocketAddr,
    }

    impl Harness {
        async fn new(rtp_start: u16) -> Self {
            let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
            let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let sessions = Arc::new(SessionController::new(
                RtpPortAllocator::new(localhost, rtp_start, rtp_start + 20),
                MediaSettings {
                    dtmf_payload_type: 101,
                    read_timeout: Duration::from_millis(20),
                    dedup_digits: false,
                },
                CancellationToken::new(),
            ));
            let dispatcher = Dispatcher::new(
                socket,
                Arc::new(Registrar::new(3600)),
                sessions,
                localhost,
                5060,
            );

            let phone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let phone_addr = phone.local_addr().unwrap();

            Self {
                dispatcher,
                phone,
                phone_addr,
            }
        }

        async fn exchange(&self, request: &str) -> SipMessage {
            self.dispatcher.handle(request, self.phone_addr).await;
            let mut buf = [0u8; 4096];
            let (len, _) = tokio::time::timeout(Duration::from_secs(1), self.phone.recv_from(&mut buf))
                .await
                .expect("no response")
                .unwrap();
            SipMessage::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap()
        }

        async fn expect_silence(&self) {
            let mut buf = [0u8; 4096];
            let res = tokio::time::timeout(Duration::from_millis(200), self.phone.recv_from(&mut buf)).await;
            assert!(res.is_err(), "unexpected response");
        }
    }

    fn request(method: &str, call_id: &str, extra: &str, body: &str) -> String {
        format!(
            "{method} sip:server@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-{call_id}\r\n\
             From: <sip:1001@127.0.0.1>;tag=ata\r\n\
             To: <sip:server@127.0.0.1>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 {method}\r\n\
             {extra}\
             Content-Length: {}\r\n\
             \r\n\
             {body}",
            body.len()
        )
    }

    fn status(message: &SipMessage) -> &str {
        match &message.start_line {
            StartLine::Status(line) => line,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_scenario() {
        let h = Harness::new(43000).await;
        let req = request(
            "REGISTER",
            "abc123",
            "Contact: <sip:1001@10.0.0.9>\r\nExpires: 60\r\n",
            "",
        );
        let sent = SipMessage::parse(&req).unwrap();

        let resp = h.exchange(&req).await;

        assert_eq!(status(&resp), "SIP/2.0 200 OK");
        assert_eq!(resp.header("Via"), sent.header("Via"));
        assert_eq!(resp.header("From"), sent.header("From"));
        assert_eq!(resp.header("To"), format!("{};tag=12345", sent.header("To")));
        assert_eq!(resp.header("Call-ID"), "abc123");
        assert_eq!(resp.header("CSeq"), "1 REGISTER");
        assert_eq!(resp.header("Contact"), "<sip:1001@10.0.0.9>");
        // Requested 60, granted the fixed window
        assert_eq!(resp.header("Expires"), "3600");
        assert_eq!(resp.header("Content-Length"), "0");

        let agent = h.dispatcher.registrar().get("abc123").await.unwrap();
        assert_eq!(agent.contact, "<sip:1001@10.0.0.9>");
        assert_eq!(agent.source, h.phone_addr);
    }

    #[tokio::test]
    async fn test_options_lists_methods() {
        let h = Harness::new(43100).await;
        let resp = h.exchange(&request("OPTIONS", "opt-1", "", "")).await;

        assert_eq!(status(&resp), "SIP/2.0 200 OK");
        assert_eq!(resp.header("Allow"), ALLOWED_METHODS);
        assert!(resp.header("To").ends_with(";tag=12345"));
    }

    #[tokio::test]
    async fn test_invite_answers_with_sdp() {
        let h = Harness::new(43200).await;
        let offer = "v=0\r\nc=IN IP4 10.0.0.5\r\nt=0 0\r\nm=audio 16384 RTP/AVP 0 101\r\n";
        let resp = h
            .exchange(&request("INVITE", "call-1", "Content-Type: application/sdp\r\n", offer))
            .await;

        assert_eq!(status(&resp), "SIP/2.0 200 OK");
        assert!(resp.header("To").ends_with(";tag=54321"));
        assert_eq!(resp.header("Content-Type"), "application/sdp");
        assert_eq!(resp.header("Contact"), "<sip:server@127.0.0.1:5060>");
        assert_eq!(resp.header("Content-Length"), resp.body.len().to_string());
        assert!(resp.body.contains("m=audio "));
        assert!(resp.body.contains(" RTP/AVP 0 101\r\n"));

        let session = h.dispatcher.sessions().get("call-1").await.unwrap();
        assert_eq!(
            session.media_target().await,
            Some("10.0.0.5:16384".parse().unwrap())
        );
        assert_eq!(session.state().await, CallState::ToneActive);

        // Answer points at the call's own media port
        let advertised = sdp::parse_remote_media(&resp.body, IpAddr::V4(Ipv4Addr::UNSPECIFIED)).unwrap();
        assert_eq!(advertised.port(), session.local_rtp_port());

        h.dispatcher.sessions().shutdown().await;
    }

    #[tokio::test]
    async fn test_reinvite_keeps_single_session() {
        let h = Harness::new(43300).await;
        let offer = "v=0\r\nm=audio 16384 RTP/AVP 0 101\r\n";
        let req = request("INVITE", "call-1", "", offer);

        let first = h.exchange(&req).await;
        let second = h.exchange(&req).await;

        assert_eq!(first.body, second.body);
        assert_eq!(h.dispatcher.sessions().active_calls().await.len(), 1);
        h.dispatcher.sessions().shutdown().await;
    }

    #[tokio::test]
    async fn test_bye_without_invite_still_ok() {
        let h = Harness::new(43400).await;
        let resp = h.exchange(&request("BYE", "never-invited", "", "")).await;

        assert_eq!(status(&resp), "SIP/2.0 200 OK");
        assert!(resp.header("To").ends_with(";tag=54321"));
        assert_eq!(resp.header("Call-ID"), "never-invited");
    }

    #[tokio::test]
    async fn test_bye_tears_down_call() {
        let h = Harness::new(43500).await;
        h.exchange(&request("INVITE", "call-1", "", "m=audio 16384 RTP/AVP 0\r\n")).await;
        let session = h.dispatcher.sessions().get("call-1").await.unwrap();

        let resp = h.exchange(&request("BYE", "call-1", "", "")).await;

        assert_eq!(status(&resp), "SIP/2.0 200 OK");
        assert_eq!(session.state().await, CallState::Terminated);
        assert!(session.cancel_token().is_cancelled());
        assert!(h.dispatcher.sessions().get("call-1").await.is_none());
    }

    #[tokio::test]
    async fn test_ack_and_unknown_methods_get_no_response() {
        let h = Harness::new(43600).await;

        h.dispatcher.handle(&request("ACK", "call-1", "", ""), h.phone_addr).await;
        h.expect_silence().await;

        h.dispatcher.handle(&request("SUBSCRIBE", "sub-1", "", ""), h.phone_addr).await;
        h.expect_silence().await;

        h.dispatcher.handle("SIP/2.0 200 OK\r\nCall-ID: x\r\n\r\n", h.phone_addr).await;
        h.expect_silence().await;
    }

    #[tokio::test]
    async fn test_invite_rejected_when_ports_exhausted() {
        let h = Harness::new(43700).await;
        // Occupy every even port in the harness range
        let mut held = Vec::new();
        for port in (43700..=43720).step_by(2) {
            if let Ok(socket) = UdpSocket::bind(("127.0.0.1", port)).await {
                held.push(socket);
            }
        }

        let resp = h.exchange(&request("INVITE", "call-x", "", "m=audio 16384 RTP/AVP 0\r\n")).await;

        assert_eq!(status(&resp), "SIP/2.0 503 Service Unavailable");
        assert!(h.dispatcher.sessions().get("call-x").await.is_none());
    }
}
