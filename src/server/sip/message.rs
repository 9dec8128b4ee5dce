//! SIP message parsing and response formatting
//!
//! Deliberately minimal: one header map per message, exact-case names, no
//! folding, no compact forms. A repeated header keeps its last value.

use std::collections::HashMap;

use super::SipError;

/// Prefix that marks a status line
pub const SIP_VERSION: &str = "SIP/2.0";

/// Methods with a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Options,
}

impl SipMethod {
    /// Exact, case-sensitive match on the request method token
    pub fn parse(token: &str) -> Result<Self, SipError> {
        match token {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "OPTIONS" => Ok(SipMethod::Options),
            other => Err(SipError::UnsupportedMethod(other.to_string())),
        }
    }
}

impl std::fmt::Display for SipMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipMethod::Register => write!(f, "REGISTER"),
            SipMethod::Invite => write!(f, "INVITE"),
            SipMethod::Ack => write!(f, "ACK"),
            SipMethod::Bye => write!(f, "BYE"),
            SipMethod::Options => write!(f, "OPTIONS"),
        }
    }
}

/// First line of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// Request; `method` is the raw first token
    Request { method: String, uri: String },
    /// Response; the whole status line
    Status(String),
}

/// Parsed SIP datagram
#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl SipMessage {
    pub fn parse(text: &str) -> Result<Self, SipError> {
        let (head, body) = match text.find("\r\n\r\n") {
            Some(idx) => (&text[..idx], &text[idx + 4..]),
            None => match text.find("\n\n") {
                Some(idx) => (&text[..idx], &text[idx + 2..]),
                None => (text, ""),
            },
        };

        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));

        let first = lines
            .by_ref()
            .find(|l| !l.is_empty())
            .ok_or_else(|| SipError::MalformedMessage("empty message".to_string()))?;

        let start_line = if first.starts_with("SIP/") {
            StartLine::Status(first.to_string())
        } else {
            let mut parts = first.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let uri = parts.next().unwrap_or_default().to_string();
            StartLine::Request { method, uri }
        };

        Ok(Self {
            start_line,
            headers: parse_headers(lines),
            body: body.to_string(),
        })
    }

    /// Header value by exact name, empty when absent
    pub fn header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Status(_) => None,
        }
    }
}

/// `Name: value` per line; lines without a colon (or with an empty name) are skipped
fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for line in lines {
        let Some(colon) = line.find(':') else {
            tracing::debug!("Skipping header line without colon: {:?}", line);
            continue;
        };
        if colon == 0 {
            tracing::debug!("Skipping header line without name: {:?}", line);
            continue;
        }

        let name = &line[..colon];
        let value = &line[colon + 1..];
        let value = value.strip_prefix(' ').unwrap_or(value);

        headers.insert(name.to_string(), value.to_string());
    }

    headers
}

/// SIP response under construction
#[derive(Debug, Clone)]
pub struct SipResponse {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    content_type: Option<&'static str>,
    body: String,
}

impl SipResponse {
    pub fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            content_type: None,
            body: String::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    /// Echo the dialog-identifying headers of `request`, tagging `To`
    pub fn echo_dialog(self, request: &SipMessage, to_tag: &str) -> Self {
        self.header("Via", request.header("Via"))
            .header("From", request.header("From"))
            .header("To", format!("{};tag={}", request.header("To"), to_tag))
            .header("Call-ID", request.header("Call-ID"))
            .header("CSeq", request.header("CSeq"))
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, content_type: &'static str, body: String) -> Self {
        self.content_type = Some(content_type);
        self.body = body;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Wire form; Content-Length is the body's byte length
    pub fn render(&self) -> String {
        let mut out = format!("{} {} {}\r\n", SIP_VERSION, self.status, self.reason);

        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        if let Some(content_type) = self.content_type {
            out.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        out.push_str(&self.body);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:192.168.1.10 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bK-1\r\n\
        From: <sip:1001@192.168.1.10>;tag=abc\r\n\
        To: <sip:1001@192.168.1.10>\r\n\
        Call-ID: abc123\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:1001@10.0.0.9>\r\n\
        Expires: 60\r\n\
        Content-Length: 0\r\n\
        \r\n";

    #[test]
    fn test_parse_request() {
        let msg = SipMessage::parse(REGISTER).unwrap();

        assert_eq!(
            msg.start_line,
            StartLine::Request {
                method: "REGISTER".to_string(),
                uri: "sip:192.168.1.10".to_string()
            }
        );
        assert_eq!(msg.header("Via"), "SIP/2.0/UDP 192.168.1.20:5060;branch=z9hG4bK-1");
        assert_eq!(msg.header("Contact"), "<sip:1001@10.0.0.9>");
        assert_eq!(msg.header("CSeq"), "1 REGISTER");
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_header_names_are_case_sensitive() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        assert_eq!(msg.header("call-id"), "");
        assert_eq!(msg.header("Call-ID"), "abc123");
    }

    #[test]
    fn test_repeated_header_last_wins() {
        let text = "OPTIONS sip:x SIP/2.0\r\nVia: first\r\nVia: second\r\n\r\n";
        let msg = SipMessage::parse(text).unwrap();
        assert_eq!(msg.header("Via"), "second");
    }

    #[test]
    fn test_only_one_leading_space_trimmed() {
        let text = "OPTIONS sip:x SIP/2.0\r\nSubject:  two\r\nX-Tight:none\r\nbogus line\r\n\r\n";
        let msg = SipMessage::parse(text).unwrap();
        assert_eq!(msg.header("Subject"), " two");
        assert_eq!(msg.header("X-Tight"), "none");
        assert_eq!(msg.headers.len(), 2);
    }

    #[test]
    fn test_body_not_parsed_as_headers() {
        let text = "INVITE sip:x SIP/2.0\r\nCall-ID: c1\r\n\r\nv=0\r\na=rtpmap:0 PCMU/8000\r\n";
        let msg = SipMessage::parse(text).unwrap();
        assert_eq!(msg.header("a=rtpmap"), "");
        assert_eq!(msg.body, "v=0\r\na=rtpmap:0 PCMU/8000\r\n");
    }

    #[test]
    fn test_status_line() {
        let msg = SipMessage::parse("SIP/2.0 180 Ringing\r\nCall-ID: c1\r\n\r\n").unwrap();
        assert_eq!(msg.start_line, StartLine::Status("SIP/2.0 180 Ringing".to_string()));
        assert_eq!(msg.method(), None);
    }

    #[test]
    fn test_empty_message_rejected() {
        assert!(SipMessage::parse("").is_err());
        assert!(SipMessage::parse("\r\n\r\n").is_err());
    }

    #[test]
    fn test_method_classification() {
        assert_eq!(SipMethod::parse("INVITE").unwrap(), SipMethod::Invite);
        assert!(matches!(
            SipMethod::parse("invite"),
            Err(SipError::UnsupportedMethod(m)) if m == "invite"
        ));
        assert!(SipMethod::parse("SUBSCRIBE").is_err());
    }

    #[test]
    fn test_render_content_length_is_bytes() {
        let body = "s=Café\r\n".to_string();
        let text = SipResponse::ok()
            .header("Call-ID", "c1")
            .body("application/sdp", body.clone())
            .render();

        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(text.contains("Content-Type: application/sdp\r\n"));
        assert!(text.ends_with(&format!("\r\n\r\n{}", body)));
        assert_ne!(body.len(), body.chars().count());
    }
}
