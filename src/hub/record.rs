//! Broadcast records.
//!
//! A record is the labeled text `"<address>: <payload>"`. On the wire it is
//! sent as a JSON string literal, so clients receive
//! `"\"127.0.0.1: hello\""` for a `hello` sent from localhost.

use std::fmt;
use std::net::IpAddr;
use tokio_tungstenite::tungstenite::Message;

/// Labeled text built from one inbound client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRecord(String);

impl BroadcastRecord {
    pub fn new(origin: IpAddr, payload: &str) -> Self {
        Self(format!("{origin}: {payload}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON string encoding of the record.
    pub fn encode(&self) -> String {
        serde_json::Value::from(self.as_str()).to_string()
    }

    /// Text frame carrying the encoded record.
    ///
    /// Cloning the returned frame shares the underlying buffer.
    pub fn to_frame(&self) -> Message {
        Message::text(self.encode())
    }
}

impl fmt::Display for BroadcastRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text view of an inbound data frame.
///
/// Binary payloads are decoded lossily. Control frames yield `None`.
pub fn payload_text(msg: &Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.as_str().to_owned()),
        Message::Binary(data) => Some(String::from_utf8_lossy(data).into_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_record_label() {
        let record = BroadcastRecord::new(LOCALHOST, "hello");
        assert_eq!(record.as_str(), "127.0.0.1: hello");
        assert_eq!(record.to_string(), "127.0.0.1: hello");
    }

    #[test]
    fn test_encode_wraps_in_json_string() {
        let record = BroadcastRecord::new(LOCALHOST, "hello");
        assert_eq!(record.encode(), "\"127.0.0.1: hello\"");
    }

    #[test]
    fn test_encode_escapes() {
        let record = BroadcastRecord::new(LOCALHOST, "say \"hi\"\n");
        assert_eq!(record.encode(), r#""127.0.0.1: say \"hi\"\n""#);
    }

    #[test]
    fn test_empty_payload() {
        let record = BroadcastRecord::new(LOCALHOST, "");
        assert_eq!(record.encode(), "\"127.0.0.1: \"");
    }

    #[test]
    fn test_frame_is_text() {
        let frame = BroadcastRecord::new(LOCALHOST, "x").to_frame();
        assert!(frame.is_text());
        assert_eq!(frame.to_text().unwrap(), "\"127.0.0.1: x\"");
    }

    #[test]
    fn test_payload_text() {
        assert_eq!(payload_text(&Message::text("ping")).as_deref(), Some("ping"));
        assert_eq!(
            payload_text(&Message::binary(vec![b'o', b'k', 0xff])).as_deref(),
            Some("ok\u{fffd}")
        );
        assert_eq!(payload_text(&Message::Ping(Default::default())), None);
    }
}
