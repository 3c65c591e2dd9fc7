//! Message envelope and the closed set of message kinds.
//!
//! Every frame on the wire is a JSON object `{"type": <code>, "line": <text>}`.
//! The numeric code is mapped onto [`MessageKind`] at decode time; a code
//! outside the table never makes it past the codec.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The nine message kinds of the directory protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Unicast application message, `from!to!cmd args...`.
    PrivMsg,
    /// Broadcast application message, `from!PUBLIC!cmd args...`.
    PubMsg,
    /// Directory → peer: `nick;location,nick;location,...`.
    PeerList,
    /// Peer → directory: request the peer list.
    GetPeerList,
    /// Peer → directory: client descriptor.
    Handshake,
    /// Directory → peer: directory descriptor with `accepted`.
    DnHandshake,
    Ping,
    Pong,
    Disconnect,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::PrivMsg,
        MessageKind::PubMsg,
        MessageKind::PeerList,
        MessageKind::GetPeerList,
        MessageKind::Handshake,
        MessageKind::DnHandshake,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Disconnect,
    ];

    /// Numeric wire code.
    pub fn code(self) -> u16 {
        match self {
            Self::PrivMsg => 685,
            Self::PubMsg => 687,
            Self::PeerList => 789,
            Self::GetPeerList => 791,
            Self::Handshake => 793,
            Self::DnHandshake => 795,
            Self::Ping => 797,
            Self::Pong => 799,
            Self::Disconnect => 801,
        }
    }

    /// Map a wire code back to a kind. `None` for anything outside the table.
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| i64::from(k.code()) == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PrivMsg => "PRIVMSG",
            Self::PubMsg => "PUBMSG",
            Self::PeerList => "PEERLIST",
            Self::GetPeerList => "GETPEERLIST",
            Self::Handshake => "HANDSHAKE",
            Self::DnHandshake => "DN_HANDSHAKE",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Kinds only a directory may send. A peer sending one of these is
    /// misbehaving.
    pub fn is_directory_only(self) -> bool {
        matches!(self, Self::PeerList | Self::DnHandshake | Self::Pong)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub line: String,
}

/// Borrowed wire shape used for encoding. Field order is fixed so a
/// forwarded envelope serializes to the same bytes every time.
#[derive(Serialize)]
pub(crate) struct WireOut<'a> {
    #[serde(rename = "type")]
    pub kind: u16,
    pub line: &'a str,
}

/// Owned wire shape used for decoding. `type` must be a JSON integer and
/// `line` a JSON string; extra fields are ignored.
#[derive(Deserialize)]
pub(crate) struct WireIn {
    #[serde(rename = "type")]
    pub kind: i64,
    pub line: String,
}

impl Envelope {
    pub fn new(kind: MessageKind, line: impl Into<String>) -> Self {
        Self {
            kind,
            line: line.into(),
        }
    }

    /// Envelope with an empty `line` (GETPEERLIST, PING, PONG, DISCONNECT).
    pub fn bare(kind: MessageKind) -> Self {
        Self::new(kind, String::new())
    }

    pub fn privmsg(line: impl Into<String>) -> Self {
        Self::new(MessageKind::PrivMsg, line)
    }

    pub fn pubmsg(line: impl Into<String>) -> Self {
        Self::new(MessageKind::PubMsg, line)
    }

    pub fn peerlist(line: impl Into<String>) -> Self {
        Self::new(MessageKind::PeerList, line)
    }

    /// Serialize to the JSON text of one frame (without the terminator).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireOut {
            kind: self.kind.code(),
            line: &self.line,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.kind, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn codes_match_protocol_table() {
        let table: Vec<(u16, &str)> = MessageKind::ALL
            .iter()
            .map(|k| (k.code(), k.name()))
            .collect();
        assert_eq!(
            table,
            vec![
                (685, "PRIVMSG"),
                (687, "PUBMSG"),
                (789, "PEERLIST"),
                (791, "GETPEERLIST"),
                (793, "HANDSHAKE"),
                (795, "DN_HANDSHAKE"),
                (797, "PING"),
                (799, "PONG"),
                (801, "DISCONNECT"),
            ]
        );
    }

    #[test]
    fn from_code_is_exact() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_code(i64::from(kind.code())), Some(kind));
        }
        assert_eq!(MessageKind::from_code(686), None);
        assert_eq!(MessageKind::from_code(0), None);
        assert_eq!(MessageKind::from_code(-685), None);
    }

    #[test]
    fn json_field_order_is_type_then_line() {
        let env = Envelope::peerlist("J5Maker1;onion1.onion:5222");
        assert_eq!(
            env.to_json().unwrap(),
            r#"{"type":789,"line":"J5Maker1;onion1.onion:5222"}"#
        );
    }

    #[test]
    fn json_escapes_embedded_json() {
        let env = Envelope::new(MessageKind::Handshake, r#"{"a":1}"#);
        assert_eq!(env.to_json().unwrap(), r#"{"type":793,"line":"{\"a\":1}"}"#);
    }

    #[test]
    fn directory_only_kinds() {
        let only: Vec<_> = MessageKind::ALL
            .into_iter()
            .filter(|k| k.is_directory_only())
            .collect();
        assert_eq!(
            only,
            vec![MessageKind::PeerList, MessageKind::DnHandshake, MessageKind::Pong]
        );
    }
}
