//! Handshake descriptors: the JSON carried in HANDSHAKE / DN_HANDSHAKE lines.
//!
//! Both shapes are fixed up front. Unknown fields are ignored and optional
//! fields default, so newer peers with extra fields still interoperate.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::DirectoryConfig;
use super::nick::{self, NickError};

/// Location string a peer uses when it accepts no inbound connections.
pub const NOT_SERVING: &str = "NOT-SERVING-ONION";

/// Application name both sides must agree on.
pub const APP_NAME: &str = "joinmarket";

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 5;

/// Client → directory descriptor (HANDSHAKE, 793).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHandshake {
    #[serde(rename = "app-name")]
    pub app_name: String,
    /// `true` when the sender is itself a directory. Must be `false` here.
    pub directory: bool,
    #[serde(rename = "location-string", default)]
    pub location: String,
    #[serde(rename = "proto-ver")]
    pub proto_ver: u32,
    #[serde(default)]
    pub features: serde_json::Map<String, serde_json::Value>,
    pub nick: String,
    #[serde(default)]
    pub network: String,
}

impl ClientHandshake {
    /// Descriptor for a client that serves no location.
    pub fn client(nick: &str, network: &str) -> Self {
        Self {
            app_name: APP_NAME.into(),
            directory: false,
            location: NOT_SERVING.into(),
            proto_ver: PROTOCOL_VERSION,
            features: serde_json::Map::new(),
            nick: nick.into(),
            network: network.into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The peer's reachable location, or `None` when it does not serve one.
    pub fn reachable_location(&self) -> Option<&str> {
        let loc = self.location.trim();
        if loc.is_empty() || loc == NOT_SERVING {
            None
        } else {
            Some(loc)
        }
    }

    /// Run every descriptor-level acceptance check, in order. Directory
    /// capacity and nick uniqueness are checked later against live state.
    pub fn check(&self, config: &DirectoryConfig) -> Result<(), RejectReason> {
        if self.directory {
            return Err(RejectReason::PeerIsDirectory);
        }
        if self.app_name != config.app_name {
            return Err(RejectReason::WrongApp(self.app_name.clone()));
        }
        if !(config.proto_ver_min..=config.proto_ver_max).contains(&self.proto_ver) {
            return Err(RejectReason::UnsupportedVersion(self.proto_ver));
        }
        if self.network != config.network {
            return Err(RejectReason::WrongNetwork(self.network.clone()));
        }
        let nick_check = if config.strict_nicks {
            config.nick_format.validate(&self.nick)
        } else {
            nick::validate_loose(&self.nick)
        };
        nick_check.map_err(RejectReason::BadNick)
    }
}

/// Directory → client descriptor (DN_HANDSHAKE, 795). `accepted` is
/// serialized last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryHandshake {
    #[serde(rename = "app-name")]
    pub app_name: String,
    pub directory: bool,
    #[serde(rename = "location-string", default)]
    pub location: String,
    #[serde(rename = "proto-ver-min")]
    pub proto_ver_min: u32,
    #[serde(rename = "proto-ver-max")]
    pub proto_ver_max: u32,
    #[serde(default)]
    pub features: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub nick: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub motd: String,
    pub accepted: bool,
}

impl DirectoryHandshake {
    pub fn from_config(config: &DirectoryConfig, accepted: bool) -> Self {
        Self {
            app_name: config.app_name.clone(),
            directory: true,
            location: config
                .location
                .clone()
                .unwrap_or_else(|| NOT_SERVING.to_string()),
            proto_ver_min: config.proto_ver_min,
            proto_ver_max: config.proto_ver_max,
            features: serde_json::Map::new(),
            nick: config.nick.clone(),
            network: config.network.clone(),
            motd: config.motd.clone(),
            accepted,
        }
    }

    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Malformed(String),
    PeerIsDirectory,
    WrongApp(String),
    UnsupportedVersion(u32),
    WrongNetwork(String),
    BadNick(NickError),
    DirectoryFull,
    DuplicateNick(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed descriptor: {e}"),
            Self::PeerIsDirectory => write!(f, "peer claims to be a directory"),
            Self::WrongApp(app) => write!(f, "unexpected app-name {app:?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
            Self::WrongNetwork(net) => write!(f, "wrong network {net:?}"),
            Self::BadNick(e) => write!(f, "invalid nick: {e}"),
            Self::DirectoryFull => write!(f, "directory is full"),
            Self::DuplicateNick(n) => write!(f, "nick {n} already registered"),
        }
    }
}
