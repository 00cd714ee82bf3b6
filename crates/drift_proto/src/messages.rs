//! JSON messages exchanged between proxies and the broker.
//!
//! Version 1.x of the proxy-broker protocol:
//!
//! - `POST /proxy` body: `{Sid, Version, Type, NAT}`
//! - `POST /proxy` response: `{Status: "client match", Offer, NAT}` or
//!   `{Status: "no match"}`
//! - `POST /answer` body: `{Sid, Version, Answer}`
//! - `POST /answer` response: `{Status: "success"}` or
//!   `{Status: "client gone"}`
//!
//! The client side sends its offer as an opaque body and is not versioned
//! here. Unknown `Type` and `NAT` strings map to their `Unknown` variants
//! rather than failing the request.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    #[error("missing session id")]
    MissingSid,
    #[error("missing answer")]
    MissingAnswer,
}

/// NAT class a peer last reported for itself.
///
/// Unrestricted clients can use any proxy; restricted and unknown clients
/// need an unrestricted proxy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatClass {
    #[default]
    Unknown,
    Restricted,
    Unrestricted,
}

impl NatClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatClass::Unknown => "unknown",
            NatClass::Restricted => "restricted",
            NatClass::Unrestricted => "unrestricted",
        }
    }

    /// Parse a header or message value, defaulting to unknown.
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "restricted" => NatClass::Restricted,
            "unrestricted" => NatClass::Unrestricted,
            _ => NatClass::Unknown,
        }
    }
}

impl Serialize for NatClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for NatClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(NatClass::from_str_lossy(&value))
    }
}

/// How the volunteer proxy is hosted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Standalone,
    Badge,
    Webext,
    Mobile,
    #[default]
    Unknown,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Standalone => "standalone",
            ProxyType::Badge => "badge",
            ProxyType::Webext => "webext",
            ProxyType::Mobile => "mobile",
            ProxyType::Unknown => "unknown",
        }
    }

    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "standalone" => ProxyType::Standalone,
            "badge" => ProxyType::Badge,
            "webext" => ProxyType::Webext,
            "mobile" => ProxyType::Mobile,
            _ => ProxyType::Unknown,
        }
    }
}

impl Serialize for ProxyType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProxyType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(ProxyType::from_str_lossy(&value))
    }
}

fn check_version(version: &str) -> Result<(), MessageError> {
    let major = version.split('.').next().unwrap_or("");
    if major == "1" {
        Ok(())
    } else {
        Err(MessageError::UnsupportedVersion(version.to_string()))
    }
}

/// Body of `POST /proxy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPollRequest {
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Type", default)]
    pub proxy_type: ProxyType,
    #[serde(rename = "NAT", default)]
    pub nat: NatClass,
}

impl ProxyPollRequest {
    /// Version 1.x requires a non-empty Sid.
    pub fn validate(&self) -> Result<(), MessageError> {
        check_version(&self.version)?;
        if self.sid.is_empty() {
            return Err(MessageError::MissingSid);
        }
        Ok(())
    }
}

/// Body of the `POST /proxy` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPollResponse {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Offer", default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    #[serde(rename = "NAT", default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatClass>,
}

impl ProxyPollResponse {
    pub fn client_match(offer: String, nat: NatClass) -> Self {
        Self {
            status: "client match".into(),
            offer: Some(offer),
            nat: Some(nat),
        }
    }

    pub fn no_match() -> Self {
        Self {
            status: "no match".into(),
            offer: None,
            nat: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.status == "client match"
    }
}

/// Body of `POST /answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAnswerRequest {
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Answer")]
    pub answer: String,
}

impl ProxyAnswerRequest {
    pub fn validate(&self) -> Result<(), MessageError> {
        check_version(&self.version)?;
        if self.sid.is_empty() {
            return Err(MessageError::MissingSid);
        }
        if self.answer.is_empty() {
            return Err(MessageError::MissingAnswer);
        }
        Ok(())
    }
}

/// Body of the `POST /answer` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAnswerResponse {
    #[serde(rename = "Status")]
    pub status: String,
}

impl ProxyAnswerResponse {
    pub fn success() -> Self {
        Self {
            status: "success".into(),
        }
    }

    pub fn client_gone() -> Self {
        Self {
            status: "client gone".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_request_roundtrip() {
        let req = ProxyPollRequest {
            sid: "abc123".into(),
            version: "1.2".into(),
            proxy_type: ProxyType::Standalone,
            nat: NatClass::Unrestricted,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"Sid\":\"abc123\""));
        assert!(json.contains("\"NAT\":\"unrestricted\""));

        let back: ProxyPollRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sid, "abc123");
        assert_eq!(back.nat, NatClass::Unrestricted);
        back.validate().unwrap();
    }

    #[test]
    fn poll_request_rejects_wrong_major_version() {
        let req = ProxyPollRequest {
            sid: "abc".into(),
            version: "2.0".into(),
            proxy_type: ProxyType::Badge,
            nat: NatClass::Unknown,
        };
        assert_eq!(
            req.validate(),
            Err(MessageError::UnsupportedVersion("2.0".into()))
        );
    }

    #[test]
    fn poll_request_requires_sid() {
        let req = ProxyPollRequest {
            sid: String::new(),
            version: "1.0".into(),
            proxy_type: ProxyType::Webext,
            nat: NatClass::Unknown,
        };
        assert_eq!(req.validate(), Err(MessageError::MissingSid));
    }

    #[test]
    fn unknown_nat_and_type_default_to_unknown() {
        let req: ProxyPollRequest = serde_json::from_str(
            r#"{"Sid":"s","Version":"1.2","Type":"fridge","NAT":"symmetric-ish"}"#,
        )
        .unwrap();
        assert_eq!(req.proxy_type, ProxyType::Unknown);
        assert_eq!(req.nat, NatClass::Unknown);

        let req: ProxyPollRequest =
            serde_json::from_str(r#"{"Sid":"s","Version":"1.2"}"#).unwrap();
        assert_eq!(req.nat, NatClass::Unknown);
    }

    #[test]
    fn poll_response_status_strings() {
        let matched =
            serde_json::to_string(&ProxyPollResponse::client_match("sdp".into(), NatClass::Restricted))
                .unwrap();
        assert!(matched.contains("\"Status\":\"client match\""));
        assert!(matched.contains("\"Offer\":\"sdp\""));

        let missed = serde_json::to_string(&ProxyPollResponse::no_match()).unwrap();
        assert!(missed.contains("\"Status\":\"no match\""));
        assert!(!missed.contains("Offer"));
    }

    #[test]
    fn answer_request_validation() {
        let ok = ProxyAnswerRequest {
            sid: "s".into(),
            version: "1.1".into(),
            answer: "sdp-answer".into(),
        };
        ok.validate().unwrap();

        let no_answer = ProxyAnswerRequest {
            answer: String::new(),
            ..ok.clone()
        };
        assert_eq!(no_answer.validate(), Err(MessageError::MissingAnswer));

        let no_sid = ProxyAnswerRequest {
            sid: String::new(),
            ..ok
        };
        assert_eq!(no_sid.validate(), Err(MessageError::MissingSid));
    }

    #[test]
    fn answer_response_status_strings() {
        assert_eq!(ProxyAnswerResponse::success().status, "success");
        assert_eq!(ProxyAnswerResponse::client_gone().status, "client gone");
    }
}
