use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use thiserror::Error;

const DATA_VERSION_V1: u32 = 1;
const DATA_VERSION_V2: u32 = 2;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed scan payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid response bytes: {0}")]
    ResponseBytes(#[from] base64::DecodeError),
    #[error("unrecognized data version {0}")]
    UnrecognizedVersion(u32),
}

/// One observation of one service on one endpoint at one time. The versioned
/// wire payload is already projected down to a single response string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub ip: IpAddr,
    pub port: u16,
    pub service: String,
    pub timestamp: i64,
    pub response: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ip: IpAddr,
    port: u16,
    service: String,
    timestamp: i64,
    data_version: u32,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct V1Data {
    response_bytes_utf8: String,
}

#[derive(Debug, Deserialize)]
struct V2Data {
    response_str: String,
}

impl Scan {
    /// Decode one raw transport payload. Pure; the caller decides what to do
    /// with a failure.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(payload)?;

        let response = match envelope.data_version {
            DATA_VERSION_V1 => {
                let data: V1Data = serde_json::from_value(envelope.data)?;
                let bytes = BASE64.decode(data.response_bytes_utf8)?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            DATA_VERSION_V2 => {
                let data: V2Data = serde_json::from_value(envelope.data)?;
                data.response_str
            }
            other => return Err(DecodeError::UnrecognizedVersion(other)),
        };

        Ok(Self {
            ip: envelope.ip,
            port: envelope.port,
            service: envelope.service,
            timestamp: envelope.timestamp,
            response,
        })
    }

    /// Identity key for the (ip, port, service) triple, shared with the
    /// ordering cache key format.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.ip, self.port, self.service)
    }

    pub fn last_seen(&self) -> NaiveDateTime {
        DateTime::from_timestamp(self.timestamp, 0)
            .unwrap_or(DateTime::UNIX_EPOCH)
            .naive_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;

    #[test]
    fn decodes_version_two_response_verbatim() {
        let payload = json!({
            "ip": "1.1.1.1",
            "port": 53,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 2,
            "data": { "response_str": "service response: 111" }
        });

        let scan = Scan::decode(payload.to_string().as_bytes()).unwrap();
        assert_eq!(scan.ip, "1.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(scan.port, 53);
        assert_eq!(scan.service, "DNS");
        assert_eq!(scan.timestamp, 1737072000);
        assert_eq!(scan.response, "service response: 111");
    }

    #[test]
    fn decodes_version_one_bytes_as_utf8() {
        let payload = json!({
            "ip": "1.1.1.1",
            "port": 53,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 1,
            "data": { "response_bytes_utf8": BASE64.encode("service response: 222") }
        });

        let scan = Scan::decode(payload.to_string().as_bytes()).unwrap();
        assert_eq!(scan.response, "service response: 222");
    }

    #[test]
    fn decodes_ipv6_endpoints() {
        let payload = json!({
            "ip": "2606:4700:4700::1111",
            "port": 853,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 2,
            "data": { "response_str": "ok" }
        });

        let scan = Scan::decode(payload.to_string().as_bytes()).unwrap();
        assert!(scan.ip.is_ipv6());
        assert_eq!(scan.key(), "2606:4700:4700::1111-853-DNS");
    }

    #[test]
    fn rejects_unrecognized_data_version() {
        let payload = json!({
            "ip": "1.1.1.1",
            "port": 53,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 99,
            "data": { "response_str": "whatever" }
        });

        let err = Scan::decode(payload.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::UnrecognizedVersion(99)));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            Scan::decode(b"not json at all"),
            Err(DecodeError::Malformed(_))
        ));

        // missing the data subtree entirely
        let payload = json!({
            "ip": "1.1.1.1",
            "port": 53,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 2
        });
        assert!(matches!(
            Scan::decode(payload.to_string().as_bytes()),
            Err(DecodeError::Malformed(_))
        ));

        // version 1 shape under a version 2 tag
        let payload = json!({
            "ip": "1.1.1.1",
            "port": 53,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 2,
            "data": { "response_bytes_utf8": "aGk=" }
        });
        assert!(matches!(
            Scan::decode(payload.to_string().as_bytes()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_invalid_base64_response_bytes() {
        let payload = json!({
            "ip": "1.1.1.1",
            "port": 53,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 1,
            "data": { "response_bytes_utf8": "!!not base64!!" }
        });

        assert!(matches!(
            Scan::decode(payload.to_string().as_bytes()),
            Err(DecodeError::ResponseBytes(_))
        ));
    }

    #[test]
    fn last_seen_converts_epoch_seconds() {
        let payload = json!({
            "ip": "1.1.1.1",
            "port": 53,
            "service": "DNS",
            "timestamp": 1737072000,
            "data_version": 2,
            "data": { "response_str": "ok" }
        });

        let scan = Scan::decode(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            scan.last_seen(),
            DateTime::from_timestamp(1737072000, 0).unwrap().naive_utc()
        );
    }
}
