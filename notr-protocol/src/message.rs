//! JSON message bodies exchanged over the tunnel

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddrV4;

use serde::{Deserialize, Serialize};

use crate::{Result, MAX_BODY_LEN};

/// Client authentication request, the body of the first `auth` frame
///
/// Port maps are keyed by the broker-side published port and valued by
/// the client-side port on the VIP. A zero `http`/`https`/`grpc` port
/// means the client exposes no such service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    #[serde(default)]
    pub key: String,

    /// Requested domain; the broker generates one when empty
    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub http: u16,

    #[serde(default)]
    pub https: u16,

    #[serde(default)]
    pub grpc: u16,

    #[serde(default)]
    pub tcps: BTreeMap<u16, u16>,

    #[serde(default)]
    pub udps: BTreeMap<u16, u16>,
}

impl AuthRequest {
    /// Create a request carrying only the shared key
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Broker reply to a successful authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthReply {
    /// Assigned (or echoed) domain
    pub domain: String,
    /// Assigned virtual IP
    pub vip: String,
    /// Overlay network in CIDR notation
    pub gateway: String,
}

impl AuthReply {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Transport protocol of a forwarding stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowProtocol::Tcp => write!(f, "tcp"),
            FlowProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// First record on every forwarding stream
///
/// Ports travel as decimal strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub protocol: FlowProtocol,

    #[serde(rename = "srcIP")]
    pub src_ip: String,

    #[serde(rename = "srcPort")]
    pub src_port: String,

    #[serde(rename = "dstIP")]
    pub dst_ip: String,

    #[serde(rename = "dstPort")]
    pub dst_port: String,
}

impl FlowDescriptor {
    /// Describe a flow from `src` (the true peer) to `dst`
    pub fn new(protocol: FlowProtocol, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            protocol,
            src_ip: src.ip().to_string(),
            src_port: src.port().to_string(),
            dst_ip: dst.ip().to_string(),
            dst_port: dst.port().to_string(),
        }
    }

    /// Encode as `[len:u16 BE][json]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_BODY_LEN {
            return Err(crate::Error::BodyTooLarge(json.len()));
        }

        let mut buf = Vec::with_capacity(2 + json.len());
        buf.extend_from_slice(&(json.len() as u16).to_be_bytes());
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    /// Parse the JSON part of a descriptor record
    pub fn from_json(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_auth_request_wire_names() {
        let body = br#"{"key":"k","domain":"","http":8080,"https":0,"grpc":0,"tcps":{"2222":22},"udps":{"5353":53}}"#;
        let req = AuthRequest::from_json(body).unwrap();
        assert_eq!(req.key, "k");
        assert_eq!(req.http, 8080);
        assert_eq!(req.tcps.get(&2222), Some(&22));
        assert_eq!(req.udps.get(&5353), Some(&53));
    }

    #[test]
    fn test_auth_request_missing_fields_default() {
        let req = AuthRequest::from_json(br#"{"key":"only"}"#).unwrap();
        assert_eq!(req, AuthRequest::new("only"));
    }

    #[test]
    fn test_auth_reply_json() {
        let reply = AuthReply {
            domain: "abc.notr.io".into(),
            vip: "100.64.0.2".into(),
            gateway: "100.64.0.0/24".into(),
        };
        let value: serde_json::Value = serde_json::from_slice(&reply.to_json().unwrap()).unwrap();
        assert_eq!(value["vip"], "100.64.0.2");
        assert_eq!(value["gateway"], "100.64.0.0/24");
        assert_eq!(value["domain"], "abc.notr.io");
    }

    #[test]
    fn test_flow_descriptor_encoding() {
        let desc = FlowDescriptor::new(
            FlowProtocol::Udp,
            SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5555),
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 53),
        );
        let wire = desc.encode().unwrap();
        let len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(len, wire.len() - 2);

        let value: serde_json::Value = serde_json::from_slice(&wire[2..]).unwrap();
        assert_eq!(value["protocol"], "udp");
        assert_eq!(value["srcIP"], "1.2.3.4");
        assert_eq!(value["srcPort"], "5555");
        assert_eq!(value["dstIP"], "127.0.0.1");
        assert_eq!(value["dstPort"], "53");
    }
}
