//! Stream, route and connection descriptions exposed to filters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Structured value attached to routes, virtual hosts and streams
pub type Struct = serde_json::Map<String, serde_json::Value>;

/// Metadata namespaced by filter name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Per-filter structured metadata
    #[serde(default)]
    pub filter_metadata: BTreeMap<String, Struct>,
}

impl Metadata {
    /// Metadata for a filter namespace
    pub fn get(&self, filter: &str) -> Option<&Struct> {
        self.filter_metadata.get(filter)
    }

    /// Mutable metadata for a filter namespace, created when missing
    pub fn entry(&mut self, filter: &str) -> &mut Struct {
        self.filter_metadata.entry(filter.to_string()).or_default()
    }
}

/// Downstream protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// HTTP/1.0
    Http10,
    /// HTTP/1.1
    Http11,
    /// HTTP/2
    Http2,
    /// HTTP/3
    Http3,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http10 => write!(f, "HTTP/1.0"),
            Self::Http11 => write!(f, "HTTP/1.1"),
            Self::Http2 => write!(f, "HTTP/2"),
            Self::Http3 => write!(f, "HTTP/3"),
        }
    }
}

/// TLS details of a downstream connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConnectionInfo {
    /// Whether the peer presented a certificate
    pub peer_certificate_presented: bool,
    /// Whether the peer certificate was validated
    pub peer_certificate_validated: bool,
    /// Hex SHA-256 digest of the peer certificate
    pub sha256_peer_certificate_digest: String,
    /// Peer certificate subject
    pub subject_peer_certificate: String,
    /// Peer certificate serial number
    pub serial_number_peer_certificate: String,
    /// Negotiated TLS version
    pub tls_version: String,
    /// Negotiated cipher suite
    pub ciphersuite: String,
}

/// Virtual host matched for the stream
#[derive(Debug, Clone, Default)]
pub struct VirtualHost {
    /// Virtual host name
    pub name: String,
    /// Virtual host metadata
    pub metadata: Metadata,
}

/// Route matched for the stream
#[derive(Debug, Clone, Default)]
pub struct RouteEntry {
    /// Route name
    pub name: String,
    /// Route metadata
    pub metadata: Metadata,
    /// Owning virtual host
    pub virtual_host: Option<Arc<VirtualHost>>,
}

/// Per-stream information owned by the proxy
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    /// Downstream protocol
    pub protocol: Option<Protocol>,
    /// Local address of the downstream connection
    pub downstream_local_address: Option<SocketAddr>,
    /// Remote address, possibly derived from forwarding headers
    pub downstream_remote_address: Option<SocketAddr>,
    /// Directly connected remote address
    pub downstream_direct_remote_address: Option<SocketAddr>,
    /// SNI requested by the downstream
    pub requested_server_name: Option<String>,
    /// Downstream TLS details
    pub downstream_ssl: Option<SslConnectionInfo>,
    /// Matched route
    pub route: Option<Arc<RouteEntry>>,
    /// Metadata written by filters while the stream is processed
    pub dynamic_metadata: Metadata,
}

impl StreamInfo {
    /// Name of the matched route, empty when unrouted
    pub fn route_name(&self) -> &str {
        self.route.as_ref().map(|r| r.name.as_str()).unwrap_or("")
    }

    /// Virtual host of the matched route
    pub fn virtual_host(&self) -> Option<&VirtualHost> {
        self.route.as_ref()?.virtual_host.as_deref()
    }
}

/// Downstream network connection
#[derive(Debug, Clone, Default)]
pub struct Connection {
    /// Connection identifier
    pub id: u64,
    /// TLS details when the connection is secure
    pub ssl: Option<SslConnectionInfo>,
    /// Connection-level stream info
    pub stream_info: StreamInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_entry_creates_namespace() {
        let mut metadata = Metadata::default();
        metadata
            .entry("octopus.filters.http.script")
            .insert("foo".to_string(), json!("bar"));

        let ns = metadata.get("octopus.filters.http.script").unwrap();
        assert_eq!(ns.get("foo"), Some(&json!("bar")));
        assert!(metadata.get("other").is_none());
    }

    #[test]
    fn test_route_name_and_virtual_host() {
        let mut info = StreamInfo::default();
        assert_eq!(info.route_name(), "");
        assert!(info.virtual_host().is_none());

        info.route = Some(Arc::new(RouteEntry {
            name: "api".to_string(),
            metadata: Metadata::default(),
            virtual_host: Some(Arc::new(VirtualHost {
                name: "vhost".to_string(),
                metadata: Metadata::default(),
            })),
        }));
        assert_eq!(info.route_name(), "api");
        assert_eq!(info.virtual_host().unwrap().name, "vhost");
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Http11.to_string(), "HTTP/1.1");
        assert_eq!(Protocol::Http2.to_string(), "HTTP/2");
    }
}
