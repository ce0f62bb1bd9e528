use crate::traits::{Cookies, Headers, Result, WsmuxError};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{self, Uri};
use tracing::warn;

/// Local interface an outbound socket binds to before connecting
///
/// A server uses the address variant as its listen address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindInterface {
    /// Bind to a local IP address
    Address(IpAddr),
    /// Bind to a named network device (`SO_BINDTODEVICE`, Linux only)
    Device(String),
}

impl FromStr for BindInterface {
    type Err = std::convert::Infallible;

    /// An IP literal becomes `Address`, anything else a device name
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(BindInterface::from(s))
    }
}

impl From<IpAddr> for BindInterface {
    fn from(addr: IpAddr) -> Self {
        BindInterface::Address(addr)
    }
}

impl From<&str> for BindInterface {
    fn from(s: &str) -> Self {
        match s.parse::<IpAddr>() {
            Ok(addr) => BindInterface::Address(addr),
            Err(_) => BindInterface::Device(s.to_string()),
        }
    }
}

impl fmt::Display for BindInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindInterface::Address(addr) => write!(f, "{}", addr),
            BindInterface::Device(name) => write!(f, "{}", name),
        }
    }
}

/// Connection target and handshake extras
///
/// Mutated freely through the owner's setters; a clone is frozen when
/// `connect()`/`start()` begins, so later changes only affect the next
/// attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub(crate) scheme: String,
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
    pub(crate) path: String,
    pub(crate) protocol: Option<String>,
    pub(crate) headers: Headers,
    pub(crate) cookies: Cookies,
    pub(crate) interface: Option<BindInterface>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scheme: "ws".to_string(),
            host: "localhost".to_string(),
            port: None,
            path: "/".to_string(),
            protocol: None,
            headers: Headers::new(),
            cookies: Cookies::new(),
            interface: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace scheme, host, port and path from a `ws://` or `wss://` URL
    pub fn set_url(&mut self, url: &str) -> Result<()> {
        let uri: Uri = url
            .parse()
            .map_err(|e| WsmuxError::InvalidConfig(format!("invalid URL '{}': {}", url, e)))?;

        let scheme = uri
            .scheme_str()
            .ok_or_else(|| WsmuxError::InvalidConfig(format!("URL '{}' has no scheme", url)))?
            .to_ascii_lowercase();
        if scheme != "ws" && scheme != "wss" {
            return Err(WsmuxError::InvalidConfig(format!(
                "unsupported scheme '{}', expected ws or wss",
                scheme
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| WsmuxError::InvalidConfig(format!("URL '{}' has no host", url)))?;

        self.scheme = scheme;
        self.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        self.port = uri.port_u16();
        self.path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        Ok(())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, or the scheme default (80 for ws, 443 for wss)
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.is_secure() { 443 } else { 80 })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cookies(&self) -> &Cookies {
        &self.cookies
    }

    pub fn interface(&self) -> Option<&BindInterface> {
        self.interface.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "wss"
    }

    /// Full URL assembled from the parts
    pub fn url(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        match self.port {
            Some(port) => format!("{}://{}:{}{}", self.scheme, host, port, path),
            None => format!("{}://{}{}", self.scheme, host, path),
        }
    }

    /// Handshake request with headers, cookies and subprotocol attached
    ///
    /// Header names or values that are not valid HTTP are skipped with a warning.
    pub(crate) fn client_request(&self) -> Result<Request> {
        let url = self.url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| WsmuxError::InvalidConfig(format!("invalid request for '{}': {}", url, e)))?;

        let target = request.headers_mut();
        for (name, value) in self.headers.iter() {
            match (
                name.parse::<http::header::HeaderName>(),
                value.parse::<http::header::HeaderValue>(),
            ) {
                (Ok(name), Ok(value)) => {
                    target.insert(name, value);
                }
                (Err(_), _) => warn!("Invalid header name: {}", name),
                (_, Err(_)) => warn!("Invalid header value for key '{}': {}", name, value),
            }
        }

        if let Some(cookie) = self.cookies.header_value() {
            match cookie.parse::<http::header::HeaderValue>() {
                Ok(value) => {
                    target.insert(http::header::COOKIE, value);
                }
                Err(_) => warn!("Invalid cookie header: {}", cookie),
            }
        }

        if let Some(protocol) = &self.protocol {
            let value = protocol.parse::<http::header::HeaderValue>().map_err(|_| {
                WsmuxError::InvalidConfig(format!("invalid protocol name '{}'", protocol))
            })?;
            target.insert(http::header::SEC_WEBSOCKET_PROTOCOL, value);
        }

        Ok(request)
    }
}

/// Copy an `http::HeaderMap` into a [`Headers`] snapshot
///
/// Repeated names are joined with `", "`; non-UTF-8 values are skipped.
pub(crate) fn capture_headers(map: &http::HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for name in map.keys() {
        let values: Vec<&str> = map
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if !values.is_empty() {
            headers.insert(name.as_str(), values.join(", "));
        }
    }
    headers
}
