//! Client identity resolution.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::config::TokenScope;

/// Identity used when a request carries no usable address at all.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Which limit/window pair applies to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitClass {
    /// No token was presented.
    Anonymous,
    /// A token was presented.
    Token,
}

impl fmt::Display for LimitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitClass::Anonymous => f.write_str("anonymous"),
            LimitClass::Token => f.write_str("token"),
        }
    }
}

/// The caller as seen by the limiter: a source address plus an optional
/// token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    address: String,
    token: Option<String>,
}

impl ClientIdentity {
    /// Build an identity from a raw address string.
    ///
    /// The address is normalized with [`normalize_address`]; an empty or
    /// whitespace-only token counts as no token.
    pub fn new(address: &str, token: Option<&str>) -> Self {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        Self {
            address: normalize_address(address),
            token,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// The limit class selected by the presence of a token.
    pub fn limit_class(&self) -> LimitClass {
        if self.token.is_some() {
            LimitClass::Token
        } else {
            LimitClass::Anonymous
        }
    }

    /// Key the client's counter is stored under.
    ///
    /// Anonymous clients are keyed by address. Token-bearing clients are
    /// keyed by address and token, or by the token alone when tokens are
    /// scoped across addresses. Each form has its own prefix and the address
    /// is escaped, so no two identities map to the same key whatever text
    /// the address or token holds.
    pub fn storage_key(&self, scope: TokenScope) -> String {
        match (&self.token, scope) {
            (None, _) => format!("ip:{}", escape_key_part(&self.address)),
            (Some(token), TokenScope::Address) => {
                format!("ip+tok:{}|{}", escape_key_part(&self.address), token)
            }
            (Some(token), TokenScope::Token) => format!("tok:{}", token),
        }
    }
}

/// Escape `\` and `|` so the address part of a key ends at the first bare `|`.
fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if matches!(c, '\\' | '|') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Reduce a peer address to its host part.
///
/// Accepts `ip:port`, `[v6]:port`, bare IPs and `host:port`. Anything that
/// does not parse is returned trimmed but otherwise unchanged, so every
/// request still maps to a stable identity.
pub fn normalize_address(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return UNKNOWN_CLIENT.to_string();
    }

    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return ip.to_string();
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.split(']').next()) {
        if let Ok(ip) = inner.parse::<IpAddr>() {
            return ip.to_string();
        }
    }
    if let Some((host, port)) = raw.rsplit_once(':') {
        if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() {
            return host.to_string();
        }
    }

    raw.to_string()
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address, self.limit_class())
    }
}
