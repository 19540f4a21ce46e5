use base64::engine::general_purpose;
use base64::Engine;
use http::HeaderValue;

/// Username/password pair used for inbound SOCKS5 auth and upstream Basic auth
#[derive(Clone, PartialEq, Eq)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Credentials for SOCKS5 clients: both parts must be non-empty.
    pub fn socks(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => {
                Some(Self::new(u.to_string(), p.to_string()))
            }
            _ => None,
        }
    }

    /// Credentials for an upstream proxy: a non-empty username is enough,
    /// the password may be empty.
    pub fn upstream(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match username {
            Some(u) if !u.is_empty() => Some(Self::new(
                u.to_string(),
                password.unwrap_or_default().to_string(),
            )),
            _ => None,
        }
    }

    /// Value for a `Proxy-Authorization` header
    pub fn basic_header(&self) -> Result<HeaderValue, http::header::InvalidHeaderValue> {
        let encoded =
            general_purpose::STANDARD.encode(format!("{}:{}", self.username, self.password));
        HeaderValue::from_str(&format!("Basic {}", encoded))
    }

    /// Check a SOCKS5 username/password sub-negotiation attempt
    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        self.username.as_bytes() == username && self.password.as_bytes() == password
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
