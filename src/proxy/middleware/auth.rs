//! SOCKS5 username/password authentication for the rotator front.

use tracing::{debug, warn};

use crate::error::{GateError, Result};

/// Credential check for inbound rotator connections
#[derive(Clone)]
pub struct SocksAuth {
    /// Expected username
    username: String,
    /// Expected password
    password: String,
}

impl SocksAuth {
    /// Create a new auth handler for one credential pair
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Validate the raw RFC 1929 fields
    pub fn validate(&self, username: &[u8], password: &[u8]) -> Result<()> {
        let user = String::from_utf8_lossy(username);

        if username == self.username.as_bytes() && password == self.password.as_bytes() {
            debug!("SOCKS5 authentication successful for user: {}", user);
            Ok(())
        } else {
            warn!("SOCKS5 authentication failed for user: {}", user);
            Err(GateError::AuthenticationFailed)
        }
    }
}

impl std::fmt::Debug for SocksAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocksAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}
