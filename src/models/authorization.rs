use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GateError, Result};

/// Template written when the authorizations file does not exist yet
pub const AUTHORIZATIONS_TEMPLATE: &str = "# write authorizations here\n\n\n";

/// Opaque token identifying one permitted tunnel identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationRecord(String);

impl AuthorizationRecord {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened token suitable for log lines
    pub fn redacted(&self) -> String {
        let visible: String = self.0.chars().take(6).collect();
        if visible.len() < self.0.len() {
            format!("{}…", visible)
        } else {
            visible
        }
    }
}

impl std::fmt::Display for AuthorizationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.redacted())
    }
}

/// Parse tokens one per line, dropping blank and `#` lines.
///
/// Order is preserved and duplicates are kept.
pub fn parse_authorizations(content: &str) -> Vec<AuthorizationRecord> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(AuthorizationRecord::new)
        .collect()
}

/// Create the authorizations file from the template if it does not exist
pub async fn ensure_authorizations_file(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| GateError::from_write(parent, e))?;
    }

    tokio::fs::write(path, AUTHORIZATIONS_TEMPLATE)
        .await
        .map_err(|e| GateError::from_write(path, e))?;

    info!("Created {}", path.display());
    Ok(())
}

/// Load the authorizations file; an empty result is fatal
pub async fn load_authorizations(path: &Path) -> Result<Vec<AuthorizationRecord>> {
    let content = tokio::fs::read_to_string(path).await?;
    let records = parse_authorizations(&content);

    if records.is_empty() {
        return Err(GateError::MissingAuthorizations {
            path: path.to_path_buf(),
        });
    }

    debug!("Loaded {} authorizations from {}", records.len(), path.display());
    Ok(records)
}
