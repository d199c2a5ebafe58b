//! Static shared-secret authorization.

use crate::config::Config;
use crate::error::{DataApiError, Result};
use std::fmt;

/// A single capability granted to a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
}

/// Capabilities granted by a credential: `{read}` or `{read, write}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    read: bool,
    write: bool,
}

impl Permissions {
    pub const READ_ONLY: Permissions = Permissions {
        read: true,
        write: false,
    };

    pub const READ_WRITE: Permissions = Permissions {
        read: true,
        write: true,
    };

    pub fn contains(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Write => self.write,
        }
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.write {
            write!(f, "read-write")
        } else {
            write!(f, "read-only")
        }
    }
}

/// Maps a presented api-key to a permission set
#[derive(Clone)]
pub struct AuthGate {
    read_only: Option<String>,
    read_write: Option<String>,
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("read_only", &self.read_only.is_some())
            .field("read_write", &self.read_write.is_some())
            .finish()
    }
}

impl AuthGate {
    pub fn new(read_only: Option<String>, read_write: Option<String>) -> Self {
        Self {
            read_only: read_only.filter(|k| !k.is_empty()),
            read_write: read_write.filter(|k| !k.is_empty()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.read_only.clone(), config.read_write.clone())
    }

    /// Whether any key grants write access
    pub fn has_write_key(&self) -> bool {
        self.read_write.is_some()
    }

    /// Check a credential that may be absent (missing header)
    pub fn check(&self, credential: Option<&str>) -> Result<Permissions> {
        match credential {
            None | Some("") => Err(DataApiError::MissingCredential),
            Some(key) => self.authorize(key),
        }
    }

    /// Exact comparison against the configured secrets.
    ///
    /// The read-write key wins when both secrets are equal.
    pub fn authorize(&self, credential: &str) -> Result<Permissions> {
        if self.read_write.as_deref() == Some(credential) {
            Ok(Permissions::READ_WRITE)
        } else if self.read_only.as_deref() == Some(credential) {
            Ok(Permissions::READ_ONLY)
        } else {
            Err(DataApiError::InvalidCredential)
        }
    }
}
