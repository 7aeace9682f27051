//! Accounts and login credentials.

use serde::{Deserialize, Serialize};

/// A trading account returned by login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account number; the key used by `set_active_account`.
    pub account_no: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Branch code.
    #[serde(default)]
    pub branch: String,
}

/// Login credentials. Opaque to the core. Stored only so the supervisor can
/// log in again after a dropped trading connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub id: String,
    pub password: String,
    pub cert_path: String,
    pub cert_password: String,
    /// Optional explicit gateway address.
    #[serde(default)]
    pub connection_addr: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("password", &"***")
            .field("cert_path", &self.cert_path)
            .field("cert_password", &"***")
            .field("connection_addr", &self.connection_addr)
            .finish()
    }
}
