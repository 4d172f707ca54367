//! Transport security policy for replication connections.
//!
//! Mirrors the libpq `sslmode` values accepted by the base backup program.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ReplError;

/// Security mode negotiated for the replication connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plaintext. Only acceptable on trusted networks.
    Disable,
    /// Encrypt, but do not check the server certificate.
    Require,
    /// Encrypt and check the certificate chain against the CA.
    VerifyCa,
    /// Encrypt, check the chain and that the host name matches.
    #[default]
    VerifyFull,
}

impl SslMode {
    /// All accepted modes, weakest first.
    pub const ALL: [SslMode; 4] = [
        SslMode::Disable,
        SslMode::Require,
        SslMode::VerifyCa,
        SslMode::VerifyFull,
    ];

    /// The value passed to the base backup program via `PGSSLMODE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// Returns true if the stream is encrypted.
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Returns true if the server certificate is checked.
    pub fn verifies_peer(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SslMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                ReplError::config(format!(
                    "invalid sslmode '{}', expected one of disable, require, verify-ca, verify-full",
                    s
                ))
            })
    }
}
