//! Decentralized identifiers (DIDs)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use smol_str::SmolStr;

use crate::error::{ErrorKind, RepoError, Result};

/// A decentralized identifier, e.g. `did:plc:ewvi7nxzyoun6zhxrhs64oiz`
///
/// Validation covers DID syntax only. Resolution (`did:plc`, `did:web`) is a
/// collaborator concern and never happens in this crate.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Did(SmolStr);

impl Did {
    /// Parse a DID, validating the `did:<method>:<id>` shape
    pub fn new(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("did:").ok_or_else(|| Self::invalid(s))?;
        let (method, id) = rest.split_once(':').ok_or_else(|| Self::invalid(s))?;

        let method_ok = !method.is_empty() && method.bytes().all(|b| b.is_ascii_lowercase());
        let id_ok = !id.is_empty()
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b':' | b'%'));

        if method_ok && id_ok && s.len() <= 2048 {
            Ok(Self(SmolStr::new(s)))
        } else {
            Err(Self::invalid(s))
        }
    }

    fn invalid(s: &str) -> RepoError {
        RepoError::new(ErrorKind::Serialization, None)
            .with_context(format!("invalid DID: {s:?}"))
            .with_help("expected did:<method>:<identifier>")
    }

    /// String view of the DID
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The DID method name, e.g. `plc` or `web`
    pub fn method(&self) -> &str {
        self.0["did:".len()..].split(':').next().unwrap_or("")
    }
}

impl FromStr for Did {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: SmolStr = Deserialize::deserialize(deserializer)?;
        Did::new(&s).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
