//! Identifiers for rooms and graph entities.
//!
//! Entities created before the persisted store confirms them live under an
//! [`EphemeralId`]; the store later issues a [`CanonicalId`]. An entity moves
//! from ephemeral to canonical at most once. Which of the two an id is, is
//! carried explicitly by [`EntityId`] and never inferred from string shape.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use web_time::{SystemTime, UNIX_EPOCH};

/// Prefix reserved for ephemeral ids. Canonical ids may never start with it.
pub const EPHEMERAL_PREFIX: &str = "tmp_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Identifier is empty")]
    Empty,
    #[error("Canonical id uses the reserved ephemeral prefix: {0}")]
    ReservedPrefix(String),
    #[error("Invalid ephemeral id format: {0}")]
    InvalidEphemeral(String),
}

/// An isolated collaboration scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

/// Client-generated identifier, unique within a room for the life of a session.
///
/// Format: `tmp_<unix millis, hex>_<64 random bits, hex>`.
///
/// # Examples
/// ```
/// use graph_sync::ids::{CanonicalId, EphemeralId};
///
/// let id = EphemeralId::generate();
/// assert!(id.as_str().starts_with("tmp_"));
/// assert!(CanonicalId::new(id.as_str()).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EphemeralId(String);

impl EphemeralId {
    /// Generate a fresh ephemeral id.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let suffix: u64 = rand::rng().random();
        Self(format!("{EPHEMERAL_PREFIX}{millis:x}_{suffix:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EphemeralId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EphemeralId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdError::InvalidEphemeral(s.to_string());
        let rest = s.strip_prefix(EPHEMERAL_PREFIX).ok_or_else(invalid)?;
        let (millis, suffix) = rest.split_once('_').ok_or_else(invalid)?;
        let is_hex = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_hexdigit());
        if !is_hex(millis) || suffix.len() != 16 || !is_hex(suffix) {
            return Err(invalid());
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for EphemeralId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EphemeralId> for String {
    fn from(id: EphemeralId) -> Self {
        id.0
    }
}

/// Server-issued identifier. Opaque, immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalId(String);

impl CanonicalId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.starts_with(EPHEMERAL_PREFIX) {
            return Err(IdError::ReservedPrefix(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CanonicalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CanonicalId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<uuid::Uuid> for CanonicalId {
    /// Hyphenated uuids never carry the ephemeral prefix.
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<CanonicalId> for String {
    fn from(id: CanonicalId) -> Self {
        id.0
    }
}

/// Identifier of a node or edge, tagged with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum EntityId {
    Ephemeral(EphemeralId),
    Canonical(CanonicalId),
}

impl EntityId {
    /// Generate a new ephemeral entity id.
    pub fn ephemeral() -> Self {
        Self::Ephemeral(EphemeralId::generate())
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }

    pub fn as_ephemeral(&self) -> Option<&EphemeralId> {
        match self {
            Self::Ephemeral(id) => Some(id),
            Self::Canonical(_) => None,
        }
    }

    pub fn as_canonical(&self) -> Option<&CanonicalId> {
        match self {
            Self::Canonical(id) => Some(id),
            Self::Ephemeral(_) => None,
        }
    }

    /// Key under which the entity is stored in the replicated document.
    ///
    /// Keys of the two variants never collide because canonical ids reject
    /// the ephemeral prefix.
    pub fn as_key(&self) -> &str {
        match self {
            Self::Ephemeral(id) => id.as_str(),
            Self::Canonical(id) => id.as_str(),
        }
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

impl From<EphemeralId> for EntityId {
    fn from(id: EphemeralId) -> Self {
        Self::Ephemeral(id)
    }
}

impl From<CanonicalId> for EntityId {
    fn from(id: CanonicalId) -> Self {
        Self::Canonical(id)
    }
}
