//! Common types used throughout CardStack.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kinds of synchronizable entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A note card.
    Card,
    /// A folder grouping cards.
    Folder,
    /// A tag attached to cards.
    Tag,
    /// An image referenced by a card.
    Image,
}

impl EntityType {
    /// All entity types, in the order a full sync processes them.
    ///
    /// Folders and tags sync before the cards that reference them.
    pub const ALL: [EntityType; 4] = [
        EntityType::Folder,
        EntityType::Tag,
        EntityType::Card,
        EntityType::Image,
    ];

    /// Stable string form used in logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Card => "card",
            EntityType::Folder => "folder",
            EntityType::Tag => "tag",
            EntityType::Image => "image",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable unique identifier for a synchronizable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parse from the canonical hyphenated form.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the string is not a valid UUID.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid entity id: {e}")))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the user owning synced records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new UserId from a string.
    ///
    /// # Errors
    /// Returns error if id is empty.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "UserId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
