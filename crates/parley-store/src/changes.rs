//! Change notifications published by the store after every committed write.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityKind {
    Message,
    Conversation,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StoreChange {
    Inserted {
        entity: EntityKind,
        id: String,
    },
    /// An existing record changed; `fields` names what differs.
    Changed {
        entity: EntityKind,
        id: String,
        fields: Vec<&'static str>,
    },
    Deleted {
        entity: EntityKind,
        id: String,
    },
}

impl StoreChange {
    pub fn entity(&self) -> EntityKind {
        match self {
            Self::Inserted { entity, .. }
            | Self::Changed { entity, .. }
            | Self::Deleted { entity, .. } => *entity,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Inserted { id, .. } | Self::Changed { id, .. } | Self::Deleted { id, .. } => id,
        }
    }

    /// Whether this change concerns the given record.
    pub fn is_about(&self, entity: EntityKind, id: &str) -> bool {
        self.entity() == entity && self.id() == id
    }
}
