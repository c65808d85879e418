use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);

/// Message identity across its lifecycle.
///
/// A message carries a `Temporary` id from the moment it is composed
/// locally until the server acknowledges durable storage, at which point
/// reconciliation swaps it for the server-assigned `Permanent` id. The
/// two variants never compare equal, so a locally minted id cannot
/// collide with a server one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Temporary(i64),
    Permanent(i64),
}

impl MessageId {
    pub fn is_permanent(&self) -> bool {
        matches!(self, MessageId::Permanent(_))
    }

    pub fn permanent_value(&self) -> Option<i64> {
        match self {
            MessageId::Permanent(value) => Some(*value),
            MessageId::Temporary(_) => None,
        }
    }
}
