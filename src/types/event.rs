use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, totally ordered position in the change feed.
///
/// Positions strictly increase per source stream; events for the same
/// document key must be applied in non-decreasing position order.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Position(pub u64);

impl std::fmt::Display for Position {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
  Insert,
  Update,
  Delete,
}

impl std::str::FromStr for ChangeOperation {
  type Err = String;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "INSERT" => Ok(Self::Insert),
      "UPDATE" => Ok(Self::Update),
      "DELETE" => Ok(Self::Delete),
      _ => Err(format!("Unknown operation: {}", s)),
    }
  }
}

impl std::fmt::Display for ChangeOperation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Insert => write!(f, "INSERT"),
      Self::Update => write!(f, "UPDATE"),
      Self::Delete => write!(f, "DELETE"),
    }
  }
}

/// A single mutation observed on the change feed.
///
/// `full_document` carries the complete post-image for Insert/Update and is
/// absent for Delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
  pub operation: ChangeOperation,
  pub document_key: String,
  pub full_document: Option<serde_json::Value>,
  pub position: Position,
}

/// Last successfully ingested position, persisted only after the
/// corresponding events are confirmed enqueued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResumeToken {
  pub position: Position,
  pub persisted_at: DateTime<Utc>,
}

impl ResumeToken {
  pub fn at(position: Position) -> Self {
    Self {
      position,
      persisted_at: Utc::now(),
    }
  }
}

/// Materialized state of one document in the projection store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedDocument {
  pub key: String,
  pub value: serde_json::Value,
  pub last_applied_position: Position,
}
