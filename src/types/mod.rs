mod event;
mod job;

pub use event::{ChangeEvent, ChangeOperation, Position, ProjectedDocument, ResumeToken};
pub use job::{DeadLetter, Job};
