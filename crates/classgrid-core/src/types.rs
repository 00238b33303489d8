//! Shared types used across classgrid crates.
//!
//! A `Task` travels on the task queue, a `TaskResult` on the result queue.
//! Both are encoded the same way on the wire: the message body is the task
//! id and everything else rides in string attributes.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Correlation key of a task. Also the blob key of its payload.
pub type TaskId = String;

/// Identifier of a worker instance in the fleet.
pub type InstanceId = String;

/// String attributes attached to a queue message.
pub type Attributes = HashMap<String, String>;

/// Attribute carrying the original submission filename.
pub const ATTR_FILE_NAME: &str = "FILE_NAME";
/// Attribute carrying the predicted label of a successful result.
pub const ATTR_CLASS_NAME: &str = "CLASS_NAME";
/// Attribute carrying the `ErrorTag` of a failed result.
pub const ATTR_ERROR_TAG: &str = "ERROR_TAG";
/// Attribute carrying a human-readable failure detail.
pub const ATTR_ERROR_DETAIL: &str = "ERROR_DETAIL";

// ── Task ───────────────────────────────────────────────────────────

/// A unit of classification work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub attributes: Attributes,
}

impl Task {
    /// Create a task for a submitted file. The filename is the task id.
    pub fn new(file_name: impl Into<String>) -> Self {
        let id = file_name.into();
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_FILE_NAME.to_string(), id.clone());
        Self { id, attributes }
    }

    /// Rebuild a task from a received message body and its attributes.
    pub fn from_parts(body: &str, attributes: Attributes) -> Result<Self, DecodeError> {
        let id = attributes
            .get(ATTR_FILE_NAME)
            .cloned()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| body.to_string());
        if id.is_empty() {
            return Err(DecodeError::MissingId);
        }
        Ok(Self { id, attributes })
    }

    pub fn file_name(&self) -> &str {
        self.attributes
            .get(ATTR_FILE_NAME)
            .map(String::as_str)
            .unwrap_or(&self.id)
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Why a task produced no label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    /// The classifier rejected or failed on the payload.
    CapabilityFailed,
    /// No payload was stored under the task id.
    PayloadMissing,
    /// The task was redelivered too many times and was given up on.
    PoisonMessage,
}

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::CapabilityFailed => "capability_failed",
            ErrorTag::PayloadMissing => "payload_missing",
            ErrorTag::PoisonMessage => "poison_message",
        }
    }
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorTag {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capability_failed" => Ok(ErrorTag::CapabilityFailed),
            "payload_missing" => Ok(ErrorTag::PayloadMissing),
            "poison_message" => Ok(ErrorTag::PoisonMessage),
            other => Err(DecodeError::UnknownErrorTag(other.to_string())),
        }
    }
}

/// What a worker concluded about a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Label { label: String },
    Failed { tag: ErrorTag, detail: String },
}

/// The classification outcome correlated back to a task by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: TaskId,
    pub outcome: Outcome,
    pub attributes: Attributes,
}

impl TaskResult {
    /// A successful result. Task attributes are carried over.
    pub fn success(task: &Task, label: impl Into<String>) -> Self {
        let label = label.into();
        let mut attributes = task.attributes.clone();
        attributes.insert(ATTR_CLASS_NAME.to_string(), label.clone());
        Self {
            id: task.id.clone(),
            outcome: Outcome::Label { label },
            attributes,
        }
    }

    /// A failed result tagged with the reason.
    pub fn failure(task: &Task, tag: ErrorTag, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let mut attributes = task.attributes.clone();
        attributes.remove(ATTR_CLASS_NAME);
        attributes.insert(ATTR_ERROR_TAG.to_string(), tag.as_str().to_string());
        attributes.insert(ATTR_ERROR_DETAIL.to_string(), detail.clone());
        Self {
            id: task.id.clone(),
            outcome: Outcome::Failed { tag, detail },
            attributes,
        }
    }

    /// Decode a result from a received message body and its attributes.
    ///
    /// `CLASS_NAME` wins over `ERROR_TAG` if a producer set both.
    pub fn from_parts(body: &str, attributes: Attributes) -> Result<Self, DecodeError> {
        let id = attributes
            .get(ATTR_FILE_NAME)
            .cloned()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| body.to_string());
        if id.is_empty() {
            return Err(DecodeError::MissingId);
        }

        let outcome = if let Some(label) = attributes.get(ATTR_CLASS_NAME) {
            Outcome::Label {
                label: label.clone(),
            }
        } else if let Some(tag) = attributes.get(ATTR_ERROR_TAG) {
            Outcome::Failed {
                tag: tag.parse()?,
                detail: attributes
                    .get(ATTR_ERROR_DETAIL)
                    .cloned()
                    .unwrap_or_default(),
            }
        } else {
            return Err(DecodeError::MissingOutcome(id));
        };

        Ok(Self {
            id,
            outcome,
            attributes,
        })
    }

    pub fn label(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Label { label } => Some(label),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn error_tag(&self) -> Option<ErrorTag> {
        match &self.outcome {
            Outcome::Label { .. } => None,
            Outcome::Failed { tag, .. } => Some(*tag),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Label { .. })
    }
}

/// A queue message that could not be turned into a task or result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message has neither a body nor a FILE_NAME attribute")]
    MissingId,

    #[error("result for {0} carries neither CLASS_NAME nor ERROR_TAG")]
    MissingOutcome(String),

    #[error("unknown error tag: {0}")]
    UnknownErrorTag(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_carries_file_name_attribute() {
        let task = Task::new("cat.jpg");
        assert_eq!(task.id, "cat.jpg");
        assert_eq!(task.file_name(), "cat.jpg");
        assert_eq!(task.attributes[ATTR_FILE_NAME], "cat.jpg");
    }

    #[test]
    fn task_id_falls_back_to_body() {
        let task = Task::from_parts("dog.png", Attributes::new()).unwrap();
        assert_eq!(task.id, "dog.png");
        assert_eq!(
            Task::from_parts("", Attributes::new()),
            Err(DecodeError::MissingId)
        );
    }

    #[test]
    fn success_result_decodes_from_wire_attributes() {
        let task = Task::new("cat.jpg");
        let result = TaskResult::success(&task, "tabby");
        assert_eq!(result.attributes[ATTR_CLASS_NAME], "tabby");

        let decoded = TaskResult::from_parts("cat.jpg", result.attributes.clone()).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.label(), Some("tabby"));
        assert!(decoded.is_success());
    }

    #[test]
    fn failure_result_carries_tag_and_detail() {
        let task = Task::new("cat.jpg");
        let result = TaskResult::failure(&task, ErrorTag::CapabilityFailed, "model crashed");
        assert_eq!(result.attributes[ATTR_ERROR_TAG], "capability_failed");
        assert!(!result.attributes.contains_key(ATTR_CLASS_NAME));

        let decoded = TaskResult::from_parts("cat.jpg", result.attributes.clone()).unwrap();
        assert_eq!(decoded.error_tag(), Some(ErrorTag::CapabilityFailed));
        assert_eq!(decoded.label(), None);
    }

    #[test]
    fn result_without_outcome_is_rejected() {
        let err = TaskResult::from_parts("cat.jpg", Attributes::new()).unwrap_err();
        assert_eq!(err, DecodeError::MissingOutcome("cat.jpg".to_string()));
    }

    #[test]
    fn unknown_error_tag_is_rejected() {
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_ERROR_TAG.to_string(), "exploded".to_string());
        let err = TaskResult::from_parts("cat.jpg", attributes).unwrap_err();
        assert_eq!(err, DecodeError::UnknownErrorTag("exploded".to_string()));
    }

    #[test]
    fn error_tag_strings_parse_back() {
        for tag in [
            ErrorTag::CapabilityFailed,
            ErrorTag::PayloadMissing,
            ErrorTag::PoisonMessage,
        ] {
            assert_eq!(tag.as_str().parse::<ErrorTag>().unwrap(), tag);
        }
    }
}
