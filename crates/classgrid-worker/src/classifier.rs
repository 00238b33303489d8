//! The classification capability.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::CapabilityError;

/// Labels a payload.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Return the label for the payload stored under `key`.
    async fn classify(&self, key: &str, payload: &Bytes) -> Result<String, CapabilityError>;
}

pub type SharedClassifier = Arc<dyn Classifier>;

/// Classifier backed by a table of known subjects.
///
/// The table maps a filename stem (`test_00` for `test_00.jpg`) to its
/// label and is loaded from a JSON object such as
/// `{"test_00": "Paul", "test_01": "Emily"}`.
#[derive(Debug, Clone, Default)]
pub struct LookupClassifier {
    labels: HashMap<String, String>,
}

impl LookupClassifier {
    pub fn new(labels: HashMap<String, String>) -> Self {
        Self { labels }
    }

    pub fn from_file(path: &Path) -> Result<Self, CapabilityError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CapabilityError::LabelsRead {
            path: path.to_path_buf(),
            source,
        })?;
        let labels: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|source| CapabilityError::LabelsParse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), count = labels.len(), "labels loaded");
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[async_trait]
impl Classifier for LookupClassifier {
    async fn classify(&self, key: &str, payload: &Bytes) -> Result<String, CapabilityError> {
        if payload.is_empty() {
            return Err(CapabilityError::EmptyPayload(key.to_string()));
        }
        let stem = key.split('.').next().unwrap_or(key);
        self.labels
            .get(stem)
            .or_else(|| self.labels.get(key))
            .cloned()
            .ok_or_else(|| CapabilityError::Unrecognized(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn classifier() -> LookupClassifier {
        LookupClassifier::new(HashMap::from([
            ("test_00".to_string(), "Paul".to_string()),
            ("cat".to_string(), "tabby".to_string()),
        ]))
    }

    #[tokio::test]
    async fn labels_by_stem() {
        let c = classifier();
        let label = c.classify("cat.jpg", &Bytes::from_static(b"\xff\xd8")).await.unwrap();
        assert_eq!(label, "tabby");
        let label = c.classify("test_00.JPEG", &Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(label, "Paul");
    }

    #[tokio::test]
    async fn empty_payload_is_a_capability_failure() {
        let err = classifier().classify("cat.jpg", &Bytes::new()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::EmptyPayload(ref k) if k == "cat.jpg"));
    }

    #[tokio::test]
    async fn unknown_subject_is_a_capability_failure() {
        let err = classifier()
            .classify("dog.png", &Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Unrecognized(_)));
    }

    #[test]
    fn loads_labels_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"test_00": "Paul", "test_01": "Emily"}}"#).unwrap();
        let c = LookupClassifier::from_file(file.path()).unwrap();
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn bad_labels_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[1, 2, 3]").unwrap();
        assert!(matches!(
            LookupClassifier::from_file(file.path()),
            Err(CapabilityError::LabelsParse { .. })
        ));
        assert!(matches!(
            LookupClassifier::from_file(Path::new("/nonexistent/labels.json")),
            Err(CapabilityError::LabelsRead { .. })
        ));
    }
}
