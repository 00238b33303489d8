//! Result artifacts: the per-task CSV line returned to HTTP clients.
//!
//! For a submission `cat.jpg` classified as `tabby`, the worker writes
//! `cat.txt` containing `cat.jpg,tabby` to the output bucket.

/// Output-bucket key for a submission's artifact.
pub fn artifact_key(file_name: &str) -> String {
    let stem = file_name.split('.').next().unwrap_or_default();
    let stem = if stem.is_empty() { file_name } else { stem };
    format!("{stem}.txt")
}

/// Artifact body for a labelled submission.
pub fn render_artifact(file_name: &str, label: &str) -> String {
    format!("{file_name},{label}\n")
}

/// Split an artifact body back into `(file_name, label)`.
pub fn parse_artifact(body: &str) -> Option<(&str, &str)> {
    body.trim_end().split_once(',')
}
