use thiserror::Error;

/// Stable error taxonomy surfaced at the engine API boundary.
///
/// Internal call sites use `anyhow::Result` with `.context(...)`; this enum
/// is only constructed at the boundary crossing into `Engine::*`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {field} = {value:?} ({reason})")]
    InvalidArgument {
        field: String,
        value: String,
        reason: String,
        valid_options: Option<Vec<String>>,
    },

    #[error("not found: doc_uri={doc_uri:?} heading_path={heading_path:?}")]
    NotFound {
        doc_uri: Option<String>,
        heading_path: Option<String>,
    },

    #[error("no snapshot is loaded")]
    NotIndexed,

    #[error("a build is already in progress (started at {current_build_started_at})")]
    IndexBusy {
        current_build_started_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("snapshot {snapshot_id} is corrupt: {reason}")]
    IndexCorrupt {
        snapshot_id: String,
        reason: String,
        missing_files: Option<Vec<String>>,
    },

    #[error("io error during {operation} on {path}: {errno:?}")]
    IoError {
        path: String,
        operation: String,
        errno: Option<i32>,
    },

    #[error("model download failed from {url}: {reason}")]
    ModelDownloadFailed { url: String, reason: String },

    #[error("internal error: {original_error:?}")]
    Internal { original_error: Option<String> },
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal {
            original_error: Some(format!("{err:#}")),
        }
    }
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::NotIndexed => "NOT_INDEXED",
            EngineError::IndexBusy { .. } => "INDEX_BUSY",
            EngineError::IndexCorrupt { .. } => "INDEX_CORRUPT",
            EngineError::IoError { .. } => "IO_ERROR",
            EngineError::ModelDownloadFailed { .. } => "MODEL_DOWNLOAD_FAILED",
            EngineError::Internal { .. } => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_the_stable_taxonomy_in_the_external_interface() {
        assert_eq!(EngineError::NotIndexed.code(), "NOT_INDEXED");
        assert_eq!(
            EngineError::IndexBusy { current_build_started_at: chrono::Utc::now() }.code(),
            "INDEX_BUSY"
        );
    }

    #[test]
    fn anyhow_errors_convert_to_internal_with_context_preserved() {
        let source = anyhow::anyhow!("disk on fire").context("while reading shard 3");
        let err: EngineError = source.into();
        match err {
            EngineError::Internal { original_error: Some(msg) } => {
                assert!(msg.contains("disk on fire"));
                assert!(msg.contains("while reading shard 3"));
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }
}
