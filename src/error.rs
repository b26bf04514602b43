use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GriddleError {
    #[error("Wrong usage: {0}")]
    WrongUsage(String),

    #[error("Document already exists: {id} ({reason})")]
    DocAlreadyExists { id: String, reason: String },

    #[error("Document does not exist: {id} ({reason})")]
    DocDoesNotExist { id: String, reason: String },

    #[error("Version conflict for document {id}: version in update {requested} does not match current version {current}")]
    VersionConflict {
        id: String,
        requested: i64,
        current: i64,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{errors} of {total} documents failed")]
    PartialErrors {
        errors: usize,
        total: usize,
        /// One slot per document in the batch, `None` where the document
        /// was applied.
        per_doc: Vec<Option<GriddleError>>,
    },

    #[error("Query parse error: {0}")]
    QueryParse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Index writer is closed")]
    WriterClosed,

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, GriddleError>;

impl From<std::io::Error> for GriddleError {
    fn from(e: std::io::Error) -> Self {
        GriddleError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for GriddleError {
    fn from(e: serde_json::Error) -> Self {
        GriddleError::Json(e.to_string())
    }
}

impl GriddleError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GriddleError::WrongUsage(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GriddleError::DocAlreadyExists { .. } => StatusCode::CONFLICT,
            GriddleError::DocDoesNotExist { .. } => StatusCode::CONFLICT,
            GriddleError::VersionConflict { .. } => StatusCode::CONFLICT,
            GriddleError::PartialErrors { .. } => StatusCode::CONFLICT,
            GriddleError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GriddleError::QueryParse(_) => StatusCode::BAD_REQUEST,
            GriddleError::Json(_) => StatusCode::BAD_REQUEST,
            GriddleError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GriddleError::WriterClosed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is one of the per-document conflict kinds that a
    /// batch add collects into partial-error slots instead of aborting.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            GriddleError::DocAlreadyExists { .. }
                | GriddleError::DocDoesNotExist { .. }
                | GriddleError::VersionConflict { .. }
        )
    }
}
