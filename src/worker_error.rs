use std::fmt;

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Express whether a failure came from the request, the loaded data, or the
/// worker's own logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLayer {
    /// The request itself has structural issues like an unparseable search
    /// specification or a node id that does not exist.  A search that simply
    /// matches nothing is not an error; it is an empty result.
    BadInput,
    /// The dataset content is the problem, like a JSONL line that is not an
    /// object or a mutation index that points past the mutation list.
    DataLayer,
    /// The error seems to involve worker logic rather than the data.
    WorkerLayer,
    /// Something that should be impossible given the ingestion invariants.
    RuntimeInvariantViolation,
}

impl ErrorLayer {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorLayer::BadInput => "bad_input",
            ErrorLayer::DataLayer => "data_layer",
            ErrorLayer::WorkerLayer => "worker_layer",
            ErrorLayer::RuntimeInvariantViolation => "runtime_invariant_violation",
        }
    }
}

/// Payload describing what went wrong for investigation purposes.
#[derive(Debug, Clone)]
pub struct ErrorDetails {
    pub layer: ErrorLayer,
    /// Stringified version of the lower level error.
    pub message: String,
}

/// Failures are always scoped: a `RequestProblem` fails one request, an
/// `IngestionProblem` leaves the dataset unset.  Neither stops the worker.
#[derive(Debug, Clone)]
pub enum WorkerError {
    RequestProblem(ErrorDetails),
    IngestionProblem(ErrorDetails),
    UnsupportedFiletype(String),
}

impl WorkerError {
    pub fn bad_request(message: impl Into<String>) -> WorkerError {
        WorkerError::RequestProblem(ErrorDetails {
            layer: ErrorLayer::BadInput,
            message: message.into(),
        })
    }

    pub fn bad_data(message: impl Into<String>) -> WorkerError {
        WorkerError::IngestionProblem(ErrorDetails {
            layer: ErrorLayer::DataLayer,
            message: message.into(),
        })
    }

    pub fn invariant(message: impl Into<String>) -> WorkerError {
        WorkerError::RequestProblem(ErrorDetails {
            layer: ErrorLayer::RuntimeInvariantViolation,
            message: message.into(),
        })
    }

    pub fn layer(&self) -> ErrorLayer {
        match self {
            WorkerError::RequestProblem(details) | WorkerError::IngestionProblem(details) => {
                details.layer
            }
            WorkerError::UnsupportedFiletype(_) => ErrorLayer::BadInput,
        }
    }

    pub fn message(&self) -> String {
        match self {
            WorkerError::RequestProblem(details) | WorkerError::IngestionProblem(details) => {
                details.message.clone()
            }
            WorkerError::UnsupportedFiletype(_) => {
                "Only Taxonium jsonl files are supported (could not find 'jsonl' in filename)"
                    .to_string()
            }
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::RequestProblem(details) => {
                write!(f, "request problem ({}): {}", details.layer.name(), details.message)
            }
            WorkerError::IngestionProblem(details) => {
                write!(f, "ingestion problem ({}): {}", details.layer.name(), details.message)
            }
            WorkerError::UnsupportedFiletype(filename) => {
                write!(f, "unsupported upload {}: {}", filename, self.message())
            }
        }
    }
}

impl std::error::Error for WorkerError {}

// JSON parse errors surface through requests far more often than through
// ingestion, which wraps its own parsing with line context.
impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> WorkerError {
        WorkerError::RequestProblem(ErrorDetails {
            layer: ErrorLayer::BadInput,
            message: err.to_string(),
        })
    }
}

/// IO only happens while loading a dataset or the worker config.
impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> WorkerError {
        WorkerError::IngestionProblem(ErrorDetails {
            layer: ErrorLayer::WorkerLayer,
            message: err.to_string(),
        })
    }
}

impl From<toml::de::Error> for WorkerError {
    fn from(err: toml::de::Error) -> WorkerError {
        WorkerError::RequestProblem(ErrorDetails {
            layer: ErrorLayer::BadInput,
            message: err.to_string(),
        })
    }
}
