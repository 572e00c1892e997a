//! Wire and on-disk formats: the dataset model, the upload formats we can
//! ingest, and the search specification.

use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::worker_error::{ErrorDetails, ErrorLayer, Result, WorkerError};

pub mod dataset;
pub mod jsonl;
pub mod newick;
pub mod search_spec;

pub use dataset::{Dataset, Extent, Mutation, Node, XAxis, YIndex};

/// Progress or failure notification sent while a dataset loads.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusMessage {
    pub fn progress(message: &str, percentage: Option<u32>) -> StatusMessage {
        StatusMessage {
            message: Some(message.to_string()),
            percentage,
            error: None,
        }
    }

    pub fn failure(error: String) -> StatusMessage {
        StatusMessage {
            error: Some(error),
            ..Default::default()
        }
    }
}

pub type StatusReporter = dyn Fn(StatusMessage) + Send + Sync;

/// What the UI hands over when the user picks or links a file.  The content is
/// either inline text in `data` or a local file at `path`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadPayload {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub filetype: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadKind {
    TaxoniumJsonl,
    Newick,
}

impl UploadPayload {
    /// Classify the upload.  A filename mentioning `jsonl` wins over the
    /// declared filetype, matching how the UI names Taxonium files.
    pub fn kind(&self) -> Result<UploadKind> {
        let filename = self.filename.as_deref().ok_or_else(|| {
            WorkerError::IngestionProblem(ErrorDetails {
                layer: ErrorLayer::BadInput,
                message: "upload is missing a filename".to_string(),
            })
        })?;
        if filename.contains("jsonl") {
            Ok(UploadKind::TaxoniumJsonl)
        } else if self.filetype.as_deref() == Some("nwk") {
            Ok(UploadKind::Newick)
        } else {
            Err(WorkerError::UnsupportedFiletype(filename.to_string()))
        }
    }
}

fn is_gzipped(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x1f, 0x8b])
}

/// Fetch the upload's text, gunzipping file content when needed.
pub async fn read_upload_text(payload: &UploadPayload) -> Result<String> {
    if let Some(data) = &payload.data {
        return Ok(data.clone());
    }
    let path = payload.path.as_deref().ok_or_else(|| {
        WorkerError::IngestionProblem(ErrorDetails {
            layer: ErrorLayer::BadInput,
            message: "upload has neither inline data nor a path".to_string(),
        })
    })?;

    let mut f = File::open(path).await?;
    let mut buffer = Vec::new();
    f.read_to_end(&mut buffer).await?;

    if !is_gzipped(&buffer) {
        return String::from_utf8(buffer)
            .map_err(|err| WorkerError::bad_data(format!("{}: {}", path, err)));
    }

    // flate2's reader is synchronous, but by now the compressed bytes are all
    // in memory so this doesn't block on IO.
    let mut gz = GzDecoder::new(&buffer[..]);
    let mut raw_str = String::new();
    gz.read_to_string(&mut raw_str)?;
    Ok(raw_str)
}

/// Build a dataset from upload text.  CPU-bound; callers on the async runtime
/// should run this via `spawn_blocking`.
pub fn ingest_text(kind: UploadKind, text: &str, report: &StatusReporter) -> Result<Dataset> {
    match kind {
        UploadKind::TaxoniumJsonl => jsonl::ingest_jsonl(text, report),
        UploadKind::Newick => newick::ingest_newick(text, report),
    }
}
