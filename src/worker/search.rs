use serde_json::Value;
use tracing::debug;

use super::{
    bounds::{resolve_bounds, QueryBounds},
    result_cache::ResultCache,
};
use crate::{
    abstract_filtering::{SearchRequest, SearchResult, TreeFiltering},
    file_format::{search_spec::SearchSpec, Dataset},
    worker_error::{Result, WorkerError},
};

/// The UI double-encodes the search as a JSON string, but an already decoded
/// object is accepted too.
fn parse_spec(raw: &Value) -> Result<SearchSpec> {
    match raw {
        Value::String(text) => SearchSpec::parse(text),
        Value::Object(_) => Ok(serde_json::from_value(raw.clone())?),
        other => Err(WorkerError::bad_request(format!(
            "search spec must be a JSON string or object, not {}",
            other
        ))),
    }
}

/// Run one search.  The result carries the search's `key` so responses to
/// overlapping searches can be matched up by the caller.
pub async fn search(
    dataset: &Dataset,
    filtering: &dyn TreeFiltering,
    cache: &ResultCache,
    raw_spec: &Value,
    bounds: Option<&QueryBounds>,
) -> Result<SearchResult> {
    let spec = parse_spec(raw_spec)?;
    let effective = resolve_bounds(dataset, bounds);

    let mut result = filtering
        .single_search(SearchRequest {
            dataset,
            spec: &spec,
            bounds: &effective,
            cache,
        })
        .await?;
    result.key = spec.key.clone();
    debug!(
        key = %spec.key,
        kind = ?result.kind,
        total_count = result.total_count,
        "search done"
    );
    Ok(result)
}
