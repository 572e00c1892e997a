use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::{
    file_format::{search_spec::SearchSpec, Dataset, Node, XAxis},
    worker::result_cache::ResultCache,
    worker_error::Result,
};

/// A query window after defaulting and clamping against the dataset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EffectiveBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    #[serde(rename = "xType")]
    pub x_axis: XAxis,
}

impl EffectiveBounds {
    pub fn contains_y(&self, y: f64) -> bool {
        y >= self.min_y && y <= self.max_y
    }

    pub fn contains_x(&self, x: f64) -> bool {
        x >= self.min_x && x <= self.max_x
    }
}

/// Everything a search needs.  The cache is handed over so implementations
/// can store (sub-)results under keys they derive themselves.
pub struct SearchRequest<'a> {
    pub dataset: &'a Dataset,
    pub spec: &'a SearchSpec,
    pub bounds: &'a EffectiveBounds,
    pub cache: &'a ResultCache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchResultKind {
    /// Every match is listed.
    Complete,
    /// Too many matches; only those visible in the bounds are listed.
    Filtered,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchHit {
    pub node_id: usize,
    pub x: f64,
    pub y: f64,
    pub num_tips: u64,
}

impl SearchHit {
    pub fn of(node: &Node, axis: XAxis) -> SearchHit {
        SearchHit {
            node_id: node.node_id,
            x: node.x(axis),
            y: node.y,
            num_tips: node.num_tips,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchResult {
    #[serde(rename = "type")]
    pub kind: SearchResultKind,
    pub data: Vec<SearchHit>,
    pub total_count: usize,
    /// Copied from the request's spec so concurrent searches can be told
    /// apart by the caller.
    pub key: Value,
}

/// The node selection and matching routines the worker delegates to.
///
/// The worker only owns request plumbing (readiness, bounds policy, caching
/// handles, config derivation); deciding which nodes are visible or match is
/// up to implementations of this trait.
#[async_trait]
pub trait TreeFiltering: Send + Sync {
    /// Ids of the nodes to draw for the given window, in rank order.
    async fn get_nodes(&self, dataset: &Dataset, bounds: &EffectiveBounds) -> Result<Vec<usize>>;

    async fn single_search(&self, request: SearchRequest<'_>) -> Result<SearchResult>;

    /// Values of `attribute` for every tip under `node_id`.  Tips lacking
    /// the attribute contribute `null` so positions stay meaningful.
    async fn get_tip_atts(
        &self,
        dataset: &Dataset,
        node_id: usize,
        attribute: &str,
    ) -> Result<Vec<Value>>;
}
