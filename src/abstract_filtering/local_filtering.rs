use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use super::{
    filtering_interface::{
        EffectiveBounds, SearchHit, SearchRequest, SearchResult, SearchResultKind, TreeFiltering,
    },
    search_matching::search_node_ids,
};
use crate::{config::WorkerConfig, file_format::Dataset, worker_error::Result};

/// Filtering straight off the in-memory dataset.
#[derive(Clone, Debug)]
pub struct LocalFiltering {
    plot_precision: f64,
    max_search_results: usize,
}

impl LocalFiltering {
    pub fn from_config(config: &WorkerConfig) -> LocalFiltering {
        LocalFiltering {
            plot_precision: config.plot_precision,
            max_search_results: config.max_search_results,
        }
    }

    /// Keep the ids that are drawable in `bounds`: internal nodes within the
    /// Y range, plus tips that are also inside the X range and don't land in
    /// a grid cell an earlier tip already claimed.  `ids` must be in rank
    /// order for the output to be.
    fn visible(
        &self,
        dataset: &Dataset,
        bounds: &EffectiveBounds,
        ids: impl Iterator<Item = usize>,
    ) -> Vec<usize> {
        let cell_scale = |span: f64| {
            if span > 0.0 {
                self.plot_precision / span
            } else {
                self.plot_precision
            }
        };
        let x_scale = cell_scale(bounds.max_x - bounds.min_x);
        let y_scale = cell_scale(bounds.max_y - bounds.min_y);

        let mut claimed: HashSet<(i64, i64)> = HashSet::new();
        let mut thinned = 0usize;
        let kept: Vec<usize> = ids
            .filter(|id| {
                let node = &dataset.nodes[*id];
                if !bounds.contains_y(node.y) {
                    return false;
                }
                if !dataset.is_leaf(*id) {
                    return true;
                }
                let x = node.x(bounds.x_axis);
                if !bounds.contains_x(x) {
                    return false;
                }
                let cell = (
                    ((x - bounds.min_x) * x_scale).round() as i64,
                    ((node.y - bounds.min_y) * y_scale).round() as i64,
                );
                let fresh = claimed.insert(cell);
                if !fresh {
                    thinned += 1;
                }
                fresh
            })
            .collect();
        trace!(kept = kept.len(), thinned, "selected visible nodes");
        kept
    }
}

#[async_trait]
impl TreeFiltering for LocalFiltering {
    async fn get_nodes(&self, dataset: &Dataset, bounds: &EffectiveBounds) -> Result<Vec<usize>> {
        let range = dataset.y_index.range(bounds.min_y, bounds.max_y);
        let in_range = dataset.y_index.order[range].iter().copied();
        Ok(self.visible(dataset, bounds, in_range))
    }

    async fn single_search(&self, request: SearchRequest<'_>) -> Result<SearchResult> {
        let SearchRequest {
            dataset,
            spec,
            bounds,
            cache,
        } = request;
        let matched = search_node_ids(dataset, spec, cache)?;
        let total_count = matched.len();
        let mut hits = matched
            .iter()
            .map(|id| dataset.node(*id))
            .collect::<Result<Vec<_>>>()?;

        let kind = if total_count > self.max_search_results {
            hits.sort_by(|a, b| a.y.total_cmp(&b.y));
            let visible = self.visible(dataset, bounds, hits.iter().map(|node| node.node_id));
            hits = visible
                .into_iter()
                .map(|id| dataset.node(id))
                .collect::<Result<Vec<_>>>()?;
            SearchResultKind::Filtered
        } else {
            SearchResultKind::Complete
        };

        let data = hits
            .into_iter()
            .map(|node| SearchHit::of(node, bounds.x_axis))
            .collect();
        Ok(SearchResult {
            kind,
            data,
            total_count,
            key: spec.key.clone(),
        })
    }

    async fn get_tip_atts(
        &self,
        dataset: &Dataset,
        node_id: usize,
        attribute: &str,
    ) -> Result<Vec<Value>> {
        dataset.node(node_id)?;
        Ok(dataset
            .subtree(node_id)
            .into_iter()
            .filter(|id| dataset.is_leaf(*id))
            .map(|id| dataset.nodes[id].attribute(attribute).unwrap_or(Value::Null))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::{
        file_format::{
            dataset::test_support::{five_node_dataset, node},
            search_spec::SearchSpec,
            XAxis,
        },
        worker::result_cache::ResultCache,
    };

    fn bounds(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> EffectiveBounds {
        EffectiveBounds {
            min_x,
            max_x,
            min_y,
            max_y,
            x_axis: XAxis::Distance,
        }
    }

    fn filtering() -> LocalFiltering {
        LocalFiltering::from_config(&WorkerConfig::default())
    }

    #[tokio::test]
    async fn test_get_nodes_keeps_internal_nodes_and_x_filters_tips() {
        let ds = five_node_dataset();
        let f = filtering();
        assert_eq!(f.get_nodes(&ds, &bounds(0.0, 2.5, 0.0, 2.0)).await.unwrap(), vec![0, 1, 2]);
        // Tip 2 sits at x=2 and tip 4 at x=1.5; the internal nodes stay.
        assert_eq!(
            f.get_nodes(&ds, &bounds(0.0, 1.6, 0.0, 4.0)).await.unwrap(),
            vec![0, 1, 4]
        );
    }

    #[tokio::test]
    async fn test_overlapping_tips_are_thinned() {
        let nodes = vec![
            node(0, 0, 0.0, 1.0, json!({})),
            node(1, 0, 1.0, 0.0, json!({})),
            node(2, 0, 1.0, 0.0001, json!({})),
            node(3, 0, 1.0, 2.0, json!({})),
        ];
        let ds = Dataset::build(nodes, vec![], vec![], Map::new()).unwrap();
        let f = LocalFiltering {
            plot_precision: 10.0,
            max_search_results: 10,
        };
        assert_eq!(f.get_nodes(&ds, &bounds(0.0, 1.0, 0.0, 2.0)).await.unwrap(), vec![1, 0, 3]);
    }

    #[tokio::test]
    async fn test_large_search_is_reduced_to_view() {
        let ds = five_node_dataset();
        let f = LocalFiltering {
            plot_precision: 2000.0,
            max_search_results: 1,
        };
        let cache = ResultCache::new(100);
        let spec = SearchSpec::parse(r#"{"key": "k", "type": "name", "method": "text_match", "text": "tip"}"#)
            .unwrap();
        let view = bounds(0.0, 2.5, 0.0, 2.0);
        let result = f
            .single_search(SearchRequest {
                dataset: &ds,
                spec: &spec,
                bounds: &view,
                cache: &cache,
            })
            .await
            .unwrap();
        assert_eq!(result.kind, SearchResultKind::Filtered);
        assert_eq!(result.total_count, 3);
        assert_eq!(
            result.data,
            vec![SearchHit {
                node_id: 2,
                x: 2.0,
                y: 2.0,
                num_tips: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_cached_ids_are_an_error() {
        let ds = five_node_dataset();
        let cache = ResultCache::new(100);
        let spec = SearchSpec::parse(r#"{"type": "name", "method": "text_match", "text": "tip"}"#)
            .unwrap();
        cache.store(spec.cache_key().unwrap(), std::sync::Arc::new(vec![2, 9]));
        let view = bounds(0.0, 2.5, 0.0, 4.0);
        let result = filtering()
            .single_search(SearchRequest {
                dataset: &ds,
                spec: &spec,
                bounds: &view,
                cache: &cache,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tip_atts() {
        let ds = five_node_dataset();
        let f = filtering();
        assert_eq!(
            f.get_tip_atts(&ds, 0, "meta_Country").await.unwrap(),
            vec![json!("France"), json!("Spain"), json!("france")]
        );
        assert_eq!(
            f.get_tip_atts(&ds, 1, "meta_missing").await.unwrap(),
            vec![Value::Null, Value::Null]
        );
        assert!(f.get_tip_atts(&ds, 7, "name").await.is_err());
    }
}
