use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::{
    abstract_filtering::{EffectiveBounds, TreeFiltering},
    file_format::{Dataset, Node, XAxis},
    worker_error::Result,
};

/// A viewport as sent by the UI.  Any bound may be missing or garbage (the UI
/// sometimes sends `null` or `"NaN"` while the camera settles); those fall
/// back to the dataset extent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryBounds {
    #[serde(default, deserialize_with = "lenient_number")]
    pub min_x: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub max_x: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub min_y: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub max_y: Option<f64>,
    #[serde(rename = "xType", default, skip_serializing_if = "Option::is_none")]
    pub x_type: Option<XAxis>,
}

fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let number = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(number.filter(|n| n.is_finite()))
}

/// Fill in missing bounds from the dataset extents and keep Y within the
/// rank range.  X is left alone so the view can zoom out past the tree.
pub fn resolve_bounds(dataset: &Dataset, bounds: Option<&QueryBounds>) -> EffectiveBounds {
    let supplied = bounds.cloned().unwrap_or_default();
    let x_axis = supplied.x_type.unwrap_or_default();
    let x_extent = dataset.x_extent(x_axis);
    let y_extent = dataset.y_extent;

    let effective = EffectiveBounds {
        min_x: supplied.min_x.unwrap_or(x_extent.min),
        max_x: supplied.max_x.unwrap_or(x_extent.max),
        min_y: supplied.min_y.unwrap_or(y_extent.min).max(y_extent.min),
        max_y: supplied.max_y.unwrap_or(y_extent.max).min(y_extent.max),
        x_axis,
    };
    trace!(?effective, "resolved bounds");
    effective
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryResult {
    pub nodes: Vec<Node>,
}

pub async fn query_nodes(
    dataset: &Dataset,
    filtering: &dyn TreeFiltering,
    bounds: Option<&QueryBounds>,
) -> Result<QueryResult> {
    let effective = resolve_bounds(dataset, bounds);
    let ids = filtering.get_nodes(dataset, &effective).await?;
    let nodes = ids
        .into_iter()
        .map(|id| dataset.node(id).cloned())
        .collect::<Result<Vec<_>>>()?;
    Ok(QueryResult { nodes })
}
