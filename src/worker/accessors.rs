use serde_json::{to_value, Value};

use crate::{
    abstract_filtering::TreeFiltering,
    file_format::Dataset,
    worker_error::{Result, WorkerError},
};

/// A copy of the node's record with its branch mutations resolved, in the
/// order they are stored for the node.
pub fn get_details(dataset: &Dataset, node_id: usize) -> Result<Value> {
    let node = dataset.node(node_id)?;
    let mut details = to_value(node)?;
    let mutations = to_value(dataset.mutations_of(node_id).collect::<Vec<_>>())?;
    match details.as_object_mut() {
        Some(record) => {
            record.insert("mutations".to_string(), mutations);
        }
        None => {
            return Err(WorkerError::invariant(format!(
                "node {} did not serialize to an object",
                node_id
            )))
        }
    }
    Ok(details)
}

/// Values of `key` across the tips below `node_id`.
pub async fn get_list(
    dataset: &Dataset,
    filtering: &dyn TreeFiltering,
    node_id: usize,
    key: &str,
) -> Result<Vec<Value>> {
    dataset.node(node_id)?;
    filtering.get_tip_atts(dataset, node_id, key).await
}
