//! Taxonium JSONL: one header object, then one object per node.
//!
//! ```text
//! {"version": "2.0", "mutations": [{"gene": "S", "residue_pos": 484, ...}], "total_nodes": 3, "config": {}}
//! {"node_id": 0, "parent_id": 0, "x_dist": 0, "y": 1, "num_tips": 2, "mutations": []}
//! {"node_id": 1, "parent_id": 0, "x_dist": 2, "y": 0, "num_tips": 1, "mutations": [0], "name": "A", "meta_Country": "UK"}
//! ```

use serde::Deserialize;
use serde_json::{from_str, from_value, Map, Value};
use tracing::{debug, info_span};

use super::{
    dataset::{Dataset, Mutation, Node},
    StatusMessage, StatusReporter,
};
use crate::worker_error::{Result, WorkerError};

#[derive(Deserialize)]
struct JsonlHeader {
    #[serde(default)]
    mutations: Vec<Mutation>,
    #[serde(default)]
    total_nodes: Option<usize>,
    #[serde(default)]
    config: Map<String, Value>,
}

const UNSIZED_REPORT_INTERVAL: usize = 100_000;

pub fn ingest_jsonl(text: &str, report: &StatusReporter) -> Result<Dataset> {
    let span = info_span!("ingest_jsonl", bytes = text.len());
    let _span_guard = span.enter();

    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header_line) = lines
        .next()
        .ok_or_else(|| WorkerError::bad_data("the jsonl file is empty"))?;
    let header: JsonlHeader = from_str(header_line)
        .map_err(|err| WorkerError::bad_data(format!("bad jsonl header: {}", err)))?;
    report(StatusMessage::progress("Loaded header", Some(0)));

    let total = header.total_nodes.unwrap_or(0);
    let report_interval = if total > 0 {
        (total / 10).max(1)
    } else {
        UNSIZED_REPORT_INTERVAL
    };

    // Sizes in the file are untrusted, so nothing is allocated from
    // `total_nodes` or from node ids until the ids are known to be in range.
    let mut nodes = vec![];
    let mut node_muts = vec![];
    for (line_ix, line) in lines {
        let (node, muts) = parse_node_line(line)
            .map_err(|err| WorkerError::bad_data(format!("line {}: {}", line_ix + 1, err.message())))?;
        if !muts.is_empty() {
            node_muts.push((node.node_id, muts));
        }
        nodes.push(node);

        if nodes.len() % report_interval == 0 {
            let percentage = if total > 0 {
                Some(((nodes.len() * 100) / total).min(100) as u32)
            } else {
                None
            };
            report(StatusMessage::progress("Loading nodes", percentage));
        }
    }

    // Lines may be ordered by rank rather than id, so mutation lists are
    // placed by id once every node has been read.
    let mut node_to_mut = vec![vec![]; nodes.len()];
    for (node_id, muts) in node_muts {
        let slot = node_to_mut.get_mut(node_id).ok_or_else(|| {
            WorkerError::bad_data(format!(
                "node id {} is out of range for a tree of {} nodes",
                node_id,
                nodes.len()
            ))
        })?;
        *slot = muts;
    }
    debug!(nodes = nodes.len(), mutations = header.mutations.len(), "parsed jsonl");

    report(StatusMessage::progress("Indexing tree", Some(100)));
    Dataset::build(nodes, header.mutations, node_to_mut, header.config)
}

fn parse_node_line(line: &str) -> Result<(Node, Vec<usize>)> {
    let mut value: Value = from_str(line)?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| WorkerError::bad_data("node line is not an object"))?;
    let muts = match obj.remove("mutations") {
        Some(Value::Null) | None => vec![],
        Some(m) => from_value(m)?,
    };
    let node: Node = from_value(value)?;
    Ok((node, muts))
}
