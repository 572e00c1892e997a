use std::{borrow::Cow, ops::Range, sync::OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    worker::result_cache::ResultCache,
    worker_error::{Result, WorkerError},
};

/// Which horizontal coordinate system a query is expressed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum XAxis {
    /// Cumulative branch length (mutations or substitutions).
    #[default]
    #[serde(rename = "x_dist")]
    Distance,
    /// Dated position, only present for time-calibrated trees.
    #[serde(rename = "x_time")]
    Time,
}

impl XAxis {
    pub fn field_name(&self) -> &'static str {
        match self {
            XAxis::Distance => "x_dist",
            XAxis::Time => "x_time",
        }
    }
}

/// One vertex of the tree.  Everything that isn't one of the structural fields
/// lands in `attributes` (typically `meta_*` columns) in file order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: usize,
    pub parent_id: usize,
    pub x_dist: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_time: Option<f64>,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub num_tips: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_tip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clades: Option<Value>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Node {
    pub fn x(&self, axis: XAxis) -> f64 {
        match axis {
            XAxis::Distance => self.x_dist,
            XAxis::Time => self.x_time.unwrap_or(self.x_dist),
        }
    }

    /// Look up a field by its wire name, structural or not.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            "node_id" => Some(json!(self.node_id)),
            "parent_id" => Some(json!(self.parent_id)),
            "x_dist" => Some(json!(self.x_dist)),
            "x_time" => self.x_time.map(|x| json!(x)),
            "y" => Some(json!(self.y)),
            "name" => self.name.as_ref().map(|n| json!(n)),
            "num_tips" => Some(json!(self.num_tips)),
            "is_tip" => self.is_tip.map(|t| json!(t)),
            "clades" => self.clades.clone(),
            _ => self.attributes.get(key).cloned(),
        }
    }

    /// Textual view of a field for text searches.  Numbers are stringified so
    /// that e.g. a numeric `meta_year` column can still be text-matched.
    pub fn text_attribute(&self, key: &str) -> Option<Cow<'_, str>> {
        match key {
            "name" => self.name.as_deref().map(Cow::Borrowed),
            _ => match self.attributes.get(key)? {
                Value::String(s) => Some(Cow::Borrowed(s.as_str())),
                Value::Number(n) => Some(Cow::Owned(n.to_string())),
                Value::Bool(b) => Some(Cow::Owned(b.to_string())),
                _ => None,
            },
        }
    }

    pub fn numeric_attribute(&self, key: &str) -> Option<f64> {
        match key {
            "num_tips" => Some(self.num_tips as f64),
            "x_dist" => Some(self.x_dist),
            "x_time" => self.x_time,
            "y" => Some(self.y),
            _ => match self.attributes.get(key)? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            },
        }
    }
}

/// A single genetic change.  `gene` may be null in real datasets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(default)]
    pub gene: Option<String>,
    #[serde(default)]
    pub residue_pos: i64,
    #[serde(default)]
    pub previous_residue: String,
    #[serde(default)]
    pub new_residue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_id: Option<usize>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Mutation {
    pub fn is_at(&self, gene: &str, position: i64) -> bool {
        self.residue_pos == position && self.gene.as_deref() == Some(gene)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Extent {
    pub min: f64,
    pub max: f64,
}

impl Extent {
    fn of(values: impl Iterator<Item = f64>) -> Option<Extent> {
        values.fold(None, |acc: Option<Extent>, v| match acc {
            None => Some(Extent { min: v, max: v }),
            Some(e) => Some(Extent {
                min: e.min.min(v),
                max: e.max.max(v),
            }),
        })
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

/// Node ids ordered by rank (`y`), with the ranks alongside so range lookups
/// are a pair of binary searches.
#[derive(Debug, Default)]
pub struct YIndex {
    pub order: Vec<usize>,
    pub positions: Vec<f64>,
}

impl YIndex {
    pub fn build(nodes: &[Node]) -> YIndex {
        let mut order: Vec<usize> = (0..nodes.len()).collect();
        order.sort_by(|a, b| nodes[*a].y.total_cmp(&nodes[*b].y).then(a.cmp(b)));
        let positions = order.iter().map(|id| nodes[*id].y).collect();
        YIndex { order, positions }
    }

    /// Index range into `order` covering ranks in the inclusive `[min_y, max_y]`.
    pub fn range(&self, min_y: f64, max_y: f64) -> Range<usize> {
        let start = self.positions.partition_point(|y| *y < min_y);
        let end = self.positions.partition_point(|y| *y <= max_y);
        start..end.max(start)
    }
}

/// Everything ingestion produces.  Immutable once built; the worker shares it
/// behind an `Arc`.
#[derive(Debug)]
pub struct Dataset {
    pub nodes: Vec<Node>,
    pub y_index: YIndex,
    pub children: Vec<Vec<usize>>,
    pub mutations: Vec<Mutation>,
    pub node_to_mut: Vec<Vec<usize>>,
    pub root_mutations: Vec<usize>,
    pub root_id: usize,
    pub x_dist_extent: Extent,
    pub x_time_extent: Option<Extent>,
    pub y_extent: Extent,
    /// Dataset-supplied config values, merged over the derived config.
    pub overwrite_config: Map<String, Value>,
    pub(crate) derived_config: OnceLock<Value>,
    result_cache: OnceLock<ResultCache>,
}

impl Dataset {
    /// Validate and index freshly ingested nodes.  Nodes may arrive in any
    /// order but their ids must be exactly `0..nodes.len()`.
    pub fn build(
        mut nodes: Vec<Node>,
        mutations: Vec<Mutation>,
        mut node_to_mut: Vec<Vec<usize>>,
        overwrite_config: Map<String, Value>,
    ) -> Result<Dataset> {
        nodes.sort_by_key(|n| n.node_id);
        for (i, node) in nodes.iter().enumerate() {
            if node.node_id != i {
                return Err(WorkerError::bad_data(format!(
                    "node ids must be dense: expected {} but found {}",
                    i, node.node_id
                )));
            }
            if node.parent_id >= nodes.len() {
                return Err(WorkerError::bad_data(format!(
                    "node {} has parent {} outside of the tree",
                    node.node_id, node.parent_id
                )));
            }
        }

        if node_to_mut.len() > nodes.len() {
            return Err(WorkerError::bad_data(format!(
                "mutations listed for {} nodes but the tree has {}",
                node_to_mut.len(),
                nodes.len()
            )));
        }
        node_to_mut.resize(nodes.len(), vec![]);
        for (node_id, muts) in node_to_mut.iter().enumerate() {
            if let Some(bad) = muts.iter().find(|m| **m >= mutations.len()) {
                return Err(WorkerError::bad_data(format!(
                    "node {} references mutation {} but only {} exist",
                    node_id,
                    bad,
                    mutations.len()
                )));
            }
        }

        let root_id = match nodes.iter().find(|n| n.parent_id == n.node_id) {
            Some(root) => root.node_id,
            None if nodes.is_empty() => 0,
            None => return Err(WorkerError::bad_data("tree has no root node")),
        };

        let mut children = vec![vec![]; nodes.len()];
        for node in &nodes {
            if node.node_id != node.parent_id {
                children[node.parent_id].push(node.node_id);
            }
        }

        let mut dataset = Dataset {
            nodes,
            y_index: YIndex::default(),
            children,
            mutations,
            node_to_mut,
            root_mutations: vec![],
            root_id,
            x_dist_extent: Extent::default(),
            x_time_extent: None,
            y_extent: Extent::default(),
            overwrite_config,
            derived_config: OnceLock::new(),
            result_cache: OnceLock::new(),
        };
        // Every parent chain has to end at the root; anything else is a cycle
        // that later ancestor walks would never escape.
        if !dataset.nodes.is_empty() && dataset.subtree(root_id).len() != dataset.nodes.len() {
            return Err(WorkerError::bad_data("some nodes are not connected to the root"));
        }
        dataset.index();
        Ok(dataset)
    }

    fn index(&mut self) {
        let nodes = &self.nodes;
        self.x_dist_extent = Extent::of(nodes.iter().map(|n| n.x_dist)).unwrap_or_default();
        self.x_time_extent = Extent::of(nodes.iter().filter_map(|n| n.x_time));
        self.y_extent = Extent::of(nodes.iter().map(|n| n.y)).unwrap_or_default();
        self.y_index = YIndex::build(nodes);
        self.root_mutations = self.node_to_mut.get(self.root_id).cloned().unwrap_or_default();
    }

    /// Search results computed against this dataset.  The cache is created on
    /// first use and dropped with the dataset, so cached node ids always index
    /// into `nodes`.
    pub fn result_cache(&self, budget: usize) -> &ResultCache {
        self.result_cache.get_or_init(|| ResultCache::new(budget))
    }

    pub fn node(&self, node_id: usize) -> Result<&Node> {
        self.nodes.get(node_id).ok_or_else(|| {
            WorkerError::bad_request(format!(
                "no node {} in a tree of {} nodes",
                node_id,
                self.nodes.len()
            ))
        })
    }

    pub fn x_extent(&self, axis: XAxis) -> Extent {
        match axis {
            XAxis::Distance => self.x_dist_extent,
            XAxis::Time => self.x_time_extent.unwrap_or(self.x_dist_extent),
        }
    }

    pub fn is_leaf(&self, node_id: usize) -> bool {
        self.children.get(node_id).map_or(true, Vec::is_empty)
    }

    /// Mutations on the branch leading to `node_id`, in stored order.
    pub fn mutations_of(&self, node_id: usize) -> impl Iterator<Item = &Mutation> + '_ {
        self.node_to_mut
            .get(node_id)
            .into_iter()
            .flatten()
            .map(move |ix| &self.mutations[*ix])
    }

    /// Preorder walk of the subtree rooted at `node_id`, including itself.
    pub fn subtree(&self, node_id: usize) -> Vec<usize> {
        let mut out = vec![];
        let mut stack = vec![node_id];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children[id].iter().rev());
        }
        out
    }
}
