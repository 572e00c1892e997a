//! Derives the UI configuration (search fields, color-by options, initial
//! camera) from the shape of the loaded dataset.

use std::collections::HashSet;

use itertools::Itertools;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{config::WorkerConfig, file_format::Dataset};

lazy_static! {
    /// Node fields that are structure rather than displayable metadata.
    static ref NOT_DISPLAYED: HashSet<&'static str> = [
        "parent_id",
        "node_id",
        "x",
        "x_dist",
        "x_time",
        "y",
        "mutations",
        "name",
        "num_tips",
        "time_x",
        "clades",
        "is_tip",
    ]
    .into_iter()
    .collect();
}

const DEFAULT_COLOR_FIELD: &str = "meta_pangolin_lineage";
const NO_COLOR: &str = "None";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchType {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Set for text searches so the UI renders its filter controls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controls: Option<bool>,
}

impl SearchType {
    fn for_field(name: &str) -> SearchType {
        let kind = search_kind(name);
        SearchType {
            name: name.to_string(),
            label: pretty_name(name),
            kind,
            controls: kind.contains("text").then_some(true),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `meta_country` becomes `Country`, anything else just gets a capital.
pub fn pretty_name(field: &str) -> String {
    match field.strip_prefix("meta_") {
        Some(rest) => capitalize(rest),
        None => capitalize(field),
    }
}

pub fn search_kind(field: &str) -> &'static str {
    match field {
        "mutation" => "mutation",
        "genotype" => "genotype",
        "num_tips" => "number",
        "genbank" => "text_per_line",
        "revertant" => "revertant",
        "meta_Lineage" => "text_exact",
        "boolean" => "boolean",
        _ => "text_match",
    }
}

/// Metadata keys of the first node.  Only that node is inspected, so a
/// column missing from it is not offered even if later nodes carry it.
fn keys_to_display(dataset: &Dataset) -> Vec<String> {
    dataset
        .nodes
        .first()
        .map(|node| {
            node.attributes
                .keys()
                .filter(|key| !NOT_DISPLAYED.contains(key.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Same single-node assumption as `keys_to_display`.
fn x_accessors(dataset: &Dataset) -> Vec<&'static str> {
    match dataset.nodes.first() {
        Some(node) if node.x_time.is_some() => vec!["x_dist", "x_time"],
        _ => vec!["x_dist"],
    }
}

fn synthesize(dataset: &Dataset, worker_config: &WorkerConfig) -> Value {
    let has_mutations = !dataset.mutations.is_empty();
    let keys = keys_to_display(dataset);

    let genes: Vec<&str> = dataset
        .mutations
        .iter()
        .filter_map(|m| m.gene.as_deref())
        .filter(|gene| !gene.is_empty())
        .unique()
        .sorted()
        .collect();

    let mut search_fields: Vec<&str> = vec!["name"];
    search_fields.extend(keys.iter().map(String::as_str));
    if has_mutations {
        search_fields.extend(["mutation", "genotype"]);
    }
    if !dataset.root_mutations.is_empty() {
        search_fields.push("revertant");
    }
    search_fields.push("num_tips");
    if search_fields.len() > 1 {
        search_fields.push("boolean");
    }
    let search_types: Vec<SearchType> = search_fields
        .iter()
        .map(|field| SearchType::for_field(field))
        .collect();

    let mut color_by_options: Vec<&str> = keys.iter().map(String::as_str).collect();
    if has_mutations {
        color_by_options.push("genotype");
    }
    color_by_options.push(NO_COLOR);
    let default_color_by = if color_by_options.contains(&DEFAULT_COLOR_FIELD) {
        DEFAULT_COLOR_FIELD
    } else {
        color_by_options[0]
    };

    let x_extent = dataset.x_dist_extent;
    let mut config = json!({
        "num_nodes": dataset.nodes.len(),
        "initial_x": x_extent.midpoint(),
        "initial_y": dataset.y_extent.midpoint(),
        "initial_zoom": worker_config.initial_zoom,
        "genes": genes,
        "rootMutations": dataset.root_mutations,
        "rootId": dataset.root_id,
        "name_accessor": "name",
        "x_accessors": x_accessors(dataset),
        "keys_to_display": keys,
        "search_types": search_types,
    });
    if let Value::Object(map) = &mut config {
        if color_by_options.len() < 2 {
            map.insert("colorMapping".to_string(), json!({ "None": [50, 50, 150] }));
        }
        map.insert("colorBy".to_string(), json!({ "colorByOptions": color_by_options }));
        map.insert("defaultColorByField".to_string(), json!(default_color_by));
        map.insert("mutations".to_string(), json!(dataset.mutations));

        // Dataset-supplied values win, key by key.
        for (key, value) in &dataset.overwrite_config {
            map.insert(key.clone(), value.clone());
        }
    }
    debug!(
        num_nodes = dataset.nodes.len(),
        overrides = dataset.overwrite_config.len(),
        "derived config"
    );
    config
}

/// The derived config for `dataset`, computed on first use and reused for as
/// long as the dataset stays loaded.
pub fn get_config(dataset: &Dataset, worker_config: &WorkerConfig) -> Value {
    dataset
        .derived_config
        .get_or_init(|| synthesize(dataset, worker_config))
        .clone()
}
