use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
};

use tracing::{trace, trace_span};

use crate::{
    file_format::{
        search_spec::{BooleanMethod, SearchMethod, SearchSpec},
        Dataset, Mutation,
    },
    worker::result_cache::{CachedIds, ResultCache},
    worker_error::{Result, WorkerError},
};

const ANY_RESIDUE: &str = "any";

/// All node ids matching `spec`, ascending.  Results are cached under the
/// spec's canonical form, and boolean searches cache each subspec too.
pub fn search_node_ids(dataset: &Dataset, spec: &SearchSpec, cache: &ResultCache) -> Result<CachedIds> {
    let cache_key = spec.cache_key()?;
    if let Some(hit) = cache.retrieve(&cache_key) {
        trace!(cache_key = cache_key.as_str(), matches = hit.len(), "search cache hit");
        return Ok(hit);
    }

    let span = trace_span!("search_uncached", field = spec.field.as_str(), method = ?spec.method);
    let _span_guard = span.enter();

    let ids = Arc::new(match_uncached(dataset, spec, cache)?);
    trace!(matches = ids.len());
    cache.store(cache_key, ids.clone());
    Ok(ids)
}

fn require<'a, T>(value: &'a Option<T>, what: &str, spec: &SearchSpec) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| {
        WorkerError::bad_request(format!("{:?} search is missing `{}`", spec.method, what))
    })
}

fn match_uncached(dataset: &Dataset, spec: &SearchSpec, cache: &ResultCache) -> Result<Vec<usize>> {
    let nodes = &dataset.nodes;
    let field = spec.field.as_str();
    let min_tips = spec.min_tips.unwrap_or(0);

    let matched = match spec.method {
        SearchMethod::TextMatch | SearchMethod::TextExact => {
            let needle = spec.text.as_deref().unwrap_or("").to_lowercase();
            if needle.is_empty() {
                return Ok(vec![]);
            }
            let exact = spec.method == SearchMethod::TextExact;
            nodes
                .iter()
                .filter(|node| match node.text_attribute(field) {
                    Some(value) if exact => value.to_lowercase() == needle,
                    Some(value) => value.to_lowercase().contains(&needle),
                    None => false,
                })
                .map(|node| node.node_id)
                .collect()
        }
        SearchMethod::TextPerLine => {
            let wanted: HashSet<&str> = spec
                .text
                .as_deref()
                .unwrap_or("")
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();
            nodes
                .iter()
                .filter(|node| {
                    node.text_attribute(field)
                        .map_or(false, |value| wanted.contains(value.trim()))
                })
                .map(|node| node.node_id)
                .collect()
        }
        SearchMethod::Number => {
            let threshold = *require(&spec.number, "number", spec)?;
            let method = *require(&spec.number_method, "number_method", spec)?;
            nodes
                .iter()
                .filter(|node| {
                    node.numeric_attribute(field)
                        .map_or(false, |value| method.compare(value, threshold))
                })
                .map(|node| node.node_id)
                .collect()
        }
        SearchMethod::Mutation => {
            let gene = require(&spec.gene, "gene", spec)?;
            let position = *require(&spec.position, "position", spec)?;
            let residue = spec.new_residue.as_deref().unwrap_or(ANY_RESIDUE);
            let wanted = mutation_ids(&dataset.mutations, |m| {
                m.is_at(gene, position) && (residue == ANY_RESIDUE || m.new_residue == residue)
            });
            nodes_carrying(dataset, &wanted, min_tips)
        }
        SearchMethod::Revertant => {
            let gene = spec.gene.as_deref().filter(|g| *g != ANY_RESIDUE);
            let reverted: Vec<&Mutation> = dataset
                .root_mutations
                .iter()
                .map(|ix| &dataset.mutations[*ix])
                .filter(|root| gene.map_or(true, |g| root.gene.as_deref() == Some(g)))
                .collect();
            let wanted = mutation_ids(&dataset.mutations, |m| {
                reverted.iter().any(|root| {
                    root.gene == m.gene
                        && root.residue_pos == m.residue_pos
                        && m.new_residue == root.previous_residue
                })
            });
            nodes_carrying(dataset, &wanted, min_tips)
        }
        SearchMethod::Genotype => {
            let gene = require(&spec.gene, "gene", spec)?;
            let position = *require(&spec.position, "position", spec)?;
            let residues: HashSet<&str> = require(&spec.new_residue, "new_residue", spec)?
                .split(',')
                .map(str::trim)
                .collect();
            let genotypes = genotypes_at(dataset, gene, position);
            nodes
                .iter()
                .filter(|node| node.num_tips > min_tips)
                .filter(|node| {
                    genotypes[node.node_id].map_or(false, |residue| residues.contains(residue))
                })
                .map(|node| node.node_id)
                .collect()
        }
        SearchMethod::Boolean => boolean_match(dataset, spec, cache)?,
    };
    Ok(matched)
}

fn mutation_ids(mutations: &[Mutation], pred: impl Fn(&Mutation) -> bool) -> HashSet<usize> {
    mutations
        .iter()
        .enumerate()
        .filter(|(_, m)| pred(m))
        .map(|(ix, _)| ix)
        .collect()
}

fn nodes_carrying(dataset: &Dataset, wanted: &HashSet<usize>, min_tips: u64) -> Vec<usize> {
    if wanted.is_empty() {
        return vec![];
    }
    dataset
        .nodes
        .iter()
        .filter(|node| node.num_tips > min_tips)
        .filter(|node| dataset.node_to_mut[node.node_id].iter().any(|ix| wanted.contains(ix)))
        .map(|node| node.node_id)
        .collect()
}

/// The residue each node carries at `gene:position`, found by walking up to
/// the nearest ancestor (or self) whose branch mutates that site.  Nodes
/// without such an ancestor carry the reference residue, taken from the
/// `previous_residue` of the first recorded mutation at the site.
fn genotypes_at<'a>(dataset: &'a Dataset, gene: &str, position: i64) -> Vec<Option<&'a str>> {
    let site_mutation = |node_id: usize| {
        dataset
            .mutations_of(node_id)
            .filter(|m| m.is_at(gene, position))
            .last()
            .map(|m| m.new_residue.as_str())
    };
    let reference = dataset
        .mutations
        .iter()
        .find(|m| m.is_at(gene, position))
        .map(|m| m.previous_residue.as_str());

    let mut resolved: Vec<Option<Option<&str>>> = vec![None; dataset.nodes.len()];
    for start in 0..dataset.nodes.len() {
        let mut path = vec![];
        let mut cur = start;
        let residue = loop {
            if let Some(known) = resolved[cur] {
                break known;
            }
            if let Some(residue) = site_mutation(cur) {
                break Some(residue);
            }
            path.push(cur);
            let parent = dataset.nodes[cur].parent_id;
            if parent == cur {
                break reference;
            }
            cur = parent;
        };
        if resolved[cur].is_none() {
            resolved[cur] = Some(residue);
        }
        for id in path {
            resolved[id] = Some(residue);
        }
    }
    resolved.into_iter().map(Option::flatten).collect()
}

fn boolean_match(dataset: &Dataset, spec: &SearchSpec, cache: &ResultCache) -> Result<Vec<usize>> {
    let method = *require(&spec.boolean_method, "boolean_method", spec)?;
    let mut sub_results = spec
        .subspecs
        .iter()
        .map(|sub| search_node_ids(dataset, sub, cache));
    let first = match sub_results.next() {
        Some(first) => first?,
        None => return Ok(vec![]),
    };

    match method {
        BooleanMethod::And => {
            let mut kept: Vec<usize> = first.to_vec();
            for other in sub_results {
                let other: HashSet<usize> = other?.iter().copied().collect();
                kept.retain(|id| other.contains(id));
            }
            Ok(kept)
        }
        BooleanMethod::Or => {
            let mut union: BTreeSet<usize> = first.iter().copied().collect();
            for other in sub_results {
                union.extend(other?.iter().copied());
            }
            Ok(union.into_iter().collect())
        }
        BooleanMethod::Not => {
            let mut excluded = HashSet::new();
            for other in sub_results {
                excluded.extend(other?.iter().copied());
            }
            Ok(first.iter().copied().filter(|id| !excluded.contains(id)).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    use crate::file_format::dataset::test_support::{five_node_dataset, mutation, node};

    fn run(raw: &str) -> Vec<usize> {
        let ds = five_node_dataset();
        let cache = ResultCache::new(1000);
        let spec = SearchSpec::parse(raw).unwrap();
        search_node_ids(&ds, &spec, &cache).unwrap().to_vec()
    }

    #[test]
    fn test_text_searches() {
        assert_eq!(run(r#"{"type": "meta_Country", "method": "text_match", "text": "FRA"}"#), vec![2, 4]);
        assert_eq!(run(r#"{"type": "meta_Country", "method": "text_exact", "text": "uk"}"#), vec![0, 1]);
        assert_eq!(run(r#"{"type": "meta_Country", "method": "text_match", "text": ""}"#), Vec::<usize>::new());
        assert_eq!(
            run(r#"{"type": "name", "method": "text_per_line", "text": "tipA\n  tipC \n\n"}"#),
            vec![2, 4]
        );
    }

    #[test]
    fn test_number_search() {
        assert_eq!(
            run(r#"{"type": "num_tips", "method": "number", "number": 2, "number_method": ">="}"#),
            vec![0, 1]
        );
        let ds = five_node_dataset();
        let spec = SearchSpec::parse(r#"{"type": "num_tips", "method": "number", "number": 2}"#).unwrap();
        assert!(search_node_ids(&ds, &spec, &ResultCache::new(10)).is_err());
    }

    #[test]
    fn test_mutation_search() {
        assert_eq!(
            run(r#"{"type": "mutation", "method": "mutation", "gene": "S", "position": 484, "new_residue": "K"}"#),
            vec![1, 2]
        );
        // Of the carriers of either S:484 change, only node 1 has more than one tip.
        assert_eq!(
            run(r#"{"type": "mutation", "method": "mutation", "gene": "S", "position": 484, "new_residue": "any", "min_tips": 1}"#),
            vec![1]
        );
    }

    /// Root carries S:484 E>K. Node 1 (two tips) and tip 4 revert it with
    /// S:484 K>E; tip 3 has an unrelated N:13 change.
    fn reverting_dataset() -> Dataset {
        let mut nodes = vec![
            node(0, 0, 0.0, 0.0, json!({})),
            node(1, 0, 1.0, 1.0, json!({})),
            node(2, 1, 2.0, 2.0, json!({})),
            node(3, 1, 2.0, 3.0, json!({})),
            node(4, 0, 1.0, 4.0, json!({})),
        ];
        nodes[0].num_tips = 3;
        nodes[1].num_tips = 2;
        let mutations = vec![
            mutation(Some("S"), 484, "E", "K"),
            mutation(Some("S"), 484, "K", "E"),
            mutation(Some("N"), 13, "P", "L"),
        ];
        let node_to_mut = vec![vec![0], vec![1], vec![], vec![2], vec![1]];
        Dataset::build(nodes, mutations, node_to_mut, Map::new()).unwrap()
    }

    #[test]
    fn test_revertant_search() {
        let ds = reverting_dataset();
        assert_eq!(ds.root_mutations, vec![0]);
        let run = |raw: &str| {
            let spec = SearchSpec::parse(raw).unwrap();
            search_node_ids(&ds, &spec, &ResultCache::new(100)).unwrap().to_vec()
        };
        assert_eq!(run(r#"{"type": "revertant", "method": "revertant"}"#), vec![1, 4]);
        assert_eq!(
            run(r#"{"type": "revertant", "method": "revertant", "min_tips": 1}"#),
            vec![1]
        );
        assert_eq!(
            run(r#"{"type": "revertant", "method": "revertant", "gene": "S"}"#),
            vec![1, 4]
        );
        assert_eq!(
            run(r#"{"type": "revertant", "method": "revertant", "gene": "N"}"#),
            Vec::<usize>::new()
        );
    }

    #[test]
    fn test_genotype_search() {
        // S:484 is E at the root, K from node 1 down (nodes 1, 2, 3).
        assert_eq!(
            run(r#"{"type": "genotype", "method": "genotype", "gene": "S", "position": 484, "new_residue": "K"}"#),
            vec![1, 2, 3]
        );
        assert_eq!(
            run(r#"{"type": "genotype", "method": "genotype", "gene": "S", "position": 484, "new_residue": "E"}"#),
            vec![0, 4]
        );
    }

    #[test]
    fn test_boolean_search() {
        let uk = r#"{"type": "meta_Country", "method": "text_exact", "text": "uk"}"#;
        let big = r#"{"type": "num_tips", "method": "number", "number": 2, "number_method": ">"}"#;
        let france = r#"{"type": "meta_Country", "method": "text_match", "text": "france"}"#;
        let spec = |method: &str, subs: &[&str]| {
            format!(
                r#"{{"type": "boolean", "method": "boolean", "boolean_method": "{}", "subspecs": [{}]}}"#,
                method,
                subs.join(",")
            )
        };
        assert_eq!(run(&spec("and", &[uk, big])), vec![0]);
        assert_eq!(run(&spec("or", &[france, uk])), vec![0, 1, 2, 4]);
        assert_eq!(run(&spec("not", &[uk, big])), vec![1]);
        assert_eq!(run(&spec("and", &[])), Vec::<usize>::new());
    }

    #[test]
    fn test_results_are_cached_per_canonical_spec() {
        let ds = five_node_dataset();
        let cache = ResultCache::new(1000);
        let a = SearchSpec::parse(r#"{"key": "a", "type": "name", "method": "text_match", "text": "tip"}"#).unwrap();
        let b = SearchSpec::parse(r#"{"key": "b", "type": "name", "method": "text_match", "text": "tip"}"#).unwrap();
        let first = search_node_ids(&ds, &a, &cache).unwrap();
        let second = search_node_ids(&ds, &b, &cache).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }
}
