//! Minimal Newick reader producing a laid-out dataset.
//!
//! Parsing is iterative so that deep, ladder-like trees from large
//! phylogenies don't overflow the stack.

use serde_json::Map;
use tracing::{debug, info_span};

use super::{
    dataset::{Dataset, Node},
    StatusMessage, StatusReporter,
};
use crate::worker_error::{Result, WorkerError};

struct RawNode {
    parent: Option<usize>,
    name: Option<String>,
    length: f64,
}

struct NewickParser<'a> {
    src: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

impl<'a> NewickParser<'a> {
    fn new(text: &'a str) -> Self {
        NewickParser {
            src: text.as_bytes(),
            pos: 0,
            nodes: vec![],
        }
    }

    fn new_node(&mut self, parent: Option<usize>) -> usize {
        self.nodes.push(RawNode {
            parent,
            name: None,
            length: 0.0,
        });
        self.nodes.len() - 1
    }

    fn error(&self, what: &str) -> WorkerError {
        WorkerError::bad_data(format!("newick: {} at byte {}", what, self.pos))
    }

    fn parse(mut self) -> Result<Vec<RawNode>> {
        // Internal nodes whose closing paren we haven't reached yet.
        let mut open: Vec<usize> = vec![];
        // The node any following label or branch length applies to.
        let mut current: Option<usize> = None;
        let mut expecting_node = true;

        while self.pos < self.src.len() {
            match self.src[self.pos] {
                b'(' => {
                    let id = self.new_node(open.last().copied());
                    open.push(id);
                    current = None;
                    expecting_node = true;
                    self.pos += 1;
                }
                b',' | b')' => {
                    if expecting_node {
                        // Empty leaf like the second child in `(A,)`.
                        self.new_node(open.last().copied());
                    }
                    if self.src[self.pos] == b')' {
                        current = Some(open.pop().ok_or_else(|| self.error("unbalanced ')'"))?);
                        expecting_node = false;
                    } else {
                        if open.is_empty() {
                            return Err(self.error("',' outside of a clade"));
                        }
                        current = None;
                        expecting_node = true;
                    }
                    self.pos += 1;
                }
                b':' => {
                    self.pos += 1;
                    let target = self.current_or_leaf(&mut current, &mut expecting_node, &open);
                    let length = self.parse_number()?;
                    self.nodes[target].length = length;
                }
                b';' => break,
                b'[' => self.skip_comment()?,
                c if c.is_ascii_whitespace() => self.pos += 1,
                _ => {
                    let target = self.current_or_leaf(&mut current, &mut expecting_node, &open);
                    let label = self.parse_label()?;
                    self.nodes[target].name = Some(label);
                }
            }
        }

        if !open.is_empty() {
            return Err(self.error("unclosed '('"));
        }
        if self.nodes.is_empty() {
            return Err(self.error("no tree"));
        }
        Ok(self.nodes)
    }

    fn current_or_leaf(
        &mut self,
        current: &mut Option<usize>,
        expecting_node: &mut bool,
        open: &[usize],
    ) -> usize {
        match current {
            Some(id) if !*expecting_node => *id,
            _ => {
                let id = self.new_node(open.last().copied());
                *current = Some(id);
                *expecting_node = false;
                id
            }
        }
    }

    fn skip_comment(&mut self) -> Result<()> {
        while self.pos < self.src.len() && self.src[self.pos] != b']' {
            self.pos += 1;
        }
        if self.pos == self.src.len() {
            return Err(self.error("unterminated comment"));
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_number(&mut self) -> Result<f64> {
        let start = self.pos;
        while self.pos < self.src.len()
            && matches!(self.src[self.pos], b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E')
        {
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.src[start..self.pos]).map_err(|_| self.error("bad utf-8"))?;
        raw.parse().map_err(|_| self.error("bad branch length"))
    }

    fn parse_label(&mut self) -> Result<String> {
        if self.src[self.pos] == b'\'' {
            // Quoted label; a doubled quote is a literal quote.
            let mut bytes = vec![];
            self.pos += 1;
            loop {
                match self.src.get(self.pos) {
                    None => return Err(self.error("unterminated quoted label")),
                    Some(b'\'') if self.src.get(self.pos + 1) == Some(&b'\'') => {
                        bytes.push(b'\'');
                        self.pos += 2;
                    }
                    Some(b'\'') => {
                        self.pos += 1;
                        break;
                    }
                    Some(b) => {
                        bytes.push(*b);
                        self.pos += 1;
                    }
                }
            }
            return String::from_utf8(bytes).map_err(|_| self.error("bad utf-8"));
        }

        let start = self.pos;
        while self.pos < self.src.len()
            && !matches!(self.src[self.pos], b'(' | b')' | b',' | b':' | b';' | b'[')
            && !self.src[self.pos].is_ascii_whitespace()
        {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .map(str::to_string)
            .map_err(|_| self.error("bad utf-8"))
    }
}

/// Lay out parsed nodes: x is cumulative branch length, tips take
/// consecutive ranks in reading order and internal nodes sit at the mean rank
/// of their children.  Ids are preorder, so parents always precede children.
fn lay_out(raw: Vec<RawNode>) -> Vec<Node> {
    let n = raw.len();
    let mut child_count = vec![0usize; n];
    for node in &raw {
        if let Some(p) = node.parent {
            child_count[p] += 1;
        }
    }

    let mut x = vec![0.0f64; n];
    for id in 0..n {
        if let Some(p) = raw[id].parent {
            x[id] = x[p] + raw[id].length;
        }
    }

    let mut y = vec![0.0f64; n];
    let mut y_sum = vec![0.0f64; n];
    let mut num_tips = vec![0u64; n];
    let mut next_rank = 0.0;
    for id in 0..n {
        if child_count[id] == 0 {
            y[id] = next_rank;
            next_rank += 1.0;
        }
    }
    for id in (0..n).rev() {
        if child_count[id] == 0 {
            num_tips[id] = 1;
        } else {
            y[id] = y_sum[id] / child_count[id] as f64;
        }
        if let Some(p) = raw[id].parent {
            y_sum[p] += y[id];
            num_tips[p] += num_tips[id];
        }
    }

    raw.into_iter()
        .enumerate()
        .map(|(id, r)| Node {
            node_id: id,
            parent_id: r.parent.unwrap_or(id),
            x_dist: x[id],
            x_time: None,
            y: y[id],
            name: r.name.filter(|name| !name.is_empty()),
            num_tips: num_tips[id],
            is_tip: Some(child_count[id] == 0),
            clades: None,
            attributes: Map::new(),
        })
        .collect()
}

pub fn ingest_newick(text: &str, report: &StatusReporter) -> Result<Dataset> {
    let span = info_span!("ingest_newick", bytes = text.len());
    let _span_guard = span.enter();

    report(StatusMessage::progress("Parsing Newick file", Some(0)));
    let raw = NewickParser::new(text).parse()?;
    debug!(nodes = raw.len(), "parsed newick");

    report(StatusMessage::progress("Laying out tree", Some(50)));
    let nodes = lay_out(raw);

    report(StatusMessage::progress("Indexing tree", Some(100)));
    Dataset::build(nodes, vec![], vec![], Map::new())
}
