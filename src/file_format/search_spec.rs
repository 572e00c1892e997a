use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string, Value};

use crate::worker_error::Result;

/// How a search spec matches.  The field being matched is named separately by
/// the spec's `type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    TextMatch,
    TextExact,
    TextPerLine,
    Number,
    Mutation,
    Revertant,
    Genotype,
    Boolean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberMethod {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl NumberMethod {
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            NumberMethod::Greater => value > threshold,
            NumberMethod::Less => value < threshold,
            NumberMethod::GreaterOrEqual => value >= threshold,
            NumberMethod::LessOrEqual => value <= threshold,
            NumberMethod::Equal => value == threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BooleanMethod {
    And,
    Or,
    Not,
}

/// A declarative search as sent by the UI, e.g.
/// `{"key": "aa12", "type": "meta_Country", "method": "text_match", "text": "uk"}`.
///
/// `key` is opaque to matching; it only exists so the caller can pair
/// responses with requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub key: Value,
    #[serde(rename = "type", default)]
    pub field: String,
    pub method: SearchMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_residue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_tips: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_method: Option<NumberMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean_method: Option<BooleanMethod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subspecs: Vec<SearchSpec>,
}

impl SearchSpec {
    pub fn parse(raw: &str) -> Result<SearchSpec> {
        Ok(from_str(raw)?)
    }

    /// The spec with every `key` (including those of subspecs) dropped, so
    /// that two requests for the same search share one cache entry.
    pub fn without_keys(&self) -> SearchSpec {
        SearchSpec {
            key: Value::Null,
            subspecs: self.subspecs.iter().map(SearchSpec::without_keys).collect(),
            ..self.clone()
        }
    }

    pub fn cache_key(&self) -> Result<String> {
        Ok(to_string(&self.without_keys())?)
    }
}
