//! Transport container of serialized item records plus sidecar metadata,
//! and the flag-driven wire serializer over it.

pub mod serializer;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cjson::TagsMatcher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::Variant;
use crate::payload::payload::Payload;
use crate::payload::payload_type::PayloadType;
use crate::payload::value::PayloadValue;
use crate::query::types::AggType;

/// Reference to one result item: its payload plus row metadata.
#[derive(Debug, Clone)]
pub struct ItemRef {
    pub id: i64,
    pub ns_id: u32,
    pub raw: bool,
    pub rank: i32,
    pub value: PayloadValue,
}

/// Namespace sidecar of a result set: everything needed to decode items.
#[derive(Debug, Clone)]
pub struct NsInfo {
    pub name: String,
    pub payload_type: PayloadType,
    pub tags_matcher: TagsMatcher,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetResult {
    pub values: Vec<String>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    #[serde(rename = "type")]
    pub agg_type: AggType,
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<FacetResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distincts: Vec<String>,
}

/// In-memory result set filled by the executor and drained through
/// [`serializer::WrResultSerializer`].
#[derive(Debug, Default)]
pub struct QueryResults {
    pub items: Vec<ItemRef>,
    pub total_count: usize,
    pub aggregation_results: Vec<AggregationResult>,
    pub explain_results: String,
    namespaces: Vec<NsInfo>,
}

impl QueryResults {
    pub fn new() -> Self {
        QueryResults::default()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.total_count = 0;
        self.aggregation_results.clear();
        self.explain_results.clear();
        self.namespaces.clear();
    }

    /// Registers a namespace sidecar, returning its ns id.
    pub fn add_namespace(&mut self, name: &str, payload_type: PayloadType, tags_matcher: TagsMatcher) -> u32 {
        if let Some(pos) = self.namespaces.iter().position(|n| n.name == name) {
            return pos as u32;
        }
        self.namespaces.push(NsInfo {
            name: name.to_string(),
            payload_type,
            tags_matcher,
        });
        (self.namespaces.len() - 1) as u32
    }

    pub fn add_item(&mut self, id: i64, ns_id: u32, value: PayloadValue) {
        self.items.push(ItemRef { id, ns_id, raw: false, rank: 0, value });
    }

    pub fn namespaces(&self) -> &[NsInfo] {
        &self.namespaces
    }

    pub fn get_tags_matcher(&self, ns_id: u32) -> Result<&TagsMatcher> {
        self.namespaces
            .get(ns_id as usize)
            .map(|n| &n.tags_matcher)
            .ok_or_else(|| Error::new(ErrorKind::Params, format!("unknown ns id {}", ns_id)))
    }

    pub fn get_payload_type(&self, ns_id: u32) -> Result<&PayloadType> {
        self.namespaces
            .get(ns_id as usize)
            .map(|n| &n.payload_type)
            .ok_or_else(|| Error::new(ErrorKind::Params, format!("unknown ns id {}", ns_id)))
    }

    /// Decodes the item back into its JSON document.
    pub fn get_item_json(&self, idx: usize) -> Result<Value> {
        let item = self
            .items
            .get(idx)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no item at {}", idx)))?;
        let pt = self.get_payload_type(item.ns_id)?;
        let tm = self.get_tags_matcher(item.ns_id)?;
        Payload::new(pt, &item.value).document(tm)
    }
}

/// Facet/scalar aggregation over already-selected items.
pub fn aggregate_items(
    agg_type: AggType,
    fields: &[String],
    values: impl Iterator<Item = Vec<Variant>>,
) -> AggregationResult {
    let mut result = AggregationResult {
        agg_type,
        fields: fields.to_vec(),
        value: None,
        facets: Vec::new(),
        distincts: Vec::new(),
    };
    match agg_type {
        AggType::Sum | AggType::Avg | AggType::Min | AggType::Max => {
            let mut acc: Option<f64> = None;
            let mut count = 0usize;
            for row in values {
                for v in row {
                    if let Ok(x) = v.as_double() {
                        count += 1;
                        acc = Some(match (acc, agg_type) {
                            (None, _) => x,
                            (Some(a), AggType::Min) => a.min(x),
                            (Some(a), AggType::Max) => a.max(x),
                            (Some(a), _) => a + x,
                        });
                    }
                }
            }
            result.value = acc.map(|a| {
                if agg_type == AggType::Avg && count > 0 {
                    a / count as f64
                } else {
                    a
                }
            });
        }
        AggType::Facet => {
            let mut counts: std::collections::HashMap<Vec<String>, u64> = Default::default();
            for row in values {
                let key: Vec<String> = row.iter().map(Variant::dump).collect();
                *counts.entry(key).or_insert(0) += 1;
            }
            let mut facets: Vec<FacetResult> = counts
                .into_iter()
                .map(|(values, count)| FacetResult { values, count })
                .collect();
            facets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.values.cmp(&b.values)));
            result.facets = facets;
        }
        AggType::Distinct => {
            let mut seen = std::collections::HashSet::new();
            for row in values {
                for v in row {
                    let key = v.dump();
                    if seen.insert(key.clone()) {
                        result.distincts.push(key);
                    }
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variant::Variant;

    #[test]
    fn scalar_aggregations() {
        let rows = || vec![vec![Variant::Int(1)], vec![Variant::Int(2)], vec![Variant::Int(3)]].into_iter();
        assert_eq!(aggregate_items(AggType::Sum, &[], rows()).value, Some(6.0));
        assert_eq!(aggregate_items(AggType::Avg, &[], rows()).value, Some(2.0));
        assert_eq!(aggregate_items(AggType::Min, &[], rows()).value, Some(1.0));
        assert_eq!(aggregate_items(AggType::Max, &[], rows()).value, Some(3.0));
    }

    #[test]
    fn facet_counts_value_combinations() {
        let rows = vec![
            vec![Variant::str("a")],
            vec![Variant::str("a")],
            vec![Variant::str("b")],
        ];
        let res = aggregate_items(AggType::Facet, &["f".to_string()], rows.into_iter());
        assert_eq!(res.facets.len(), 2);
        assert_eq!(res.facets[0].count, 2);
    }

    #[test]
    fn distinct_deduplicates() {
        let rows = vec![vec![Variant::Int(1)], vec![Variant::Int(1)], vec![Variant::Int(2)]];
        let res = aggregate_items(AggType::Distinct, &[], rows.into_iter());
        assert_eq!(res.distincts.len(), 2);
    }
}
