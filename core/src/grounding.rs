use std::collections::BTreeMap;

use serde::Serialize;

use crate::analysis::{GeneratedInsight, ItemRecommendation};
use crate::truth::TruthEvent;

pub const DEFAULT_TOLERANCE_MS: i64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightFilterOutcome {
    pub retained: Vec<GeneratedInsight>,
    pub dropped: usize,
}

/// An insight is grounded when some verified event lies strictly within
/// `tolerance_ms` of it.
pub fn is_grounded(timestamp_ms: i64, truth: &[TruthEvent], tolerance_ms: i64) -> bool {
    let Ok(tolerance) = u64::try_from(tolerance_ms) else {
        return false;
    };
    truth
        .iter()
        .any(|event| timestamp_ms.abs_diff(event.timestamp_ms) < tolerance)
}

/// Keep only insights anchored to a verified event. Order of retained insights is
/// preserved.
pub fn filter_insights(
    insights: Vec<GeneratedInsight>,
    truth: &[TruthEvent],
    tolerance_ms: i64,
) -> InsightFilterOutcome {
    let total = insights.len();
    let retained: Vec<GeneratedInsight> = insights
        .into_iter()
        .filter(|insight| is_grounded(insight.timestamp_ms, truth, tolerance_ms))
        .collect();
    InsightFilterOutcome {
        dropped: total - retained.len(),
        retained,
    }
}

/// Lowercase alphanumerics only: "Rabadon's  Deathcap" and "rabadons deathcap" collide.
pub fn normalize_item_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog document has no `data` object")]
    MissingData,
}

/// Canonical item names keyed by their normalized form.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    by_normalized: BTreeMap<String, CatalogItem>,
}

impl ItemCatalog {
    /// Build from `(id, name)` pairs. When two names normalize identically the
    /// entry with the smallest id wins, independent of input order.
    pub fn from_entries<I, S1, S2>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S1, S2)>,
        S1: Into<String>,
        S2: Into<String>,
    {
        let mut items: Vec<CatalogItem> = entries
            .into_iter()
            .map(|(id, name)| CatalogItem {
                id: id.into(),
                name: name.into(),
            })
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));

        let mut by_normalized = BTreeMap::new();
        for item in items {
            let key = normalize_item_name(&item.name);
            if key.is_empty() {
                continue;
            }
            by_normalized.entry(key).or_insert(item);
        }
        Self { by_normalized }
    }

    /// Parse a `{ "data": { "<id>": { "name": "..." } } }` document.
    pub fn from_data_document(document: &serde_json::Value) -> Result<Self, CatalogError> {
        let data = document
            .get("data")
            .and_then(|value| value.as_object())
            .ok_or(CatalogError::MissingData)?;

        Ok(Self::from_entries(data.iter().filter_map(|(id, item)| {
            item.get("name")
                .and_then(|name| name.as_str())
                .map(|name| (id.clone(), name.to_string()))
        })))
    }

    pub fn lookup(&self, free_text: &str) -> Option<&CatalogItem> {
        self.by_normalized.get(&normalize_item_name(free_text))
    }

    pub fn len(&self) -> usize {
        self.by_normalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_normalized.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResolutionOutcome {
    pub resolved: Vec<ItemRecommendation>,
    pub dropped: usize,
}

/// Resolve free-text item names against the catalog. Binary keep/drop: anything
/// without an exact normalized match is discarded.
pub fn resolve_items(recommendations: Vec<String>, catalog: &ItemCatalog) -> ItemResolutionOutcome {
    let total = recommendations.len();
    let resolved: Vec<ItemRecommendation> = recommendations
        .into_iter()
        .filter_map(|free_text_name| {
            catalog.lookup(&free_text_name).map(|item| ItemRecommendation {
                resolved_catalog_id: Some(item.id.clone()),
                free_text_name,
            })
        })
        .collect();
    ItemResolutionOutcome {
        dropped: total - resolved.len(),
        resolved,
    }
}

/// Internal bookkeeping for one job's grounding pass. Persisted for operators,
/// never returned to end users.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroundingDiagnostics {
    pub truth_events: usize,
    pub dropped_insights: usize,
    pub dropped_items: usize,
    pub model: String,
    pub model_attempts: u32,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::analysis::InsightKind;
    use crate::truth::TruthEventKind;

    fn truth_at(timestamps: &[i64]) -> Vec<TruthEvent> {
        timestamps
            .iter()
            .map(|ts| TruthEvent {
                kind: TruthEventKind::Kill,
                timestamp_ms: *ts,
                participant_ids: vec![1],
                derived_category: None,
                detail: None,
                involves_subject: true,
            })
            .collect()
    }

    fn insight_at(timestamp_ms: i64) -> GeneratedInsight {
        GeneratedInsight {
            timestamp_ms,
            title: format!("at {timestamp_ms}"),
            description: "desc".to_string(),
            kind: InsightKind::Mistake,
            advice: "advice".to_string(),
        }
    }

    #[test]
    fn keeps_insight_near_truth_and_drops_distant_one() {
        let truth = truth_at(&[60_000, 130_000, 300_000]);
        let outcome = filter_insights(
            vec![insight_at(125_000), insight_at(500_000)],
            &truth,
            DEFAULT_TOLERANCE_MS,
        );
        assert_eq!(outcome.retained, vec![insight_at(125_000)]);
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn tolerance_boundary_is_exclusive() {
        let truth = truth_at(&[100_000]);
        assert!(is_grounded(159_999, &truth, DEFAULT_TOLERANCE_MS));
        assert!(!is_grounded(160_000, &truth, DEFAULT_TOLERANCE_MS));
        assert!(is_grounded(40_001, &truth, DEFAULT_TOLERANCE_MS));
        assert!(!is_grounded(40_000, &truth, DEFAULT_TOLERANCE_MS));
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let truth = truth_at(&[-1, i64::MIN]);
        assert!(!is_grounded(i64::MAX, &truth, DEFAULT_TOLERANCE_MS));
        assert!(!is_grounded(0, &truth_at(&[i64::MIN]), DEFAULT_TOLERANCE_MS));
        assert!(is_grounded(i64::MAX, &truth_at(&[i64::MAX - 1]), DEFAULT_TOLERANCE_MS));
        assert!(!is_grounded(10, &truth_at(&[10]), -5));
    }

    #[test]
    fn empty_truth_grounds_nothing() {
        let outcome = filter_insights(vec![insight_at(0)], &[], DEFAULT_TOLERANCE_MS);
        assert!(outcome.retained.is_empty());
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn every_retained_insight_has_a_nearby_event() {
        let truth = truth_at(&[10_000, 400_000, 900_000]);
        let insights: Vec<GeneratedInsight> =
            (0..100).map(|i| insight_at(i * 13_337)).collect();
        let outcome = filter_insights(insights, &truth, DEFAULT_TOLERANCE_MS);
        for insight in &outcome.retained {
            assert!(
                truth
                    .iter()
                    .any(|e| (insight.timestamp_ms - e.timestamp_ms).abs() < DEFAULT_TOLERANCE_MS)
            );
        }
        assert_eq!(outcome.retained.len() + outcome.dropped, 100);
    }

    #[test]
    fn normalization_strips_case_space_and_punctuation() {
        assert_eq!(normalize_item_name("  Rabadon's Deathcap "), "rabadonsdeathcap");
        assert_eq!(normalize_item_name("B. F. Sword"), "bfsword");
        assert_eq!(normalize_item_name("!!!"), "");
    }

    #[test]
    fn resolves_matches_and_drops_unknown_items() {
        let catalog = ItemCatalog::from_entries([
            ("3031", "Infinity Edge"),
            ("3089", "Rabadon's Deathcap"),
        ]);
        let outcome = resolve_items(
            vec![
                "Mystic Blade of Nowhere".to_string(),
                "rabadons deathcap".to_string(),
            ],
            &catalog,
        );
        assert_eq!(
            outcome.resolved,
            vec![ItemRecommendation {
                free_text_name: "rabadons deathcap".to_string(),
                resolved_catalog_id: Some("3089".to_string()),
            }]
        );
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn colliding_names_keep_smallest_id() {
        let catalog = ItemCatalog::from_entries([("9001", "Doran's Blade"), ("1055", "Dorans Blade")]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.lookup("doran's blade").unwrap().id, "1055");
    }

    #[test]
    fn parses_data_document() {
        let document = json!({
            "type": "item",
            "data": {
                "1001": { "name": "Boots", "gold": { "total": 300 } },
                "3031": { "name": "Infinity Edge" },
                "bad": { "description": "no name" }
            }
        });
        let catalog = ItemCatalog::from_data_document(&document).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.lookup("INFINITY EDGE").unwrap().id, "3031");
        assert_eq!(
            ItemCatalog::from_data_document(&json!({"items": []})).unwrap_err(),
            CatalogError::MissingData
        );
    }
}
