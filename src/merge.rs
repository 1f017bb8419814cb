//! Per-field merge policy for consolidation.
//!
//! Every function here is pure. The planner walks [`PORTABLE_FIELDS`] and
//! folds admin and member values through [`merge`]; nothing reflects over
//! arbitrary document keys.

use serde_json::{json, Map, Value};

/// How two values of the same portable field combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Deduplicated union, first-seen order, nulls dropped.
    UnionArray,
    /// Key-wise merge; incoming keys override existing ones.
    ShallowMergeMap,
    /// Two-bucket coverage structure, each bucket unioned after normalization.
    NormalizedUnion,
    /// Keep `existing` unless it is empty.
    FirstNonEmptyWins,
}

/// Fields owned by the consolidated account once a group is consolidated.
pub const PORTABLE_FIELDS: &[(&str, FieldKind)] = &[
    ("coverage", FieldKind::NormalizedUnion),
    ("custom_labels", FieldKind::ShallowMergeMap),
    ("regulatory_profile", FieldKind::FirstNonEmptyWins),
    ("industry_tags", FieldKind::UnionArray),
    ("sub_industry_map", FieldKind::ShallowMergeMap),
    ("legal_branches", FieldKind::UnionArray),
    ("sub_branch_map", FieldKind::ShallowMergeMap),
    ("ranges", FieldKind::UnionArray),
    ("tags", FieldKind::UnionArray),
    ("company_type", FieldKind::FirstNonEmptyWins),
    ("company_details", FieldKind::ShallowMergeMap),
    ("interest", FieldKind::FirstNonEmptyWins),
    ("company_size", FieldKind::FirstNonEmptyWins),
    ("website", FieldKind::FirstNonEmptyWins),
    ("company_name", FieldKind::FirstNonEmptyWins),
    ("website_extraction_status", FieldKind::ShallowMergeMap),
    ("user_folders", FieldKind::ShallowMergeMap),
];

/// Subscription tier and quota fields stamped by a migration plan.
pub const PLAN_FIELDS: &[&str] = &[
    "subscription_tier",
    "agent_limit",
    "source_limit",
    "impact_analysis_limit",
];

pub fn field_kind(name: &str) -> Option<FieldKind> {
    PORTABLE_FIELDS
        .iter()
        .find(|(field, _)| *field == name)
        .map(|(_, kind)| *kind)
}

const PRIMARY_SPELLINGS: &[&str] = &["primary", "fuentes-gobierno", "fuentes_gobierno", "fuentes"];
const SECONDARY_SPELLINGS: &[&str] = &[
    "secondary",
    "fuentes-reguladores",
    "fuentes_reguladores",
    "fuentes-regulador",
    "reguladores",
];

/// Null, an empty array or map, or a blank string.
pub fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Combine `existing` and `incoming` according to `kind`.
pub fn merge(kind: FieldKind, existing: Option<&Value>, incoming: Option<&Value>) -> Value {
    match kind {
        FieldKind::UnionArray => Value::Array(union_arrays(existing, incoming)),
        FieldKind::ShallowMergeMap => Value::Object(shallow_merge(existing, incoming)),
        FieldKind::NormalizedUnion => merge_coverage(existing, incoming),
        FieldKind::FirstNonEmptyWins => {
            if !is_empty(existing) {
                existing.cloned().unwrap_or(Value::Null)
            } else if !is_empty(incoming) {
                incoming.cloned().unwrap_or(Value::Null)
            } else {
                Value::Null
            }
        }
    }
}

fn as_items(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn union_arrays(existing: Option<&Value>, incoming: Option<&Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for item in as_items(existing).iter().chain(as_items(incoming)) {
        if item.is_null() || out.contains(item) {
            continue;
        }
        out.push(item.clone());
    }
    out
}

pub fn shallow_merge(existing: Option<&Value>, incoming: Option<&Value>) -> Map<String, Value> {
    let mut out = match existing {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    if let Some(Value::Object(map)) = incoming {
        for (key, value) in map {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Canonical `{primary, secondary}` coverage from any accepted spelling.
pub fn normalize_coverage(value: Option<&Value>) -> Value {
    let map = match value {
        Some(Value::Object(map)) => map,
        _ => return json!({ "primary": [], "secondary": [] }),
    };
    let pick = |spellings: &[&str]| -> Vec<Value> {
        let bucket = spellings.iter().find_map(|key| match map.get(*key) {
            Some(v) if !v.is_null() => Some(v),
            _ => None,
        });
        union_arrays(bucket, None)
    };
    json!({
        "primary": pick(PRIMARY_SPELLINGS),
        "secondary": pick(SECONDARY_SPELLINGS),
    })
}

fn merge_coverage(existing: Option<&Value>, incoming: Option<&Value>) -> Value {
    let a = normalize_coverage(existing);
    let b = normalize_coverage(incoming);
    json!({
        "primary": union_arrays(a.get("primary"), b.get("primary")),
        "secondary": union_arrays(a.get("secondary"), b.get("secondary")),
    })
}
