//! Topology group identity and pod/label-selector matching.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum WhenUnsatisfiable {
    DoNotSchedule,
    ScheduleAnyway,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum NodeAffinityPolicy {
    Honor,
    Ignore,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum NodeTaintsPolicy {
    Honor,
    Ignore,
}

/// Which pods count toward a group's population, beyond matching the selector.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum NamespaceScope {
    Same,
    Named(BTreeSet<String>),
    All,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum GroupKind {
    Spread,
    PodAffinity,
    PodAntiAffinity,
}

/// Identifies one topology bookkeeping unit by
/// `(kind, topology-key, selector, namespace-scope, policy flags)`. The selector is
/// fingerprinted to its JSON form since `LabelSelector` has no natural total order.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct GroupKey {
    pub kind: GroupKind,
    pub topology_key: String,
    pub selector_fingerprint: String,
    pub namespace_scope: NamespaceScope,
    pub required: bool,
}

impl GroupKey {
    pub fn new(
        kind: GroupKind,
        topology_key: impl Into<String>,
        selector: &LabelSelector,
        namespace_scope: NamespaceScope,
        required: bool,
    ) -> Self {
        GroupKey {
            kind,
            topology_key: topology_key.into(),
            selector_fingerprint: serde_json::to_string(selector).unwrap_or_default(),
            namespace_scope,
            required,
        }
    }
}

pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let matches_labels = selector
        .match_labels
        .as_ref()
        .is_none_or(|m| m.iter().all(|(k, v)| labels.get(k) == Some(v)));
    if !matches_labels {
        return false;
    }
    selector
        .match_expressions
        .as_ref()
        .is_none_or(|exprs| exprs.iter().all(|e| expression_matches(e, labels)))
}

fn expression_matches(expr: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    match expr.operator.as_str() {
        "In" => expr
            .values
            .as_ref()
            .is_some_and(|values| labels.get(&expr.key).is_some_and(|v| values.contains(v))),
        "NotIn" => !expr
            .values
            .as_ref()
            .is_some_and(|values| labels.get(&expr.key).is_some_and(|v| values.contains(v))),
        "Exists" => labels.contains_key(&expr.key),
        "DoesNotExist" => !labels.contains_key(&expr.key),
        _ => true,
    }
}
