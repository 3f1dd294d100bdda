//! The requirement-set algebra: the core "lattice" data structure everything else in
//! this crate intersects against. A [`RequirementSet`] is the product, over label
//! keys, of per-key [`Domain`]s; scheduling a pod onto a node or a candidate
//! nodeclaim is, at its heart, repeatedly intersecting requirement sets and checking
//! that no key's domain has collapsed to empty.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Mirrors the operators accepted by a Kubernetes `NodeSelectorRequirement`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

/// The set of values a label key is allowed to take, after folding in every
/// requirement seen so far for that key.
///
/// `Range` absorbs `Gt`/`Lt` terms; `excluded` lets a `NotIn` on the same key narrow a
/// numeric range without forcing a full reduction to an explicit finite set (which
/// would be unsound for an unbounded numeric domain).
#[derive(Clone, Debug, PartialEq)]
pub enum Domain {
    /// No constraint: `Exists`, or a key absent from the set entirely.
    Any,
    /// Unsatisfiable: `DoesNotExist` on a well-known key, or an intersection that
    /// emptied out.
    None,
    /// `In`: exactly these values, nothing else.
    In(BTreeSet<String>),
    /// `NotIn`: any value except these.
    NotIn(BTreeSet<String>),
    /// `Gt`/`Lt`: an open numeric interval, optionally punctured by excluded values.
    Range {
        gt: Option<f64>,
        lt: Option<f64>,
        excluded: BTreeSet<String>,
    },
}

impl Domain {
    pub fn exact(values: impl IntoIterator<Item = String>) -> Self {
        Domain::In(values.into_iter().collect())
    }

    pub fn single(value: impl Into<String>) -> Self {
        Domain::In(BTreeSet::from([value.into()]))
    }

    pub fn not_in(values: impl IntoIterator<Item = String>) -> Self {
        Domain::NotIn(values.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Domain::None) || matches!(self, Domain::In(s) if s.is_empty())
    }

    pub fn contains(&self, value: &str) -> bool {
        match self {
            Domain::Any => true,
            Domain::None => false,
            Domain::In(set) => set.contains(value),
            Domain::NotIn(set) => !set.contains(value),
            Domain::Range { gt, lt, excluded } => {
                if excluded.contains(value) {
                    return false;
                }
                let Ok(v) = value.parse::<f64>() else {
                    return false;
                };
                gt.is_none_or(|bound| v > bound) && lt.is_none_or(|bound| v < bound)
            }
        }
    }

    /// The number of distinct values the domain admits, if finite.
    pub fn cardinality(&self) -> Option<usize> {
        match self {
            Domain::Any | Domain::NotIn(_) | Domain::Range { .. } => None,
            Domain::None => Some(0),
            Domain::In(set) => Some(set.len()),
        }
    }

    /// Restricts `self` to the values also present in `set`, used when narrowing a
    /// domain down to a concrete list of discovered values (e.g. zones actually
    /// offered by the instance types still in play).
    pub fn restrict_to(&self, set: &BTreeSet<String>) -> Domain {
        let filtered: BTreeSet<String> = set.iter().filter(|v| self.contains(v)).cloned().collect();
        Domain::In(filtered)
    }

    pub fn intersect(&self, other: &Domain) -> Domain {
        match (self, other) {
            (Domain::None, _) | (_, Domain::None) => Domain::None,
            (Domain::Any, d) | (d, Domain::Any) => d.clone(),
            (Domain::In(a), Domain::In(b)) => Domain::In(a.intersection(b).cloned().collect()),
            (Domain::In(a), Domain::NotIn(b)) | (Domain::NotIn(b), Domain::In(a)) => {
                Domain::In(a.difference(b).cloned().collect())
            }
            (Domain::NotIn(a), Domain::NotIn(b)) => {
                Domain::NotIn(a.union(b).cloned().collect())
            }
            (Domain::In(a), Domain::Range { .. }) | (Domain::Range { .. }, Domain::In(a)) => {
                let range = if matches!(self, Domain::Range { .. }) { self } else { other };
                Domain::In(a.iter().filter(|v| range.contains(v)).cloned().collect())
            }
            (
                Domain::Range {
                    gt: gt1,
                    lt: lt1,
                    excluded: ex1,
                },
                Domain::Range {
                    gt: gt2,
                    lt: lt2,
                    excluded: ex2,
                },
            ) => Domain::Range {
                gt: max_option(*gt1, *gt2),
                lt: min_option(*lt1, *lt2),
                excluded: ex1.union(ex2).cloned().collect(),
            },
            (Domain::Range { gt, lt, excluded }, Domain::NotIn(forbidden))
            | (Domain::NotIn(forbidden), Domain::Range { gt, lt, excluded }) => Domain::Range {
                gt: *gt,
                lt: *lt,
                excluded: excluded.union(forbidden).cloned().collect(),
            },
        }
    }

    /// True if `self` and `other` share at least one admissible value. Domains with
    /// unbounded cardinality (`Any`, `NotIn`, `Range` without a finite counterpart)
    /// are conservatively treated as compatible with anything but `None`/empty `In`.
    pub fn compatible(&self, other: &Domain) -> bool {
        !self.intersect(other).is_empty_or_unknowable_empty()
    }

    fn is_empty_or_unknowable_empty(&self) -> bool {
        matches!(self.cardinality(), Some(0))
    }
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn min_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// A single label key's requirement: its admissible [`Domain`] plus an optional
/// lower bound on how many distinct values must remain in the domain after all
/// filtering (used to force candidate diversity, e.g. "at least 2 zones").
#[derive(Clone, Debug, PartialEq)]
pub struct Requirement {
    pub domain: Domain,
    pub min_values: Option<usize>,
}

impl Requirement {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            min_values: None,
        }
    }

    pub fn with_min_values(mut self, min_values: usize) -> Self {
        self.min_values = Some(min_values);
        self
    }

    pub fn from_node_selector_requirement(req: &NodeSelectorRequirement) -> Self {
        let domain = match req.operator.as_str() {
            "In" => Domain::exact(req.values.clone().unwrap_or_default()),
            "NotIn" => Domain::not_in(req.values.clone().unwrap_or_default()),
            "Exists" => Domain::Any,
            "DoesNotExist" => Domain::None,
            "Gt" => Domain::Range {
                gt: req
                    .values
                    .as_ref()
                    .and_then(|v| v.first())
                    .and_then(|v| v.parse().ok()),
                lt: None,
                excluded: BTreeSet::new(),
            },
            "Lt" => Domain::Range {
                gt: None,
                lt: req
                    .values
                    .as_ref()
                    .and_then(|v| v.first())
                    .and_then(|v| v.parse().ok()),
                excluded: BTreeSet::new(),
            },
            _ => Domain::Any,
        };
        Requirement::new(domain)
    }

    pub fn intersect(&self, other: &Requirement) -> Requirement {
        Requirement {
            domain: self.domain.intersect(&other.domain),
            min_values: max_option_usize(self.min_values, other.min_values),
        }
    }
}

fn max_option_usize(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// A mapping from label key to [`Requirement`], canonically stored (values sorted and
/// deduplicated by virtue of `BTreeSet`). Missing keys are unconstrained.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequirementSet(indexmap::IndexMap<String, Requirement>);

impl RequirementSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Requirement {
        self.0
            .get(key)
            .cloned()
            .unwrap_or_else(|| Requirement::new(Domain::Any))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Intersects `requirement` into the shared key, in place. Returns `false` if the
    /// key's domain collapsed to empty (infeasible).
    pub fn add(&mut self, key: impl Into<String>, requirement: Requirement) -> bool {
        let key = key.into();
        let merged = match self.0.get(&key) {
            Some(existing) => existing.intersect(&requirement),
            None => requirement,
        };
        let feasible = !merged.domain.is_empty();
        self.0.insert(key, merged);
        feasible
    }

    /// Intersects every key of `other` into `self`. Returns `false` (and leaves a
    /// partially-merged set) as soon as any key collapses to empty, exactly like the
    /// teacher's fail-fast pattern for validating a multi-field form.
    pub fn add_all(&mut self, other: &RequirementSet) -> bool {
        let mut feasible = true;
        for (key, requirement) in &other.0 {
            if !self.add(key.clone(), requirement.clone()) {
                feasible = false;
            }
        }
        feasible
    }

    /// `Compatible`: the intersection over every key shared between `self` and
    /// `other` is non-empty. Keys present on only one side are unconstrained on the
    /// other and never cause incompatibility.
    pub fn compatible(&self, other: &RequirementSet) -> bool {
        self.0.iter().all(|(key, requirement)| {
            let other_req = other.get(key);
            requirement.domain.compatible(&other_req.domain)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Requirement)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Requirement)> for RequirementSet {
    fn from_iter<T: IntoIterator<Item = (String, Requirement)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
