//! Resource lists: the cpu/memory/pods/extended-resource vectors summed and compared
//! throughout the scheduling loop (pod requests, instance type capacity, overhead).

use std::collections::BTreeMap;

use crate::quantity::Quantity;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";

/// A sparse map from resource name (`cpu`, `memory`, `pods`, or an extended resource
/// like `nvidia.com/gpu`) to its [`Quantity`]. Resources absent from the map are
/// treated as zero everywhere in this crate, never as "unconstrained".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceList(BTreeMap<String, Quantity>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Quantity {
        self.0.get(name).copied().unwrap_or(Quantity::ZERO)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Quantity) {
        self.0.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn resource_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Adds `other` into `self`, one resource dimension at a time.
    pub fn add(&mut self, other: &ResourceList) {
        for (name, value) in other.iter() {
            let entry = self.0.entry(name.to_string()).or_insert(Quantity::ZERO);
            *entry += value;
        }
    }

    pub fn plus(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        out.add(other);
        out
    }

    /// Subtracts `other` from `self`, clamping every dimension to >= 0. This is the
    /// rule used for "available = capacity - pods - daemon overhead".
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, value) in other.iter() {
            let entry = out.0.entry(name.to_string()).or_insert(Quantity::ZERO);
            *entry = entry.saturating_sub(value);
        }
        out
    }

    /// True if every dimension of `self` is >= the matching dimension of `required`.
    /// Dimensions absent from `required` are trivially satisfied (requesting nothing
    /// of a resource is always satisfiable, including unknown extended resources).
    pub fn fits(&self, required: &ResourceList) -> bool {
        required
            .iter()
            .all(|(name, amount)| self.get(name) >= amount)
    }
}

impl FromIterator<(String, Quantity)> for ResourceList {
    fn from_iter<T: IntoIterator<Item = (String, Quantity)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
