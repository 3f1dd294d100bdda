//! Instance-type filtering: the pure function every candidate nodeclaim calls to
//! prune its instance-type list as pods are admitted.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::{Error, FilterFailureKind},
    instance_type::InstanceType,
    requirement::RequirementSet,
    resources::ResourceList,
};

pub struct FilterInput<'a> {
    pub instance_types: &'a [InstanceType],
    pub requirements: &'a RequirementSet,
    pub requested: &'a ResourceList,
    pub daemon: &'a ResourceList,
    pub existing: &'a ResourceList,
    pub allow_min_values_relaxation: bool,
}

pub struct FilterOutput {
    pub instance_types: Vec<InstanceType>,
    /// Keys whose `minValues` obligation had to be lowered to the maximum
    /// achievable cardinality, and the lowered value.
    pub relaxed_min_values: BTreeMap<String, usize>,
}

pub fn filter(input: FilterInput<'_>) -> Result<FilterOutput, Error> {
    let mut total_needed = input.requested.clone();
    total_needed.add(input.daemon);
    total_needed.add(input.existing);

    // Step 1: compatibility.
    let compatible: Vec<InstanceType> = input
        .instance_types
        .iter()
        .filter(|it| it.has_compatible_offering(input.requirements))
        .cloned()
        .collect();
    if compatible.is_empty() {
        return Err(Error::InsufficientResources {
            kind: FilterFailureKind::Compatibility,
        });
    }

    // Step 2: capacity.
    let fits: Vec<InstanceType> = compatible
        .into_iter()
        .filter(|it| it.allocatable().fits(&total_needed))
        .collect();
    if fits.is_empty() {
        return Err(Error::InsufficientResources {
            kind: FilterFailureKind::Resources,
        });
    }

    // Step 3: minValues coverage, per key with an obligation.
    let mut relaxed = BTreeMap::new();
    for (key, requirement) in input.requirements.iter() {
        let Some(min_values) = requirement.min_values else {
            continue;
        };

        let achievable: BTreeSet<String> = fits
            .iter()
            .flat_map(|it| it.compatible_offerings(input.requirements).map(move |o| (it.name.as_str(), o)))
            .filter_map(|(it_name, offering)| value_of_well_known_key(key, it_name, offering))
            .collect();

        if achievable.len() < min_values {
            if input.allow_min_values_relaxation {
                relaxed.insert(key.to_string(), achievable.len());
            } else {
                return Err(Error::MinValuesIncompatible {
                    kind: FilterFailureKind::MinValues,
                });
            }
        }
    }

    Ok(FilterOutput {
        instance_types: fits,
        relaxed_min_values: relaxed,
    })
}

/// Resolves a well-known requirement key to the value a given instance type's
/// offering contributes. Takes the owning instance type's name separately since an
/// `Offering` alone doesn't carry it.
pub(crate) fn value_of_well_known_key(
    key: &str,
    instance_type_name: &str,
    offering: &crate::instance_type::Offering,
) -> Option<String> {
    use crate::instance_type::{LABEL_CAPACITY_TYPE, LABEL_INSTANCE_TYPE, LABEL_RESERVATION_ID, LABEL_ZONE};

    match key {
        LABEL_ZONE => Some(offering.zone.clone()),
        LABEL_CAPACITY_TYPE => Some(offering.capacity_type.to_string()),
        LABEL_RESERVATION_ID => offering.reservation_id.clone(),
        LABEL_INSTANCE_TYPE => Some(instance_type_name.to_string()),
        _ => None,
    }
}

/// Orders instance types ascending by their cheapest requirement-compatible
/// offering; types with no compatible offering sort last.
pub fn sort_by_price_ascending(instance_types: &mut [InstanceType], requirements: &RequirementSet) {
    instance_types.sort_by(|a, b| {
        let pa = a.min_compatible_price(requirements);
        let pb = b.min_compatible_price(requirements);
        match (pa, pb) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    });
}
