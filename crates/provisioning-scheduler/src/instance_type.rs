//! Machine-type catalog types reported by the cloud-provider collaborator:
//! [`InstanceType`] and its priced [`Offering`]s.

use crate::{requirement::RequirementSet, resources::ResourceList};

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display, strum::EnumString)]
pub enum CapacityType {
    #[strum(serialize = "on-demand")]
    OnDemand,
    #[strum(serialize = "spot")]
    Spot,
    #[strum(serialize = "reserved")]
    Reserved,
}

/// A single purchasable variant of an instance type: a capacity-type, zone, price,
/// and (for `Reserved` offerings) a shared reservation id and per-id capacity.
#[derive(Clone, Debug)]
pub struct Offering {
    pub capacity_type: CapacityType,
    pub zone: String,
    pub reservation_id: Option<String>,
    pub reservation_capacity: Option<u32>,
    pub price: f64,
    pub available: bool,
    /// Well-known-key requirements this offering satisfies (zone, capacity-type,
    /// reservation-id, instance-type are folded in automatically by
    /// [`InstanceType::offering_requirements`]; this field carries anything else the
    /// cloud provider reports, e.g. architecture or a provider-specific label).
    pub requirements: RequirementSet,
}

impl Offering {
    pub fn is_reserved(&self) -> bool {
        matches!(self.capacity_type, CapacityType::Reserved) && self.reservation_id.is_some()
    }
}

pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";
pub const LABEL_CAPACITY_TYPE: &str = "scheduling.example.com/capacity-type";
pub const LABEL_ZONE: &str = "topology.kubernetes.io/zone";
pub const LABEL_RESERVATION_ID: &str = "scheduling.example.com/reservation-id";

#[derive(Clone, Debug)]
pub struct InstanceType {
    pub name: String,
    pub capacity: ResourceList,
    pub overhead: ResourceList,
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    /// Allocatable capacity: reported capacity minus system/kube-reserved overhead.
    pub fn allocatable(&self) -> ResourceList {
        self.capacity.saturating_sub(&self.overhead)
    }

    /// The well-known-key requirements implied by a single offering: its zone,
    /// capacity-type, reservation-id (if any), and this instance type's name,
    /// unioned with whatever extra requirements the cloud provider attached to the
    /// offering itself.
    pub fn offering_requirements(&self, offering: &Offering) -> RequirementSet {
        use crate::requirement::{Domain, Requirement};

        let mut set = RequirementSet::new();
        set.add(LABEL_INSTANCE_TYPE, Requirement::new(Domain::single(self.name.clone())));
        set.add(
            LABEL_CAPACITY_TYPE,
            Requirement::new(Domain::single(offering.capacity_type.to_string())),
        );
        set.add(LABEL_ZONE, Requirement::new(Domain::single(offering.zone.clone())));
        if let Some(id) = &offering.reservation_id {
            set.add(LABEL_RESERVATION_ID, Requirement::new(Domain::single(id.clone())));
        }
        set.add_all(&offering.requirements);
        set
    }

    /// The minimum price among offerings compatible with `requirements`, used both
    /// for price-ascending ordering and for finalization truncation.
    pub fn min_compatible_price(&self, requirements: &RequirementSet) -> Option<f64> {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .filter(|o| self.offering_requirements(o).compatible(requirements))
            .map(|o| o.price)
            .fold(None, |acc, price| {
                Some(acc.map_or(price, |best: f64| best.min(price)))
            })
    }

    pub fn has_compatible_offering(&self, requirements: &RequirementSet) -> bool {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .any(|o| self.offering_requirements(o).compatible(requirements))
    }

    pub fn compatible_offerings<'a>(
        &'a self,
        requirements: &'a RequirementSet,
    ) -> impl Iterator<Item = &'a Offering> + 'a {
        self.offerings
            .iter()
            .filter(|o| o.available)
            .filter(move |o| self.offering_requirements(o).compatible(requirements))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::CPU;

    fn it(name: &str, cpu: f64) -> InstanceType {
        InstanceType {
            name: name.to_string(),
            capacity: [(CPU.to_string(), crate::quantity::Quantity::from(cpu))]
                .into_iter()
                .collect(),
            overhead: ResourceList::new(),
            offerings: vec![Offering {
                capacity_type: CapacityType::OnDemand,
                zone: "us-east-1a".into(),
                reservation_id: None,
                reservation_capacity: None,
                price: 1.0,
                available: true,
                requirements: RequirementSet::new(),
            }],
        }
    }

    #[test]
    fn min_price_ignores_unavailable_offerings() {
        let mut inst = it("m5.large", 4.0);
        inst.offerings.push(Offering {
            capacity_type: CapacityType::Spot,
            zone: "us-east-1a".into(),
            reservation_id: None,
            reservation_capacity: None,
            price: 0.1,
            available: false,
            requirements: RequirementSet::new(),
        });
        assert_eq!(inst.min_compatible_price(&RequirementSet::new()), Some(1.0));
    }
}
