//! Black-box scenarios driven only through [`Scheduler::solve`], mirroring the
//! workspace's top-level integration-test convention of exercising the public API
//! from outside the crate rather than reaching into its internals.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodAffinityTerm,
    PodAntiAffinity, TopologySpreadConstraint,
};

use provisioning_scheduler::{
    existing_node::ExistingNode,
    instance_type::{CapacityType, InstanceType, LABEL_ZONE, Offering},
    node_pool::{NodeClaimTemplate, TemplateKind},
    nodeclaim::ReservedOfferingMode,
    pod::{Container, Pod, PodAffinityRules},
    quantity::Quantity,
    requirement::{Domain, Requirement, RequirementSet},
    reservation::ReservationManager,
    resources::{CPU, ResourceList},
    Error, Scheduler, SchedulerConfig,
};

fn offering(capacity_type: CapacityType, zone: &str, reservation_id: Option<&str>, price: f64) -> Offering {
    Offering {
        capacity_type,
        zone: zone.to_string(),
        reservation_id: reservation_id.map(str::to_string),
        reservation_capacity: reservation_id.map(|_| 1),
        price,
        available: true,
        requirements: RequirementSet::new(),
    }
}

fn instance_type(name: &str, cpu: f64, overhead_cpu: f64, offerings: Vec<Offering>) -> InstanceType {
    InstanceType {
        name: name.to_string(),
        capacity: [(CPU.to_string(), Quantity::from(cpu))].into_iter().collect(),
        overhead: [(CPU.to_string(), Quantity::from(overhead_cpu))].into_iter().collect(),
        offerings,
    }
}

fn template(pool_name: &str, requirements: RequirementSet, instance_types: Vec<InstanceType>) -> NodeClaimTemplate {
    NodeClaimTemplate {
        pool_name: pool_name.to_string(),
        weight: 10,
        requirements,
        taints: vec![],
        startup_taints: vec![],
        instance_types,
        resource_limits: None,
        kind: TemplateKind::Dynamic,
    }
}

fn pod(name: &str, cpu: f64) -> Pod {
    Pod {
        name: name.to_string(),
        namespace: "default".into(),
        labels: BTreeMap::new(),
        node_selector: BTreeMap::new(),
        affinity: PodAffinityRules::default(),
        tolerations: vec![],
        topology_spread_constraints: vec![],
        init_containers: vec![],
        containers: vec![Container {
            requests: [(CPU.to_string(), Quantity::from(cpu))].into_iter().collect(),
        }],
        volume_claims: vec![],
        host_ports: vec![],
        is_daemon: false,
        has_resource_claims: false,
    }
}

fn fixed_requirement(key: &str, value: &str) -> RequirementSet {
    let mut set = RequirementSet::new();
    set.add(key, Requirement::new(Domain::single(value)));
    set
}

#[tokio::test]
async fn single_pod_lands_on_a_fresh_node_claim() {
    let it = instance_type("m5.large", 4.0, 0.0, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![template("pool", RequirementSet::new(), vec![it])]);
    let results = scheduler.solve(vec![pod("p1", 1.0)], vec![]).await;

    assert!(results.pod_errors.is_empty());
    assert_eq!(results.new_node_claims.len(), 1);
    assert_eq!(results.new_node_claims[0].pods, vec!["p1".to_string()]);
}

#[tokio::test]
async fn topology_spread_admits_one_pod_per_zone_respecting_max_skew() {
    let it = instance_type(
        "m5.large",
        4.0,
        0.0,
        vec![
            offering(CapacityType::OnDemand, "z1", None, 1.0),
            offering(CapacityType::OnDemand, "z2", None, 1.0),
            offering(CapacityType::OnDemand, "z3", None, 1.0),
        ],
    );
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![template("pool", RequirementSet::new(), vec![it])]);

    let mut pods = Vec::new();
    for name in ["p1", "p2", "p3", "p4"] {
        let mut pod = pod(name, 4.0);
        pod.topology_spread_constraints = vec![TopologySpreadConstraint {
            topology_key: LABEL_ZONE.to_string(),
            max_skew: 1,
            min_domains: None,
            when_unsatisfiable: "DoNotSchedule".to_string(),
            label_selector: None,
            match_label_keys: None,
            node_affinity_policy: None,
            node_taints_policy: None,
        }];
        pods.push(pod);
    }

    let results = scheduler.solve(pods, vec![]).await;

    assert!(results.pod_errors.is_empty(), "{:?}", results.pod_errors);
    // Capacity forces exactly one pod per node claim, so spreading four pods
    // across three zones within maxSkew=1 requires four claims.
    assert_eq!(results.new_node_claims.len(), 4);
    let resolved_to_z3 = results
        .new_node_claims
        .iter()
        .filter(|c| c.requirements.get(LABEL_ZONE).domain == Domain::single("z3"))
        .count();
    assert_eq!(resolved_to_z3, 1);
}

#[tokio::test]
async fn existing_node_with_capacity_absorbs_pod_without_new_claim() {
    let it = instance_type("m5.large", 16.0, 0.0, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![template("pool", RequirementSet::new(), vec![it])]);

    let node = ExistingNode::new(
        "node-a",
        "provider-a",
        [(CPU.to_string(), Quantity::from(10.0))].into_iter().collect(),
        &ResourceList::new(),
        &BTreeMap::new(),
        vec![],
        true,
        Default::default(),
        BTreeMap::new(),
        BTreeMap::new(),
        Vec::new(),
    );

    let results = scheduler.solve(vec![pod("p1", 9.0)], vec![node]).await;

    assert!(results.pod_errors.is_empty());
    assert!(results.new_node_claims.is_empty());
    assert_eq!(results.existing_node_assignments.get("node-a"), Some(&vec!["p1".to_string()]));
}

#[tokio::test]
async fn pod_exceeding_existing_node_capacity_creates_new_claim() {
    let it = instance_type("m5.large", 16.0, 0.0, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![template("pool", RequirementSet::new(), vec![it])]);

    let node = ExistingNode::new(
        "node-a",
        "provider-a",
        [(CPU.to_string(), Quantity::from(10.0))].into_iter().collect(),
        &ResourceList::new(),
        &BTreeMap::new(),
        vec![],
        true,
        Default::default(),
        BTreeMap::new(),
        BTreeMap::new(),
        Vec::new(),
    );

    let results = scheduler.solve(vec![pod("p1", 11.0)], vec![node]).await;

    assert!(results.pod_errors.is_empty());
    assert!(results.existing_node_assignments.is_empty());
    assert_eq!(results.new_node_claims.len(), 1);
    assert_eq!(results.new_node_claims[0].pods, vec!["p1".to_string()]);
}

fn reserved_capacity_template() -> NodeClaimTemplate {
    let it = instance_type(
        "reserved.large",
        1.0,
        0.0,
        vec![
            offering(CapacityType::Reserved, "z1", Some("small"), 1.0),
            offering(CapacityType::Reserved, "z1", Some("medium"), 2.0),
            offering(CapacityType::OnDemand, "z1", None, 5.0),
        ],
    );
    template("pool", RequirementSet::new(), vec![it])
}

#[tokio::test]
async fn reserved_capacity_exhaustion_falls_back_to_on_demand() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![reserved_capacity_template()]);
    scheduler.seed_reservation_capacity("small", 1);
    scheduler.seed_reservation_capacity("medium", 1);

    let pods = vec![pod("p1", 1.0), pod("p2", 1.0), pod("p3", 1.0)];
    let results = scheduler.solve(pods, vec![]).await;

    assert!(results.pod_errors.is_empty(), "{:?}", results.pod_errors);
    assert_eq!(results.new_node_claims.len(), 3);
}

#[tokio::test]
async fn reserved_capacity_exhaustion_errors_in_strict_mode() {
    let config = SchedulerConfig {
        reserved_offering_mode: ReservedOfferingMode::Strict,
        ..SchedulerConfig::default()
    };
    let mut scheduler = Scheduler::new(config, vec![reserved_capacity_template()]);
    scheduler.seed_reservation_capacity("small", 1);
    scheduler.seed_reservation_capacity("medium", 1);

    let pods = vec![pod("p1", 1.0), pod("p2", 1.0), pod("p3", 1.0)];
    let results = scheduler.solve(pods, vec![]).await;

    assert_eq!(results.new_node_claims.len(), 2);
    assert!(matches!(results.pod_errors.get("p3"), Some(Error::ReservedOffering)));
}

#[tokio::test]
async fn mutual_anti_affinity_spreads_pods_across_zones_then_fails_on_fourth() {
    let templates: Vec<NodeClaimTemplate> = ["z1", "z2", "z3"]
        .iter()
        .map(|zone| {
            let it = instance_type(
                "m5.large",
                10.0,
                0.0,
                vec![offering(CapacityType::OnDemand, zone, None, 1.0)],
            );
            template(&format!("pool-{zone}"), fixed_requirement(LABEL_ZONE, zone), vec![it])
        })
        .collect();
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), templates);

    let mut pods = Vec::new();
    for name in ["p1", "p2", "p3", "p4"] {
        let mut pod = pod(name, 1.0);
        pod.affinity.pod_anti_affinity = Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                topology_key: LABEL_ZONE.to_string(),
                ..Default::default()
            }]),
            preferred_during_scheduling_ignored_during_execution: None,
        });
        pods.push(pod);
    }

    let results = scheduler.solve(pods, vec![]).await;

    for name in ["p1", "p2", "p3"] {
        assert!(!results.pod_errors.contains_key(name), "{name} unexpectedly failed");
    }
    assert_eq!(results.new_node_claims.len(), 3);
    assert!(results.pod_errors.contains_key("p4"));
}

#[tokio::test]
async fn unsatisfiable_required_term_is_relaxed_to_the_alternative() {
    let it = instance_type("m5.large", 10.0, 0.0, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
    let mut scheduler = Scheduler::new(
        SchedulerConfig::default(),
        vec![template("pool", fixed_requirement(LABEL_ZONE, "z1"), vec![it])],
    );

    let mut the_pod = pod("p1", 1.0);
    the_pod.affinity.node_affinity = Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![
                NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: LABEL_ZONE.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec!["nonexistent".to_string()]),
                    }]),
                    match_fields: None,
                },
                NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: LABEL_ZONE.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec!["z1".to_string()]),
                    }]),
                    match_fields: None,
                },
            ],
        }),
        preferred_during_scheduling_ignored_during_execution: None,
    });

    let results = scheduler.solve(vec![the_pod], vec![]).await;

    assert!(results.pod_errors.is_empty(), "{:?}", results.pod_errors);
    assert_eq!(results.new_node_claims.len(), 1);
    assert_eq!(results.new_node_claims[0].pods, vec!["p1".to_string()]);
}

#[tokio::test]
async fn daemon_overhead_consumes_capacity_before_pods_fit() {
    let app_it = instance_type("m5.large", 16.0, 0.1, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
    let daemon_it = instance_type("m5.small", 4.0, 0.0, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
    let templates = vec![
        template("app-pool", fixed_requirement("pool", "app"), vec![app_it]),
        template("daemon-pool", fixed_requirement("pool", "daemon"), vec![daemon_it]),
    ];
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), templates);

    let mut daemon_pod = pod("daemon", 1.0);
    daemon_pod.is_daemon = true;
    daemon_pod.node_selector.insert("pool".to_string(), "daemon".to_string());

    let mut p1 = pod("p1", 14.9);
    p1.node_selector.insert("pool".to_string(), "app".to_string());

    let mut p2 = pod("p2", 0.1);
    p2.node_selector.insert("pool".to_string(), "app".to_string());

    let results = scheduler.solve(vec![daemon_pod, p1, p2], vec![]).await;

    assert!(results.pod_errors.is_empty(), "{:?}", results.pod_errors);
    assert_eq!(results.new_node_claims.len(), 3);

    let claim_of = |name: &str| {
        results
            .new_node_claims
            .iter()
            .find(|c| c.pods.contains(&name.to_string()))
            .unwrap_or_else(|| panic!("no claim hosts {name}"))
    };
    let p1_claim = claim_of("p1");
    let p2_claim = claim_of("p2");
    assert_eq!(p1_claim.pods, vec!["p1".to_string()]);
    assert_eq!(p2_claim.pods, vec!["p2".to_string()]);
    assert_ne!(p1_claim.claim_id, p2_claim.claim_id);
}

#[tokio::test]
async fn empty_template_list_rejects_every_pod() {
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![]);
    let results = scheduler.solve(vec![pod("p1", 1.0), pod("p2", 1.0)], vec![]).await;

    assert!(results.new_node_claims.is_empty());
    assert!(matches!(results.pod_errors.get("p1"), Some(Error::NoTemplates)));
    assert!(matches!(results.pod_errors.get("p2"), Some(Error::NoTemplates)));
}

#[tokio::test]
async fn zero_quantity_unknown_extended_resource_is_always_satisfiable() {
    let it = instance_type("m5.large", 4.0, 0.0, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
    let mut scheduler = Scheduler::new(SchedulerConfig::default(), vec![template("pool", RequirementSet::new(), vec![it])]);

    let mut the_pod = pod("p1", 0.0);
    the_pod.containers = vec![Container {
        requests: [("example.com/widget".to_string(), Quantity::from(0.0))].into_iter().collect(),
    }];

    let results = scheduler.solve(vec![the_pod], vec![]).await;

    assert!(results.pod_errors.is_empty(), "{:?}", results.pod_errors);
    assert_eq!(results.new_node_claims.len(), 1);
}

#[tokio::test]
async fn identical_input_produces_an_identical_plan() {
    let build = || {
        let it = instance_type("m5.large", 4.0, 0.0, vec![offering(CapacityType::OnDemand, "z1", None, 1.0)]);
        Scheduler::new(SchedulerConfig::default(), vec![template("pool", RequirementSet::new(), vec![it])])
    };

    let mut first = build();
    let first_results = first.solve(vec![pod("p1", 1.0)], vec![]).await;

    let mut second = build();
    let second_results = second.solve(vec![pod("p1", 1.0)], vec![]).await;

    assert_eq!(first_results.new_node_claims.len(), second_results.new_node_claims.len());
    assert_eq!(first_results.new_node_claims[0].claim_id, second_results.new_node_claims[0].claim_id);
    assert_eq!(first_results.new_node_claims[0].pods, second_results.new_node_claims[0].pods);
    assert_eq!(
        first_results.new_node_claims[0].requirements.get(LABEL_ZONE).domain,
        second_results.new_node_claims[0].requirements.get(LABEL_ZONE).domain
    );
    assert!(first_results.pod_errors.is_empty());
    assert!(second_results.pod_errors.is_empty());
}

#[test]
fn reserve_then_release_restores_capacity() {
    let manager = ReservationManager::new();
    manager.seed_capacity("res-1", 3);
    manager.reserve("host-a", "res-1").unwrap();
    manager.release("host-a", "res-1").unwrap();
    assert_eq!(manager.remaining_capacity("res-1"), 3);
}

#[test]
fn repeated_reserve_for_same_host_is_idempotent() {
    let manager = ReservationManager::new();
    manager.seed_capacity("res-1", 3);
    manager.reserve("host-a", "res-1").unwrap();
    manager.reserve("host-a", "res-1").unwrap();
    assert_eq!(manager.remaining_capacity("res-1"), 2);
}
