use chrono::{TimeZone, Utc};
use common::{
    ObjectMeta, ResourceKind, ServicePort, Stack, StackLifecycle, StackServiceSpec, StackSet,
    StackSetIngressSpec, StackSetSpec, StackSpec, StackSpecTemplate, StackTemplate,
};
use rkstacks::core::{
    STACK_VERSION_LABEL_KEY, STACKSET_HERITAGE_LABEL_KEY, StackSetContainer,
};
use std::collections::HashMap;

fn make_test_stackset(name: &str, version: &str) -> StackSet {
    StackSet {
        api_version: "zalando.org/v1".to_string(),
        kind: "StackSet".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: uuid::Uuid::new_v4(),
            ..Default::default()
        },
        spec: StackSetSpec {
            ingress: None,
            stack_lifecycle: StackLifecycle::default(),
            stack_template: StackTemplate {
                annotations: HashMap::new(),
                spec: StackSpecTemplate {
                    version: version.to_string(),
                    stack_spec: StackSpec {
                        replicas: Some(3),
                        horizontal_pod_autoscaler: None,
                        service: None,
                        pod_template: Default::default(),
                        autoscaler: None,
                    },
                },
            },
        },
        status: Default::default(),
    }
}

fn make_test_stack(name: &str, version: &str, day: u32) -> Stack {
    let mut labels = HashMap::new();
    labels.insert(STACK_VERSION_LABEL_KEY.to_string(), version.to_string());
    Stack {
        api_version: "zalando.org/v1".to_string(),
        kind: "Stack".to_string(),
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels,
            creation_timestamp: Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
            ..Default::default()
        },
        spec: StackSpec {
            replicas: Some(3),
            horizontal_pod_autoscaler: None,
            service: None,
            pod_template: Default::default(),
            autoscaler: None,
        },
        status: Default::default(),
    }
}

/// A fresh stackset with an unobserved version produces exactly one
/// new stack, named after the version and owned by the stackset.
#[test]
fn new_stack_created_for_fresh_stackset() {
    let stackset = make_test_stackset("foo", "v1");
    let ssc = StackSetContainer::new(stackset, vec![]);

    let (sc, version) = ssc.new_stack().expect("a new stack should be emitted");
    assert_eq!(version, "v1");
    assert_eq!(sc.name(), "foo-v1");
    assert_eq!(sc.stack.spec.replicas, Some(3));

    let owners = sc.stack.metadata.owner_references.as_ref().unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, ResourceKind::StackSet);
    assert_eq!(owners[0].name, "foo");

    assert_eq!(
        sc.stack.metadata.labels.get(STACKSET_HERITAGE_LABEL_KEY),
        Some(&"foo".to_string())
    );
    assert_eq!(
        sc.stack.metadata.labels.get(STACK_VERSION_LABEL_KEY),
        Some(&"v1".to_string())
    );
}

/// Once a version has been observed, deleting its stack must not
/// recreate it.
#[test]
fn deleted_version_not_recreated() {
    let mut stackset = make_test_stackset("foo", "v1");
    stackset.status.observed_stack_version = "v1".to_string();
    let ssc = StackSetContainer::new(stackset, vec![]);

    assert!(
        ssc.new_stack().is_none(),
        "an observed version must not be recreated"
    );
}

#[test]
fn existing_stack_not_recreated() {
    let stackset = make_test_stackset("foo", "v1");
    let stack = make_test_stack("foo-v1", "v1", 1);
    let ssc = StackSetContainer::new(stackset, vec![stack]);

    assert!(ssc.new_stack().is_none());
}

#[test]
fn missing_version_defaults() {
    let stackset = make_test_stackset("foo", "");
    let ssc = StackSetContainer::new(stackset, vec![]);

    let (sc, version) = ssc.new_stack().unwrap();
    assert_eq!(version, "01");
    assert_eq!(sc.name(), "foo-01");
}

/// Service ports on a new stack default to TCP when the template
/// leaves the protocol empty.
#[test]
fn new_stack_service_ports_default_protocol() {
    let mut stackset = make_test_stackset("foo", "v1");
    stackset.spec.stack_template.spec.stack_spec.service = Some(StackServiceSpec {
        ports: vec![ServicePort {
            name: Some("main".to_string()),
            port: 8080,
            target_port: None,
            protocol: String::new(),
        }],
    });
    let ssc = StackSetContainer::new(stackset, vec![]);

    let (sc, _) = ssc.new_stack().unwrap();
    let service = sc.stack.spec.service.as_ref().unwrap();
    assert_eq!(service.ports[0].protocol, "TCP");
}

fn ingress_spec() -> StackSetIngressSpec {
    StackSetIngressSpec {
        annotations: HashMap::new(),
        hosts: vec!["example.org".to_string()],
        backend_port: common::IntOrString::Int(8080),
        path: "/".to_string(),
    }
}

/// Twelve stacks, retention limit ten: eleven candidates without
/// ingress exposure, one still serving. Only the oldest candidate
/// above the limit is flagged; the serving stack is untouchable.
#[test]
fn retention_gc_marks_oldest_excess() {
    let mut stackset = make_test_stackset("foo", "v12");
    stackset.spec.stack_lifecycle.limit = Some(10);

    let stacks: Vec<Stack> = (1..=12)
        .map(|i| make_test_stack(&format!("foo-v{i}"), &format!("v{i}"), i))
        .collect();
    let mut ssc = StackSetContainer::new(stackset, stacks);

    // Eleven candidates: no ingress exposure. One serving stack keeps
    // its ingress spec and its traffic.
    for sc in ssc.stack_containers.iter_mut().take(11) {
        sc.ingress_spec = None;
    }
    let serving = &mut ssc.stack_containers[11];
    serving.ingress_spec = Some(ingress_spec());
    serving.actual_traffic_weight = 100.0;

    ssc.mark_expired_stacks(Utc::now());

    let marked: Vec<&str> = ssc
        .stack_containers
        .iter()
        .filter(|sc| sc.pending_removal)
        .map(|sc| sc.name())
        .collect();
    assert_eq!(marked, vec!["foo-v1"], "only the oldest excess candidate");

    for sc in &ssc.stack_containers {
        assert!(
            !(sc.has_traffic() && sc.pending_removal),
            "a stack with traffic must never be pending removal"
        );
    }
}

#[test]
fn gc_marks_nothing_within_limit() {
    let mut stackset = make_test_stackset("foo", "v3");
    stackset.spec.stack_lifecycle.limit = Some(10);

    let stacks: Vec<Stack> = (1..=3)
        .map(|i| make_test_stack(&format!("foo-v{i}"), &format!("v{i}"), i))
        .collect();
    let mut ssc = StackSetContainer::new(stackset, stacks);
    for sc in &mut ssc.stack_containers {
        sc.ingress_spec = None;
    }

    ssc.mark_expired_stacks(Utc::now());

    assert!(
        ssc.stack_containers.iter().all(|sc| !sc.pending_removal),
        "nothing is marked while the candidate count is within the limit"
    );
}

/// Scaled-down stacks are candidates even when the stackset has an
/// ingress.
#[test]
fn gc_considers_scaled_down_stacks() {
    let mut stackset = make_test_stackset("foo", "v3");
    stackset.spec.stack_lifecycle.limit = Some(1);
    stackset.spec.ingress = Some(ingress_spec());

    let stacks: Vec<Stack> = (1..=3)
        .map(|i| make_test_stack(&format!("foo-v{i}"), &format!("v{i}"), i))
        .collect();
    let mut ssc = StackSetContainer::new(stackset, stacks);

    let now = Utc::now();
    // v1 and v2 idle beyond the TTL, v3 serving.
    for sc in ssc.stack_containers.iter_mut().take(2) {
        sc.no_traffic_since = Some(now - chrono::Duration::seconds(600));
    }
    ssc.stack_containers[2].actual_traffic_weight = 100.0;

    ssc.mark_expired_stacks(now);

    let marked: Vec<&str> = ssc
        .stack_containers
        .iter()
        .filter(|sc| sc.pending_removal)
        .map(|sc| sc.name())
        .collect();
    assert_eq!(marked, vec!["foo-v1"]);
}
