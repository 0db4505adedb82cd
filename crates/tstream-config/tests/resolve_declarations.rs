use tstream_config::resolve;
use tstream_testing::{
    empty_declaration, listener_declaration, poller_declaration, pull_consumer_declaration,
};

#[test]
fn empty_declaration_yields_no_components() {
    let resolved = resolve(&empty_declaration(), None).unwrap();
    assert!(resolved.components.is_empty());
    assert!(resolved.mappings.is_empty());
}

#[test]
fn listener_feeds_consumer_in_same_namespace() {
    let resolved = resolve(&listener_declaration(40300), None).unwrap();
    assert_eq!(
        resolved.mappings.get("f5telemetry_default::Test_Listener"),
        Some(&vec!["f5telemetry_default::Test_Consumer".to_string()])
    );
}

#[test]
fn poller_declaration_expands_to_system_scoped_id() {
    let resolved = resolve(&poller_declaration(60), None).unwrap();
    let poller = resolved
        .component("f5telemetry_default::Test_System::SystemPoller_1")
        .unwrap();
    assert_eq!(poller.as_system_poller().unwrap().interval, 60);
}

#[test]
fn resolution_is_idempotent_over_its_own_output() {
    // Resolving a declaration, then resolving it again with the first
    // result as the running state, changes nothing
    for declaration in [
        listener_declaration(40301),
        poller_declaration(120),
        pull_consumer_declaration(),
    ] {
        let first = resolve(&declaration, None).unwrap();
        let second = resolve(&declaration, Some(&first)).unwrap();
        let third = resolve(&declaration, Some(&second)).unwrap();

        let first_bytes = serde_json::to_string(&first.components).unwrap();
        assert_eq!(first_bytes, serde_json::to_string(&second.components).unwrap());
        assert_eq!(first_bytes, serde_json::to_string(&third.components).unwrap());
        assert_eq!(first.mappings, second.mappings);
        assert_eq!(second.mappings, third.mappings);
    }
}

#[test]
fn every_mapping_edge_references_enabled_components() {
    for declaration in [
        listener_declaration(40302),
        poller_declaration(30),
        pull_consumer_declaration(),
    ] {
        let resolved = resolve(&declaration, None).unwrap();
        for (producer, consumers) in &resolved.mappings {
            let p = resolved.component(producer).expect("producer exists");
            assert!(p.enable);
            for consumer in consumers {
                let c = resolved.component(consumer).expect("consumer exists");
                assert!(c.enable);
            }
        }
    }
}
