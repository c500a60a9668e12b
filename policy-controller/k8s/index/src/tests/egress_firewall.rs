use super::*;
use crate::egress_firewall::{self, STATUS_APPLIED, STATUS_FAILED};
use netpol_controller_core::{
    Acl, Action, AddressSetFactory, DbObjectIds, Direction, IdsType, ObjectIdKey, Severity,
};
use netpol_controller_k8s_api::annotations;
use pretty_assertions::assert_eq;

fn by_priority(mut acls: Vec<Acl>) -> Vec<Acl> {
    acls.sort_by_key(|acl| std::cmp::Reverse(acl.priority));
    acls
}

#[tokio::test]
async fn installs_cidr_rule() {
    let _trace = init_tracing();
    let test = TestConfig::default();
    let ef = mk_egress_firewall("namespace1", [cidr_rule(RuleType::Allow, "1.2.3.4/23")]);

    let res = test.controller.add_egress_firewall(&ef).await;
    assert_eq!(egress_firewall::status(&res).status.as_deref(), Some(STATUS_APPLIED));

    let acls = test.attached();
    assert_eq!(acls.len(), 1);
    let acl = &acls[0];
    assert_eq!(
        acl.match_expr,
        "(ip4.dst == 1.2.3.4/23) && ip4.src == $a10481622940199974102 && ip4.dst != 10.128.0.0/14"
    );
    assert_eq!(acl.priority, 10_000);
    assert_eq!(acl.action, Action::Allow);
    assert_eq!(acl.direction, Direction::ToLport);
    assert!(!acl.log);

    let ids = acl.ids().expect("ACL must carry its ids");
    assert!(ids.is_owned_by(IdsType::AclEgressFirewall, CONTROLLER));
    assert_eq!(ids.get(ObjectIdKey::ObjectName), Some("namespace1"));
    assert_eq!(ids.get(ObjectIdKey::Priority), Some("10000"));

    let state = test
        .controller
        .namespaces()
        .get_locked_read("namespace1")
        .await
        .unwrap();
    assert!(state.has_dependent(&egress_firewall::dependent_key("namespace1")));
}

#[tokio::test]
async fn rule_priorities_follow_declaration_order() {
    let test = TestConfig::default();
    let ef = mk_egress_firewall(
        "namespace1",
        [
            cidr_rule(RuleType::Allow, "1.2.3.0/24"),
            EgressFirewallRule {
                ports: Some(vec![
                    mk_port("TCP", Some(100)),
                    mk_port("UDP", None),
                    mk_port("SCTP", Some(13)),
                    mk_port("TCP", Some(102)),
                ]),
                ..cidr_rule(RuleType::Allow, "1.2.3.4/23")
            },
            cidr_rule(RuleType::Deny, "0.0.0.0/0"),
        ],
    );
    test.controller.add_egress_firewall(&ef).await.unwrap();

    let acls = by_priority(test.attached());
    assert_eq!(
        acls.iter()
            .map(|acl| (acl.priority, acl.action))
            .collect::<Vec<_>>(),
        vec![
            (10_000, Action::Allow),
            (9_999, Action::Allow),
            (9_998, Action::Drop),
        ]
    );
    assert_eq!(
        acls[1].match_expr,
        "(ip4.dst == 1.2.3.4/23) && ip4.src == $a10481622940199974102 && ((udp) || (tcp && ( tcp.dst == 100 || tcp.dst == 102 )) || (sctp && ( sctp.dst == 13 ))) && ip4.dst != 10.128.0.0/14"
    );
}

#[tokio::test]
async fn dual_stack_matches() {
    let test = TestConfig::new(mk_cluster(&["fd00:10:128::/48", "10.128.0.0/14"]));
    let ef = mk_egress_firewall("namespace1", [cidr_rule(RuleType::Deny, "2001:db8::/64")]);
    test.controller.add_egress_firewall(&ef).await.unwrap();

    let acls = test.attached();
    assert_eq!(acls.len(), 1);
    assert_eq!(
        acls[0].match_expr,
        "(ip6.dst == 2001:db8::/64) && (ip4.src == $a10481622940199974102 || ip6.src == $a10481620741176717680) && ip4.dst != 10.128.0.0/14 && ip6.dst != fd00:10:128::/48"
    );
}

#[tokio::test]
async fn invalid_cidr_rejects_policy() {
    let test = TestConfig::default();
    let ef = mk_egress_firewall(
        "namespace1",
        [
            cidr_rule(RuleType::Allow, "1.2.3.4/23"),
            cidr_rule(RuleType::Deny, "1.2.3./32"),
        ],
    );

    let res = test.controller.add_egress_firewall(&ef).await;
    let error = res.as_ref().expect_err("policy must be rejected");
    assert_eq!(format!("{error:#}"), "invalid CIDR address: 1.2.3./32");
    assert!(test.store.acls().is_empty());

    let status = egress_firewall::status(&res);
    assert_eq!(status.status.as_deref(), Some(STATUS_FAILED));
    assert_eq!(status.messages, vec!["invalid CIDR address: 1.2.3./32"]);
}

#[tokio::test]
async fn invalid_update_removes_installed_rules() {
    let test = TestConfig::default();
    test.controller
        .add_egress_firewall(&mk_egress_firewall(
            "namespace1",
            [cidr_rule(RuleType::Allow, "1.2.3.0/24")],
        ))
        .await
        .unwrap();
    assert_eq!(test.attached().len(), 1);

    test.controller
        .update_egress_firewall(&mk_egress_firewall(
            "namespace1",
            [cidr_rule(RuleType::Allow, "1.2.3.0/33")],
        ))
        .await
        .expect_err("policy must be rejected");
    assert!(test.attached().is_empty());
}

#[tokio::test]
async fn rejects_malformed_rules() {
    let test = TestConfig::default();

    let both = EgressFirewallRule {
        to: EgressFirewallDestination {
            cidr_selector: Some("1.2.3.0/24".to_string()),
            dns_name: Some("www.example.com".to_string()),
            node_selector: None,
        },
        ..cidr_rule(RuleType::Allow, "1.2.3.0/24")
    };
    let neither = EgressFirewallRule {
        to: EgressFirewallDestination::default(),
        ..cidr_rule(RuleType::Allow, "1.2.3.0/24")
    };
    let icmp = EgressFirewallRule {
        ports: Some(vec![mk_port("ICMP", None)]),
        ..cidr_rule(RuleType::Allow, "1.2.3.0/24")
    };
    let big_port = EgressFirewallRule {
        ports: Some(vec![mk_port("TCP", Some(70_000))]),
        ..cidr_rule(RuleType::Allow, "1.2.3.0/24")
    };
    for rule in [both, neither, icmp, big_port] {
        let ef = mk_egress_firewall("namespace1", [rule.clone()]);
        test.controller
            .add_egress_firewall(&ef)
            .await
            .expect_err(&format!("{rule:?} must be rejected"));
    }

    let too_many = mk_egress_firewall(
        "namespace1",
        (0..=egress_firewall::MAX_RULES).map(|_| cidr_rule(RuleType::Deny, "0.0.0.0/0")),
    );
    let error = test
        .controller
        .add_egress_firewall(&too_many)
        .await
        .expect_err("policy must be rejected");
    assert!(error.to_string().contains("too many rules (8001)"), "{error}");

    assert!(test.store.acls().is_empty());
}

#[tokio::test]
async fn only_default_policy_is_supported() {
    let test = TestConfig::default();
    let installed = mk_egress_firewall("namespace1", [cidr_rule(RuleType::Deny, "0.0.0.0/0")]);
    test.controller
        .add_egress_firewall(&installed)
        .await
        .unwrap();

    let mut other = mk_egress_firewall("namespace1", [cidr_rule(RuleType::Allow, "1.2.3.0/24")]);
    other.metadata.name = Some("other".to_string());
    test.controller
        .add_egress_firewall(&other)
        .await
        .expect_err("policy must be rejected");
    test.controller.delete_egress_firewall(&other).await.unwrap();

    let acls = test.attached();
    assert_eq!(acls.len(), 1);
    assert_eq!(acls[0].action, Action::Drop);
    let state = test
        .controller
        .namespaces()
        .get_locked_read("namespace1")
        .await
        .unwrap();
    assert!(state.has_dependent(&egress_firewall::dependent_key("namespace1")));
}

#[tokio::test]
async fn update_replaces_rules() {
    let test = TestConfig::default();
    test.controller
        .add_egress_firewall(&mk_egress_firewall(
            "namespace1",
            [
                cidr_rule(RuleType::Allow, "1.2.3.0/24"),
                cidr_rule(RuleType::Deny, "0.0.0.0/0"),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(test.attached().len(), 2);

    test.controller
        .update_egress_firewall(&mk_egress_firewall(
            "namespace1",
            [cidr_rule(RuleType::Deny, "0.0.0.0/0")],
        ))
        .await
        .unwrap();
    let acls = test.attached();
    assert_eq!(acls.len(), 1);
    assert_eq!(acls[0].priority, 10_000);
    assert_eq!(acls[0].action, Action::Drop);

    // The second rule's ACL is no longer referenced.
    assert_eq!(test.store.collect_garbage(), 1);
}

#[tokio::test]
async fn store_failure_installs_nothing() {
    let test = TestConfig::default();
    let ef = mk_egress_firewall("namespace1", [cidr_rule(RuleType::Allow, "1.2.3.0/24")]);

    test.store.fail_next("attach");
    let res = test.controller.add_egress_firewall(&ef).await;
    assert_eq!(
        egress_firewall::status(&res).status.as_deref(),
        Some(STATUS_FAILED)
    );
    assert!(test.attached().is_empty());
    assert!(!test
        .controller
        .namespaces()
        .get_locked_read("namespace1")
        .await
        .unwrap()
        .has_dependent(&egress_firewall::dependent_key("namespace1")));

    test.controller.add_egress_firewall(&ef).await.unwrap();
    assert_eq!(test.attached().len(), 1);
}

#[tokio::test]
async fn delete_then_sync_purges_stale_acls() {
    let _trace = init_tracing();
    let test = TestConfig::default();
    let ef = mk_egress_firewall(
        "ns-0",
        [
            cidr_rule(RuleType::Allow, "1.2.3.0/24"),
            cidr_rule(RuleType::Deny, "0.0.0.0/0"),
        ],
    );
    test.controller.add_egress_firewall(&ef).await.unwrap();

    // Left behind by an earlier run: a rule of a policy that no longer exists, and an ACL that
    // lies outside of the egress firewall priority range.
    let stale = Acl::new(
        &DbObjectIds::new(IdsType::AclEgressFirewall, CONTROLLER)
            .with(ObjectIdKey::ObjectName, "ns-gone")
            .with(ObjectIdKey::Priority, 10_000),
        "(ip4.dst == 8.8.8.8/32) && ip4.src == $a1",
        Action::Drop,
        10_000,
        Direction::ToLport,
        None,
    );
    let foreign = Acl::new(
        &DbObjectIds::new(IdsType::AclMulticastNamespace, CONTROLLER)
            .with(ObjectIdKey::ObjectName, "ns-0")
            .with(ObjectIdKey::PolicyDirection, "Ingress"),
        "outport == @mcast_ns-0",
        Action::Allow,
        1_012,
        Direction::ToLport,
        None,
    );
    for acl in [&stale, &foreign] {
        test.store.insert_acl(acl.clone());
    }
    test.store.insert_attached(
        "clusterPortGroup",
        [stale.id.clone(), foreign.id.clone()],
    );

    test.controller
        .sync_egress_firewalls(&[ef.clone()])
        .await
        .unwrap();
    let attached = test.store.attached("clusterPortGroup");
    assert_eq!(attached.len(), 3);
    assert!(!attached.contains(&stale.id));
    assert!(attached.contains(&foreign.id));

    test.controller.delete_egress_firewall(&ef).await.unwrap();
    assert_eq!(
        test.store.attached("clusterPortGroup"),
        Some(foreign.id.clone()).into_iter().collect()
    );
    assert!(!test
        .controller
        .namespaces()
        .get_locked_read("ns-0")
        .await
        .unwrap()
        .has_dependent(&egress_firewall::dependent_key("ns-0")));

    // The store reclaims the rows that are no longer attached.
    assert_eq!(test.store.collect_garbage(), 3);
    assert_eq!(test.store.acls(), vec![foreign]);

    // Nothing is left to purge.
    test.controller.sync_egress_firewalls(&[]).await.unwrap();
    assert_eq!(test.store.attached("clusterPortGroup").len(), 1);
}

#[tokio::test]
async fn dns_destinations_use_shared_address_sets() {
    let test = TestConfig::default();
    let (dns_v4, _) = AddressSetFactory::new(test.store.clone(), true, false).hash_names(
        &DbObjectIds::new(IdsType::AddressSetEgressFirewallDns, CONTROLLER)
            .with(ObjectIdKey::ObjectName, "www.example.com"),
    );

    for ns in ["namespace1", "ns-1"] {
        test.controller
            .add_egress_firewall(&mk_egress_firewall(
                ns,
                [
                    dns_rule(RuleType::Allow, "www.example.com"),
                    cidr_rule(RuleType::Deny, "0.0.0.0/0"),
                ],
            ))
            .await
            .unwrap();
    }
    let acls = by_priority(test.attached());
    let allow = acls
        .iter()
        .find(|acl| acl.match_expr.contains(NAMESPACE1_V4) && acl.priority == 10_000)
        .expect("allow rule must be installed");
    assert_eq!(
        allow.match_expr,
        format!("(ip4.dst == ${dns_v4}) && ip4.src == ${NAMESPACE1_V4} && ip4.dst != 10.128.0.0/14")
    );
    assert_eq!(test.controller.dns_names().await, vec!["www.example.com"]);

    let resolved = ip("93.184.216.34");
    assert!(test
        .controller
        .update_dns("www.example.com", vec![resolved])
        .await
        .unwrap());
    assert_eq!(
        test.store.address_set(&dns_v4).unwrap().addresses,
        Some(resolved).into_iter().collect()
    );
    assert!(!test
        .controller
        .update_dns("unused.example.com", vec![resolved])
        .await
        .unwrap());

    // The set survives until the last namespace stops referencing the name.
    test.controller
        .update_egress_firewall(&mk_egress_firewall(
            "namespace1",
            [cidr_rule(RuleType::Deny, "0.0.0.0/0")],
        ))
        .await
        .unwrap();
    assert!(test.store.address_set(&dns_v4).is_some());

    test.controller
        .delete_egress_firewall(&mk_egress_firewall(
            "ns-1",
            Vec::<EgressFirewallRule>::new(),
        ))
        .await
        .unwrap();
    assert!(test.store.address_set(&dns_v4).is_none());
    assert!(test.controller.dns_names().await.is_empty());
}

#[tokio::test]
async fn node_selector_tracks_nodes() {
    let _trace = init_tracing();
    let test = TestConfig::default();
    for node in [
        mk_node("node-0", [("role", "infra")], "10.0.0.1"),
        mk_node("node-1", [("role", "worker")], "10.0.0.3"),
    ] {
        test.controller.apply_node(&node).await.unwrap();
    }

    let ef = mk_egress_firewall("namespace1", [node_rule(RuleType::Allow, [("role", "infra")])]);
    test.controller.add_egress_firewall(&ef).await.unwrap();
    let matches = |test: &TestConfig| {
        test.attached()
            .into_iter()
            .map(|acl| acl.match_expr)
            .collect::<Vec<_>>()
    };
    assert_eq!(
        matches(&test),
        vec!["(ip4.dst == 10.0.0.1) && ip4.src == $a10481622940199974102 && ip4.dst != 10.128.0.0/14"]
    );

    test.controller
        .apply_node(&mk_node("node-2", [("role", "infra")], "10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(
        matches(&test),
        vec!["(ip4.dst == 10.0.0.1 || ip4.dst == 10.0.0.2) && ip4.src == $a10481622940199974102 && ip4.dst != 10.128.0.0/14"]
    );

    // Without any matching node the rule has no destination and is skipped.
    test.controller.delete_node("node-0").await.unwrap();
    test.controller.delete_node("node-2").await.unwrap();
    assert!(matches(&test).is_empty());

    test.controller
        .sync_nodes(&[mk_node("node-0", [("role", "infra")], "10.0.0.1")])
        .await
        .unwrap();
    assert_eq!(matches(&test).len(), 1);
}

#[tokio::test]
async fn acl_logging_follows_namespace() {
    let test = TestConfig::with(|c| c.acl_logging_enabled = true);
    test.controller
        .add_namespace(&mk_namespace(
            "namespace1",
            &[(annotations::ACL_LOGGING, r#"{"allow": "notice"}"#)],
        ))
        .await
        .unwrap();

    let ef = mk_egress_firewall(
        "namespace1",
        [
            cidr_rule(RuleType::Allow, "1.2.3.0/24"),
            cidr_rule(RuleType::Deny, "0.0.0.0/0"),
        ],
    );
    test.controller.add_egress_firewall(&ef).await.unwrap();
    let severities = |test: &TestConfig| {
        by_priority(test.attached())
            .into_iter()
            .map(|acl| (acl.log, acl.severity))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        severities(&test),
        vec![(true, Some(Severity::Notice)), (false, None)]
    );

    test.controller
        .update_namespace(&mk_namespace(
            "namespace1",
            &[(annotations::ACL_LOGGING, r#"{"deny": "alert"}"#)],
        ))
        .await
        .unwrap();
    assert_eq!(
        severities(&test),
        vec![(false, None), (true, Some(Severity::Alert))]
    );

    // A malformed annotation disables logging.
    test.controller
        .update_namespace(&mk_namespace(
            "namespace1",
            &[(annotations::ACL_LOGGING, "{")],
        ))
        .await
        .unwrap();
    assert_eq!(severities(&test), vec![(false, None), (false, None)]);
}

#[tokio::test]
async fn installs_are_deterministic() {
    let ef = mk_egress_firewall(
        "namespace1",
        [
            EgressFirewallRule {
                ports: Some(vec![
                    mk_port("UDP", None),
                    mk_port("TCP", Some(443)),
                    mk_port("TCP", Some(80)),
                ]),
                ..cidr_rule(RuleType::Allow, "1.2.3.4/23")
            },
            dns_rule(RuleType::Allow, "www.example.com"),
            cidr_rule(RuleType::Deny, "0.0.0.0/0"),
        ],
    );

    let install = |ef: EgressFirewall| async move {
        let test = TestConfig::with(|c| c.acl_logging_enabled = true);
        test.controller.add_egress_firewall(&ef).await.unwrap();
        let first = by_priority(test.attached());

        // Reinstalling the same policy rewrites the same rows.
        test.controller.update_egress_firewall(&ef).await.unwrap();
        assert_eq!(by_priority(test.attached()), first);
        let sets = test
            .store
            .address_sets()
            .into_iter()
            .map(|row| row.name)
            .collect::<Vec<_>>();
        (first, sets)
    };

    let (acls, sets) = install(ef.clone()).await;
    assert_eq!(acls.len(), 3);
    assert_eq!(install(ef).await, (acls, sets));
}
