//! S5/S6: build timeout against an unresponsive relay, and the expiry
//! sweep tearing down a short-lived path.

use std::sync::Arc;
use std::time::Duration;

use veilnet_core::config::PathConfig;
use veilnet_core::constants::{MIN_PATH_BUILD_INTERVAL, PATH_BUILD_TIMEOUT};
use veilnet_path::{Builder, PathRole, PathStatus};
use veilnet_tests::{path_config, t, test_crypto, CapturingHandler, TestNet};

#[test]
fn build_times_out_against_a_dead_relay() {
    let crypto = test_crypto();
    let mut net = TestNet::new(2, t(1_000));
    let client_id = net.add_client(t(1_000));

    // the first relay eats every message
    let dead_edge = net.node(0).router_id();
    net.net.blackholes.lock().push(dead_edge);

    let client = &net.nodes[&client_id];
    let builder = Arc::new(Builder::new("doomed", PathRole::ANY, path_config(2)));
    client.context.register_builder(builder.clone());

    let path = builder
        .build(
            net.rcs(),
            crypto,
            &client.context,
            &client.transport,
            &client.profiles,
            t(1_000),
        )
        .unwrap();

    let mut handler = CapturingHandler::default();
    net.run_until_quiet(&mut handler, t(1_100));
    assert_eq!(path.status(), PathStatus::Building);

    // the hard deadline fires on the tick after ten seconds
    let deadline = t(1_000) + PATH_BUILD_TIMEOUT;
    client.context.tick(&client.services(), deadline);

    assert_eq!(path.status(), PathStatus::Timeout);
    assert_eq!(builder.pathset().build_stats().timeouts, 1);

    // the first-hop edge carries the blame in its profile
    let profile = client.profiles.get(&dead_edge).unwrap();
    assert_eq!(profile.path_timeout_count, 1);

    // and the builder backs off from the base interval
    assert_eq!(builder.build_interval_limit(), MIN_PATH_BUILD_INTERVAL * 2);
}

#[test]
fn expiry_sweep_tears_down_short_lived_paths() {
    let crypto = test_crypto();
    let mut net = TestNet::new(2, t(1_000));
    let client_id = net.add_client(t(1_000));
    let client = &net.nodes[&client_id];

    let config = PathConfig {
        num_hops: 2,
        num_paths: 1,
        default_lifetime: Duration::from_secs(1),
        ..PathConfig::default()
    };
    let builder = Arc::new(Builder::new("brief", PathRole::ANY, config));
    client.context.register_builder(builder.clone());

    let path = builder
        .build(
            net.rcs(),
            crypto,
            &client.context,
            &client.transport,
            &client.profiles,
            t(1_000),
        )
        .unwrap();
    let rx_id = path.rx_id();
    let tx_id = path.tx_id();

    let mut handler = CapturingHandler::default();
    net.run_until_quiet(&mut handler, t(1_100));
    assert_eq!(path.status(), PathStatus::Established);
    assert!(client.context.get_owned_path(&rx_id).is_some());

    // advance past the one-second lifetime and sweep
    client.context.tick(&client.services(), t(3_000));

    assert!(path.expired(t(3_000)));
    assert!(builder.pathset().get_path_by_id(&rx_id).is_none());
    assert!(client.context.get_owned_path(&rx_id).is_none());

    let forgotten = net.net.forgotten_for(&client_id);
    assert!(forgotten.contains(&rx_id), "transport must forget the rx id");
    assert!(forgotten.contains(&tx_id), "transport must forget the tx id");
}

#[test]
fn relay_side_hops_expire_too() {
    let crypto = test_crypto();
    let mut net = TestNet::new(2, t(1_000));
    let client_id = net.add_client(t(1_000));
    let client = &net.nodes[&client_id];

    let config = PathConfig {
        num_hops: 2,
        num_paths: 1,
        default_lifetime: Duration::from_secs(1),
        ..PathConfig::default()
    };
    let builder = Arc::new(Builder::new("brief", PathRole::ANY, config));
    client.context.register_builder(builder.clone());
    builder
        .build(
            net.rcs(),
            crypto,
            &client.context,
            &client.transport,
            &client.profiles,
            t(1_000),
        )
        .unwrap();
    let mut handler = CapturingHandler::default();
    net.run_until_quiet(&mut handler, t(1_100));
    assert_eq!(net.node(0).context.current_transit_count(), 1);

    let r0 = net.node(0);
    r0.context.expire_paths(t(3_000), &r0.transport);
    assert_eq!(r0.context.current_transit_count(), 0);
    assert!(!net.net.forgotten_for(&r0.router_id()).is_empty());
}
