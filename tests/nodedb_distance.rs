//! S2: XOR-nearest queries over the contact cache.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use veilnet_contact::{NetId, RouterContact};
use veilnet_core::config::NodeDbConfig;
use veilnet_core::{InlineDispatcher, RouterId, Time};
use veilnet_crypto::Identity;
use veilnet_nodedb::NodeDb;
use veilnet_tests::test_crypto;

fn now() -> Time {
    Duration::from_millis(1_700_000_000_000)
}

/// A contact whose router id is forced to `id`. The db does not check
/// signatures (that happens before insertion), so tests can pin ids.
fn rc_with_id(id: RouterId) -> RouterContact {
    let crypto = test_crypto();
    let identity = Identity::generate();
    let mut rc = RouterContact::new_signed(
        crypto,
        &identity,
        SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 1090),
        NetId::default(),
        now(),
    );
    rc.pub_key = id;
    rc
}

fn id_from_tail(tail: u8) -> RouterId {
    let mut bytes = [0u8; 32];
    bytes[31] = tail;
    RouterId(bytes)
}

#[test]
fn closest_three_out_of_four() {
    let db = NodeDb::in_memory(Arc::new(InlineDispatcher), NodeDbConfig::default());
    let ids = [
        id_from_tail(0x00),
        id_from_tail(0x01),
        id_from_tail(0x02),
        RouterId([0xff; 32]),
    ];
    for id in ids {
        db.put(rc_with_id(id), now());
    }

    let got = db.find_many_closest_to(&id_from_tail(0x00), 3);
    let got_ids: Vec<RouterId> = got.iter().map(|rc| rc.router_id()).collect();
    assert_eq!(got_ids, vec![ids[0], ids[1], ids[2]]);
}

#[test]
fn asking_for_more_than_the_db_holds_returns_all() {
    let db = NodeDb::in_memory(Arc::new(InlineDispatcher), NodeDbConfig::default());
    for tail in 0..5 {
        db.put(rc_with_id(id_from_tail(tail)), now());
    }
    assert_eq!(db.find_many_closest_to(&id_from_tail(0), 5).len(), 5);
    assert_eq!(db.find_many_closest_to(&id_from_tail(0), 64).len(), 5);
}

#[test]
fn ordering_is_strict_and_ties_break_by_pubkey() {
    let db = NodeDb::in_memory(Arc::new(InlineDispatcher), NodeDbConfig::default());
    for tail in 0..16 {
        db.put(rc_with_id(id_from_tail(tail)), now());
    }
    let key = id_from_tail(0x05);
    let sorted = db.find_many_closest_to(&key, 16);
    for pair in sorted.windows(2) {
        let a = pair[0].router_id().xor_distance(&key);
        let b = pair[1].router_id().xor_distance(&key);
        assert!(
            a < b || (a == b && pair[0].router_id() < pair[1].router_id()),
            "result not sorted by xor distance"
        );
    }
    // the key itself is its own nearest neighbour
    assert_eq!(sorted[0].router_id(), key);
    assert_eq!(db.find_closest_to(&key).unwrap().router_id(), key);
}

#[test]
fn closest_survives_disk_reload() {
    let crypto = test_crypto();
    let dir = tempfile::tempdir().unwrap();
    let db = NodeDb::new(
        dir.path().to_path_buf(),
        Arc::new(InlineDispatcher),
        NodeDbConfig::default(),
    );
    for i in 0..4u16 {
        let identity = Identity::generate();
        let rc = RouterContact::new_signed(
            crypto,
            &identity,
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 1090 + i),
            NetId::default(),
            now(),
        );
        db.put(rc, now());
    }
    let key = RouterId([0x42; 32]);
    let before: Vec<RouterId> = db
        .find_many_closest_to(&key, 4)
        .iter()
        .map(|rc| rc.router_id())
        .collect();

    let reloaded = NodeDb::new(
        dir.path().to_path_buf(),
        Arc::new(InlineDispatcher),
        NodeDbConfig::default(),
    );
    assert_eq!(reloaded.load_from_disk(now()).unwrap(), 4);
    let after: Vec<RouterId> = reloaded
        .find_many_closest_to(&key, 4)
        .iter()
        .map(|rc| rc.router_id())
        .collect();
    assert_eq!(before, after);
}
