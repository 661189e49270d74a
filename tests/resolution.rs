//! Integration tests for resolution, reverse resolution and cache
//! migration between owners.

use std::sync::Arc;
use std::time::Duration;

use andna::locator::synthetic_address;
use andna::{
    AndnaConfig, AndnaError, AndnaNode, HostnameHash, InProcessNetwork, Keypair, MeshView,
    PeerAddress, PeerRegistry, Relation, ServiceRecord, ServiceSelector, StaticTopology, locate,
};

type Node = AndnaNode<InProcessNetwork, StaticTopology>;

struct TestMesh {
    mesh: MeshView,
    registry: PeerRegistry,
}

impl TestMesh {
    fn new() -> Self {
        Self {
            mesh: MeshView::new(),
            registry: PeerRegistry::new(),
        }
    }

    fn spawn(&self, at: PeerAddress) -> Node {
        let config = AndnaConfig {
            min_update_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(2),
            ..AndnaConfig::default()
        };
        let topology = Arc::new(StaticTopology::new(at, self.mesh.clone()));
        let node = AndnaNode::new(config, Keypair::generate(), topology, self.registry.network(at));
        self.registry.register(at, node.clone());
        node
    }
}

fn addr(s: &str) -> PeerAddress {
    s.parse().unwrap()
}

fn hostname_where(pred: impl Fn(PeerAddress) -> bool) -> String {
    (0..200_000)
        .map(|i| format!("site-{i}"))
        .find(|name| pred(synthetic_address(&HostnameHash::of_hostname(name))))
        .expect("no hostname matches")
}

#[tokio::test]
async fn scenario_c_resolve_before_and_after_registration() {
    let net = TestMesh::new();
    let registrant = net.spawn(addr("10.0.0.1"));
    let resolver = net.spawn(addr("20.0.0.1"));

    // Owned by the registrant's group, so the resolver has to go remote.
    let name = hostname_where(|s| s.position(0) < 15);
    let hash = HostnameHash::of_hostname(&name);

    assert_eq!(
        resolver.resolve(&name, ServiceSelector::default()).await,
        Err(AndnaError::NoSuchHostname)
    );

    registrant.add_hostname(&name, Vec::new()).await.unwrap();
    registrant.register_hostname(&name).await.unwrap();

    let reply = resolver.lookup(hash, ServiceSelector::default()).await.unwrap();
    assert_eq!(reply.records, vec![ServiceRecord::primary(registrant.address())]);
    assert!(reply.elapsed_ms < 60_000);
    assert_eq!(resolver.stats().await.resolved, 1);

    // Answered from the resolved-name cache from now on.
    let before = net.registry.received_count(&registrant.address());
    let again = resolver.lookup(hash, ServiceSelector::default()).await.unwrap();
    assert_eq!(again.records, reply.records);
    assert!(again.elapsed_ms >= reply.elapsed_ms);
    assert_eq!(net.registry.received_count(&registrant.address()), before);
}

#[tokio::test]
async fn own_hostnames_resolve_locally() {
    let net = TestMesh::new();
    let node = net.spawn(addr("10.0.0.1"));
    let _other = net.spawn(addr("20.0.0.1"));
    node.add_hostname("home", Vec::new()).await.unwrap();

    let records = node.resolve("HOME", ServiceSelector::default()).await.unwrap();
    assert_eq!(records, vec![ServiceRecord::primary(node.address())]);
    assert_eq!(net.registry.received_count(&addr("20.0.0.1")), 0);
}

#[tokio::test]
async fn scenario_d_new_owner_adopts_entry_once() {
    let net = TestMesh::new();
    let previous = net.spawn(addr("10.0.0.1"));

    let name = hostname_where(|s| s.position(0) != 10);
    let hash = HostnameHash::of_hostname(&name);
    previous.add_hostname(&name, Vec::new()).await.unwrap();
    previous.register_hostname(&name).await.unwrap();
    assert!(previous.andna_entry(&hash).await.is_some());

    // A peer joining exactly at the hash position takes over ownership.
    let heir = net.spawn(synthetic_address(&hash));
    assert_eq!(
        locate(heir.topology().as_ref(), &hash, &[], false).relation,
        Relation::IAmOwner
    );
    assert!(heir.is_young_owner());

    let records = heir.resolve(&name, ServiceSelector::default()).await.unwrap();
    assert_eq!(records, vec![ServiceRecord::primary(previous.address())]);
    let adopted = heir.andna_entry(&hash).await.expect("entry adopted");
    assert!(!adopted.flags.backup);

    // Later lookups are answered by the heir alone.
    let asked = net.registry.received_count(&previous.address());
    let outsider = net.spawn(addr("200.0.0.1"));
    let records = outsider.resolve(&name, ServiceSelector::default()).await.unwrap();
    assert_eq!(records, vec![ServiceRecord::primary(previous.address())]);
    assert_eq!(net.registry.received_count(&previous.address()), asked);
}

#[tokio::test]
async fn reverse_resolution_lists_registered_hostnames() {
    let net = TestMesh::new();
    let node = net.spawn(addr("10.0.0.1"));
    let asker = net.spawn(addr("10.0.0.2"));

    node.add_hostname("alpha", Vec::new()).await.unwrap();
    node.add_hostname("beta", Vec::new()).await.unwrap();
    node.register_hostname("alpha").await.unwrap();

    let names = asker.reverse_resolve(node.address()).await.unwrap();
    assert_eq!(names, vec!["alpha".to_string()]);

    net.registry.set_unreachable(node.address(), true);
    assert_eq!(
        asker.reverse_resolve(node.address()).await,
        Err(AndnaError::NetworkTimeout)
    );
}

#[tokio::test]
async fn joining_peer_copies_group_caches() {
    let net = TestMesh::new();
    let a = net.spawn(addr("10.0.0.1"));
    let b = net.spawn(addr("10.0.0.2"));
    a.add_hostname("gamma", Vec::new()).await.unwrap();
    b.add_hostname("delta", Vec::new()).await.unwrap();
    a.register_hostname("gamma").await.unwrap();
    b.register_hostname("delta").await.unwrap();
    // Let both claims reach the whole group.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let joiner = net.spawn(addr("10.0.0.3"));
    let received = joiner.join_group().await.unwrap();
    assert!(received >= 2);
    for name in ["gamma", "delta"] {
        assert!(joiner.andna_entry(&HostnameHash::of_hostname(name)).await.is_some());
    }
    assert_eq!(joiner.stats().await.andna, 2);
}

#[tokio::test]
async fn unknown_service_falls_back_to_default_records() {
    let net = TestMesh::new();
    let registrant = net.spawn(addr("10.0.0.1"));
    let resolver = net.spawn(addr("10.0.0.2"));
    let mail = ServiceRecord {
        service: 25,
        protocol: andna::Protocol::Tcp,
        priority: 0,
        weight: 1,
        target: andna::RecordTarget::Address(addr("10.0.0.40")),
    };
    registrant.add_hostname("mixed", vec![mail.clone()]).await.unwrap();
    registrant.register_hostname("mixed").await.unwrap();

    let smtp = ServiceSelector::new(25, andna::Protocol::Tcp);
    assert_eq!(resolver.resolve("mixed", smtp).await.unwrap(), vec![mail]);

    let http = ServiceSelector::new(80, andna::Protocol::Tcp);
    assert_eq!(
        resolver.resolve("mixed", http).await.unwrap(),
        vec![ServiceRecord::primary(registrant.address())]
    );
}
