#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use polsync_client::ResourceClient;
use polsync_core::api::BgpPeerSpec;
use polsync_core::options::{DeleteOptions, GetOptions, ListOptions, SetOptions};
use polsync_core::{Backend, Capabilities, Resource, Revision, WatchEvent, WatchEventType, WatchStream};
use polsync_store::MemoryBackend;

const NAME1: &str = "bgppeer-1";
const NAME2: &str = "bgppeer-2";

fn spec1() -> BgpPeerSpec {
    BgpPeerSpec { node: Some("node1".into()), peer_ip: "10.0.0.1".into(), as_number: 6512 }
}

fn spec2() -> BgpPeerSpec {
    BgpPeerSpec { node: Some("node2".into()), peer_ip: "20.0.0.1".into(), as_number: 6511 }
}

fn setup() -> (MemoryBackend, ResourceClient<BgpPeerSpec>) {
    let be = MemoryBackend::new();
    let client = ResourceClient::new(Arc::new(be.clone()) as Arc<dyn Backend>);
    (be, client)
}

fn not_found_prefix(name: &str) -> String {
    format!("resource does not exist: BGPPeer({name}) with error:")
}

async fn expect_events(w: &mut WatchStream<BgpPeerSpec>, expected: &[WatchEvent<BgpPeerSpec>]) {
    for want in expected {
        let got = tokio::time::timeout(Duration::from_secs(1), w.next()).await.expect("event in time").expect("stream open");
        assert_eq!(&got, want);
    }
    assert!(tokio::time::timeout(Duration::from_millis(50), w.next()).await.is_err(), "unexpected extra event");
}

#[tokio::test]
async fn crud_lifecycle() {
    let (_be, c) = setup();

    // Update before create.
    let mut ghost = c.resource(NAME1, spec1());
    ghost.metadata.resource_version = Some(Revision::from("1234"));
    ghost.metadata.creation_timestamp = Some(chrono::Utc::now());
    ghost.metadata.uid = Some("test-fail-bgppeer".into());
    let err = c.update(ghost, SetOptions::default()).await.unwrap_err();
    assert!(err.to_string().starts_with(&not_found_prefix(NAME1)), "{err}");

    let res1 = c.create(c.resource(NAME1, spec1()), SetOptions::default()).await.unwrap();
    assert_eq!(res1.spec, spec1());
    assert_eq!(res1.metadata.name, NAME1);
    let rv1_1 = res1.revision().cloned().unwrap();

    let err = c.create(c.resource(NAME1, spec2()), SetOptions::default()).await.unwrap_err();
    assert_eq!(err.to_string(), format!("resource already exists: BGPPeer({NAME1})"));

    let got = c.get(NAME1, GetOptions::default()).await.unwrap();
    assert_eq!(got, res1);

    let err = c.get(NAME2, GetOptions::default()).await.unwrap_err();
    assert!(err.to_string().starts_with(&not_found_prefix(NAME2)));

    let res2 = c.create(c.resource(NAME2, spec2()), SetOptions::default()).await.unwrap();
    let list = c.list(ListOptions::default()).await.unwrap();
    assert_eq!(list.items, vec![res1.clone(), res2.clone()]);

    let mut next = res1.clone();
    next.spec = spec2();
    let res1_2 = c.update(next, SetOptions::default()).await.unwrap();
    assert_eq!(res1_2.spec, spec2());
    assert_eq!(res1_2.metadata.uid, res1.metadata.uid);
    let rv1_2 = res1_2.revision().cloned().unwrap();
    assert!(rv1_2 > rv1_1);

    // Stale revision: conflict, nothing changes.
    let mut stale = res1_2.clone();
    stale.spec = spec1();
    stale.metadata.resource_version = Some(rv1_1.clone());
    let err = c.update(stale, SetOptions::default()).await.unwrap_err();
    assert_eq!(err.to_string(), format!("update conflict: BGPPeer({NAME1})"));
    assert_eq!(c.get(NAME1, GetOptions::default()).await.unwrap(), res1_2);

    // Point-in-time reads.
    let old = c.get(NAME1, GetOptions { resource_version: Some(rv1_1.clone()) }).await.unwrap();
    assert_eq!(old.spec, spec1());
    assert_eq!(old.revision(), Some(&rv1_1));
    let new = c.get(NAME1, GetOptions { resource_version: Some(rv1_2.clone()) }).await.unwrap();
    assert_eq!(new.spec, spec2());

    let old_list = c.list(ListOptions::from_revision(rv1_1.clone())).await.unwrap();
    assert_eq!(old_list.items.len(), 1);
    assert_eq!(old_list.items[0].spec, spec1());
    let list = c.list(ListOptions::default()).await.unwrap();
    assert_eq!(list.items.len(), 2);
    assert_eq!(list.items[0].spec, spec2());

    let err = c.delete(NAME1, DeleteOptions { resource_version: Some(rv1_1) }).await.unwrap_err();
    assert_eq!(err.to_string(), format!("update conflict: BGPPeer({NAME1})"));
    assert!(c.get(NAME1, GetOptions::default()).await.is_ok());

    let gone = c.delete(NAME1, DeleteOptions { resource_version: Some(rv1_2) }).await.unwrap();
    assert_eq!(gone.spec, spec2());
    assert!(c.get(NAME1, GetOptions::default()).await.unwrap_err().is_not_found());

    c.delete(NAME2, DeleteOptions::default()).await.unwrap();
    let err = c.delete(NAME2, DeleteOptions::default()).await.unwrap_err();
    assert!(err.to_string().starts_with(&not_found_prefix(NAME2)));
    assert!(c.list(ListOptions::default()).await.unwrap().items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn ttl_on_update_expires_the_key() {
    let (_be, c) = setup();
    let res2 = c.create(c.resource(NAME2, spec2()), SetOptions::default()).await.unwrap();
    c.update(res2, SetOptions::with_ttl(Duration::from_secs(2))).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(c.get(NAME2, GetOptions::default()).await.is_ok());
    tokio::time::sleep(Duration::from_secs(2)).await;
    let err = c.get(NAME2, GetOptions::default()).await.unwrap_err();
    assert!(err.to_string().starts_with(&not_found_prefix(NAME2)));
}

#[tokio::test(start_paused = true)]
async fn ttl_on_create_expires_the_key() {
    let (_be, c) = setup();
    c.create(c.resource(NAME2, spec2()), SetOptions::with_ttl(Duration::from_secs(2))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(c.get(NAME2, GetOptions::default()).await.is_ok());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(c.get(NAME2, GetOptions::default()).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn watch_resume_and_snapshot() {
    let (be, c) = setup();
    let rev0 = c.list(ListOptions::default()).await.unwrap().revision;

    let out1 = c.create(c.resource(NAME1, spec1()), SetOptions::default()).await.unwrap();
    let rev1 = out1.revision().cloned().unwrap();
    let out2 = c.create(c.resource(NAME2, spec2()), SetOptions::default()).await.unwrap();

    // From rev1: skips the first creation.
    let mut w1 = c.watch(ListOptions::from_revision(rev1)).await.unwrap();
    let deleted = c.delete(NAME1, DeleteOptions::default()).await.unwrap();
    let del_rev = be.revision();
    expect_events(
        &mut w1,
        &[WatchEvent::Added(out2.clone()), WatchEvent::Deleted { previous: out1.clone(), revision: del_rev.clone() }],
    )
    .await;
    assert_eq!(deleted, out1);
    w1.stop();

    // From rev0: every event.
    let mut w2 = c.watch(ListOptions::from_revision(rev0.clone())).await.unwrap();
    let mut next: Resource<BgpPeerSpec> = out2.clone();
    next.spec = spec1();
    let out3 = c.update(next, SetOptions::default()).await.unwrap();
    expect_events(
        &mut w2,
        &[
            WatchEvent::Added(out1.clone()),
            WatchEvent::Added(out2.clone()),
            WatchEvent::Deleted { previous: out1.clone(), revision: del_rev.clone() },
            WatchEvent::Modified { previous: Some(out2.clone()), object: out3.clone() },
        ],
    )
    .await;
    w2.stop();

    // Single key from rev0.
    let opts = ListOptions { name: Some(NAME1.into()), resource_version: Some(rev0), ..ListOptions::default() };
    let mut w21 = c.watch(opts).await.unwrap();
    expect_events(&mut w21, &[WatchEvent::Added(out1.clone()), WatchEvent::Deleted { previous: out1, revision: del_rev }])
        .await;

    // No revision: current snapshot.
    let mut w3 = c.watch(ListOptions::default()).await.unwrap();
    expect_events(&mut w3, &[WatchEvent::Added(out3.clone())]).await;
    w3.stop();

    let again = c.create(c.resource(NAME1, spec1()), SetOptions::default()).await.unwrap();
    let mut w4 = c.watch(ListOptions::default()).await.unwrap();
    let mut snap = Vec::new();
    for _ in 0..2 {
        snap.push(w4.next().await.unwrap());
    }
    assert!(snap.iter().all(|e| e.event_type() == WatchEventType::Added));
    assert!(snap.contains(&WatchEvent::Added(again.clone())));
    assert!(snap.contains(&WatchEvent::Added(out3.clone())));

    // Bulk clean: one deletion per key.
    be.clean();
    let mut dels = Vec::new();
    for _ in 0..2 {
        let ev = w4.next().await.unwrap();
        assert_eq!(ev.event_type(), WatchEventType::Deleted);
        dels.push(ev.previous().cloned().unwrap());
    }
    assert_eq!(dels, vec![again, out3]);
    w4.stop();
    assert!(w4.next().await.is_none());
}

/// Backend stub advertising no optional capabilities.
struct Minimal(MemoryBackend);

#[async_trait::async_trait]
impl Backend for Minimal {
    fn name(&self) -> &'static str {
        "minimal"
    }
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
    async fn create(&self, r: Resource, ttl: Option<Duration>) -> polsync_core::Result<Resource> {
        self.0.create(r, ttl).await
    }
    async fn update(&self, r: Resource, ttl: Option<Duration>) -> polsync_core::Result<Resource> {
        self.0.update(r, ttl).await
    }
    async fn get(&self, k: &polsync_core::ResourceKey, rev: Option<&Revision>) -> polsync_core::Result<Resource> {
        self.0.get(k, rev).await
    }
    async fn delete(&self, k: &polsync_core::ResourceKey, rev: Option<&Revision>) -> polsync_core::Result<Resource> {
        self.0.delete(k, rev).await
    }
    async fn list(&self, kind: &polsync_core::Kind, o: &ListOptions) -> polsync_core::Result<polsync_core::ResourceList> {
        self.0.list(kind, o).await
    }
    async fn watch(&self, kind: &polsync_core::Kind, o: &ListOptions) -> polsync_core::Result<WatchStream> {
        self.0.watch(kind, o).await
    }
}

#[tokio::test]
async fn unsupported_capabilities_are_rejected_up_front() {
    let c: ResourceClient<BgpPeerSpec> = ResourceClient::new(Arc::new(Minimal(MemoryBackend::new())));
    let err = c.watch(ListOptions::for_name(NAME1)).await.unwrap_err();
    assert_eq!(err.field(), Some("ListOptions.Name"));
    let err = c.create(c.resource(NAME1, spec1()), SetOptions::with_ttl(Duration::from_secs(1))).await.unwrap_err();
    assert_eq!(err.field(), Some("Options.TTL"));
    assert!(c.get(NAME1, GetOptions::default()).await.unwrap_err().is_not_found());

    let created = c.create(c.resource(NAME1, spec1()), SetOptions::default()).await.unwrap();
    let rev = created.revision().cloned().unwrap();
    let err = c.get(NAME1, GetOptions { resource_version: Some(rev.clone()) }).await.unwrap_err();
    assert_eq!(err.field(), Some("GetOptions.ResourceVersion"));
    // A list revision is only a lower bound, so it stays allowed.
    let listed = c.list(ListOptions::from_revision(rev)).await.unwrap();
    assert_eq!(listed.items.len(), 1);
}

#[tokio::test]
async fn deadline_exceeded_is_cancelled() {
    struct Slow;
    #[async_trait::async_trait]
    impl Backend for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
        async fn create(&self, r: Resource, _: Option<Duration>) -> polsync_core::Result<Resource> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(r)
        }
        async fn update(&self, r: Resource, _: Option<Duration>) -> polsync_core::Result<Resource> {
            Ok(r)
        }
        async fn get(&self, k: &polsync_core::ResourceKey, _: Option<&Revision>) -> polsync_core::Result<Resource> {
            Err(polsync_core::Error::not_found(k.clone(), "slow"))
        }
        async fn delete(&self, k: &polsync_core::ResourceKey, _: Option<&Revision>) -> polsync_core::Result<Resource> {
            Err(polsync_core::Error::not_found(k.clone(), "slow"))
        }
        async fn list(&self, _: &polsync_core::Kind, _: &ListOptions) -> polsync_core::Result<polsync_core::ResourceList> {
            Ok(polsync_core::ResourceList { items: Vec::new(), revision: Revision::from_counter(0) })
        }
        async fn watch(&self, _: &polsync_core::Kind, _: &ListOptions) -> polsync_core::Result<WatchStream> {
            Ok(WatchStream::channel(1).1)
        }
    }

    let c: ResourceClient<BgpPeerSpec> =
        ResourceClient::new(Arc::new(Slow)).with_deadline(Duration::from_millis(20));
    let err = c.create(c.resource(NAME1, spec1()), SetOptions::default()).await.unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert!(err.to_string().contains("deadline"));
}
