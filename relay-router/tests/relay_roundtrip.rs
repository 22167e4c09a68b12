//! End-to-end tests: real router over TCP, real clients.

use relay_client::{ClientConfig, ClientEvent, Direction, RelayClient, TcpTransport};
use relay_core::{GroupSecret, KdfKind, Status};
use relay_types::ClientId;
use shroud_relay_router::{serve, Config, RelayRouter};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(20);

async fn start_router() -> (Arc<RelayRouter>, String) {
    let router = Arc::new(RelayRouter::new(Config::default().validated()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(serve(router.clone(), listener));
    (router, addr)
}

fn client(
    addr: &str,
    name: &str,
) -> (RelayClient<TcpTransport>, UnboundedReceiver<ClientEvent>) {
    let secret = GroupSecret::derive(KdfKind::HkdfSha256, "integration").unwrap();
    let config = ClientConfig::new(addr, secret)
        .with_name(name)
        .with_ping_interval(Duration::from_millis(100));
    RelayClient::tcp(config).unwrap()
}

/// Wait for the first event `pick` accepts, skipping the rest.
async fn until<T>(
    events: &mut UnboundedReceiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("client event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for client event")
}

async fn joined(events: &mut UnboundedReceiver<ClientEvent>) -> ClientId {
    until(events, |e| match e {
        ClientEvent::Joined { client_id, .. } => Some(client_id),
        _ => None,
    })
    .await
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn members_chat_and_leave() {
    let (router, addr) = start_router().await;

    let (alice, mut alice_events) = client(&addr, "alice");
    let (bob, mut bob_events) = client(&addr, "bob");
    let alice_task = alice.spawn();
    let bob_task = bob.spawn();

    alice.start();
    let alice_id = joined(&mut alice_events).await;
    bob.start();
    let bob_id = joined(&mut bob_events).await;

    let seen = until(&mut alice_events, |e| match e {
        ClientEvent::MemberJoined(member) => Some(member),
        _ => None,
    })
    .await;
    assert_eq!(seen.client_id, bob_id);
    assert_eq!(seen.name, "bob");
    assert_eq!(router.client_count(), 2);
    assert_eq!(router.group_count(), 1);

    alice.chat("hello bob");
    let (from, private, text) = until(&mut bob_events, |e| match e {
        ClientEvent::Chat {
            from,
            private,
            text,
        } => Some((from, private, text)),
        _ => None,
    })
    .await;
    assert_eq!(from, alice_id);
    assert!(!private);
    assert_eq!(text, b"hello bob");

    alice.quit();
    let left = until(&mut bob_events, |e| match e {
        ClientEvent::MemberLeft(id) => Some(id),
        _ => None,
    })
    .await;
    assert_eq!(left, alice_id);
    eventually(|| router.client_count() == 1).await;

    alice.shutdown();
    bob.shutdown();
    alice_task.await.unwrap();
    bob_task.await.unwrap();
}

#[tokio::test]
async fn file_is_relayed_between_members() {
    let (router, addr) = start_router().await;
    let dir = tempfile::tempdir().unwrap();

    let content: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let source = dir.path().join("source.bin");
    let dest = dir.path().join("dest.bin");
    std::fs::write(&source, &content).unwrap();

    let (seeder, mut seeder_events) = client(&addr, "seeder");
    let (leecher, mut leecher_events) = client(&addr, "leecher");
    let seeder_task = seeder.spawn();
    let leecher_task = leecher.spawn();

    seeder.share("data.bin", &source);
    seeder.start();
    let seeder_id = joined(&mut seeder_events).await;
    leecher.start();
    joined(&mut leecher_events).await;

    leecher.download(seeder_id, "data.bin", content.len() as u64, &dest);

    let status = until(&mut leecher_events, |e| match e {
        ClientEvent::TransferFinished {
            direction: Direction::Download,
            status,
            ..
        } => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(status, Status::Success);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    eventually(|| router.transfer_count() == 0).await;
    assert!(router.metrics().bytes_sent.load(std::sync::atomic::Ordering::Relaxed) >= content.len() as u64);

    seeder.shutdown();
    leecher.shutdown();
    seeder_task.await.unwrap();
    leecher_task.await.unwrap();
}

#[tokio::test]
async fn browse_and_search_are_answered() {
    let (_router, addr) = start_router().await;
    let dir = tempfile::tempdir().unwrap();
    let track = dir.path().join("track.flac");
    std::fs::write(&track, vec![1u8; 2_048]).unwrap();

    let (alice, mut alice_events) = client(&addr, "alice");
    let (bob, mut bob_events) = client(&addr, "bob");
    let alice_task = alice.spawn();
    let bob_task = bob.spawn();

    alice.share("track.flac", &track);
    alice.start();
    let alice_id = joined(&mut alice_events).await;
    bob.start();
    let bob_id = joined(&mut bob_events).await;

    bob.browse(alice_id, "/");
    let (from, path) = until(&mut alice_events, |e| match e {
        ClientEvent::BrowseRequested { from, path } => Some((from, path)),
        _ => None,
    })
    .await;
    assert_eq!(from, bob_id);
    alice.respond_browse(from, path);

    let (from, entries) = until(&mut bob_events, |e| match e {
        ClientEvent::BrowseResult { from, entries, .. } => Some((from, entries)),
        _ => None,
    })
    .await;
    assert_eq!(from, alice_id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "track.flac");
    assert_eq!(entries[0].size, 2_048);

    bob.search("flac");
    let (from, keywords) = until(&mut alice_events, |e| match e {
        ClientEvent::SearchRequested { from, keywords } => Some((from, keywords)),
        _ => None,
    })
    .await;
    alice.respond_search(from, keywords);

    let results = until(&mut bob_events, |e| match e {
        ClientEvent::SearchResult { results, .. } => Some(results),
        _ => None,
    })
    .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "track.flac");

    alice.shutdown();
    bob.shutdown();
    alice_task.await.unwrap();
    bob_task.await.unwrap();
}
