#![allow(dead_code)]

use peer_call::calls::loopback::{LoopbackMedia, LoopbackPeerFactory};
use peer_call::calls::{InMemoryChannel, StaticProfiles};
use peer_call::{
    CallBackends, CallConfig, CallManager, CallNotification, CallStatus, SignalingMessage,
    SignalingType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(10);

/// One user with loopback devices, wired to a shared hub.
pub struct Party {
    pub manager: CallManager,
    pub media: LoopbackMedia,
    pub peers: LoopbackPeerFactory,
    pub events: broadcast::Receiver<CallNotification>,
}

pub fn profiles() -> Arc<StaticProfiles> {
    Arc::new(
        StaticProfiles::new()
            .with("alice", "Alice")
            .with("bob", "Bob")
            .with("carol", "Carol"),
    )
}

pub async fn party(hub: &InMemoryChannel, name: &str) -> Party {
    party_with(hub, name, &CallConfig::default()).await
}

pub async fn party_with(hub: &InMemoryChannel, name: &str, config: &CallConfig) -> Party {
    let media = LoopbackMedia::new();
    let peers = LoopbackPeerFactory::new();
    let manager = CallManager::connect(
        name,
        config,
        CallBackends {
            channel: Arc::new(hub.clone()),
            devices: Arc::new(media.clone()),
            peers: Arc::new(peers.clone()),
            profiles: Some(profiles()),
        },
    )
    .await
    .expect("connect");
    let events = manager.notifications();
    Party {
        manager,
        media,
        peers,
        events,
    }
}

pub async fn wait_status(manager: &CallManager, want: CallStatus) {
    let mut status = manager.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| {
            panic!(
                "{} never reached {want}, stuck in {}",
                manager.local_user(),
                manager.status()
            )
        })
        .expect("status channel closed");
}

/// Next notification matching `pred`, skipping the rest.
pub async fn next_matching(
    events: &mut broadcast::Receiver<CallNotification>,
    pred: impl Fn(&CallNotification) -> bool,
) -> CallNotification {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(note) if pred(&note) => return note,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("notifications closed: {e}"),
            }
        }
    })
    .await
    .expect("notification never arrived")
}

pub async fn ended(events: &mut broadcast::Receiver<CallNotification>) -> CallNotification {
    next_matching(events, |n| matches!(n, CallNotification::Ended { .. })).await
}

/// Wait until at least `count` messages of `kind` are held by the hub.
pub async fn wait_held(hub: &InMemoryChannel, kind: SignalingType, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            let held = hub.held().await.iter().filter(|m| m.kind == kind).count();
            if held >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("messages never published");
}

/// Wait until the party has applied at least `count` remote candidates.
pub async fn wait_candidates(party: &Party, count: usize) {
    tokio::time::timeout(WAIT, async {
        while party.peers.probe().applied_candidates().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("candidates never applied");
}

/// Published messages of the given sender, candidates left out.
pub async fn control_flow(hub: &InMemoryChannel, sender: &str) -> Vec<SignalingType> {
    hub.published()
        .await
        .iter()
        .filter(|m| m.sender_id.as_str() == sender && m.kind != SignalingType::IceCandidate)
        .map(|m| m.kind)
        .collect()
}

pub async fn published_by(
    hub: &InMemoryChannel,
    sender: &str,
    kind: SignalingType,
) -> Vec<SignalingMessage> {
    hub.published()
        .await
        .into_iter()
        .filter(|m| m.sender_id.as_str() == sender && m.kind == kind)
        .collect()
}

/// Alice calls Bob and Bob answers; returns once both are connected.
pub async fn connected_pair(hub: &InMemoryChannel, kind: peer_call::CallKind) -> (Party, Party) {
    let alice = party(hub, "alice").await;
    let bob = party(hub, "bob").await;
    alice.manager.start_call("bob", kind).await.expect("start");
    wait_status(&bob.manager, CallStatus::Incoming).await;
    bob.manager.answer_call().await.expect("answer");
    wait_status(&alice.manager, CallStatus::Connected).await;
    (alice, bob)
}
