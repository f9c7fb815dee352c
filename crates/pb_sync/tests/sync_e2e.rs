//! End-to-end scenarios against the in-memory relay double.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use pb_crypto::{aead, identity::IdentityKeyPair, kdf};
use pb_proto::{event::streams, payload::ClipboardPayload, Event, EventKind, EventPayload};
use pb_store::{EventLog, Settings, Store};
use pb_sync::{Config, ConnectionStatus, PocketBridge, SyncError};

use support::{wait_for, TestRelay};

const WAIT: Duration = Duration::from_secs(5);

async fn seeded_client(
    relay: &Arc<TestRelay>,
    identity: &IdentityKeyPair,
    dir: &TempDir,
    name: &str,
    tweak: impl FnOnce(&mut Config),
) -> PocketBridge {
    let db = dir.path().join(format!("{name}.db"));
    {
        let store = Store::open(&db).await.unwrap();
        Settings::new(store).replace_identity(identity).await.unwrap();
    }
    let mut config = Config {
        ws_url: Some("ws://relay.test/ws".into()),
        db_path: Some(db),
        device_name: name.to_string(),
        ..Config::default()
    };
    tweak(&mut config);
    PocketBridge::init_with_connector(config, relay.connector())
        .await
        .unwrap()
}

fn fabricated_clipboard_event(
    identity: &IdentityKeyPair,
    device_id: &str,
    device_seq: u64,
    text: &str,
) -> Event {
    let key = kdf::derive_shared_key(identity.secret_bytes(), identity.public_hex()).unwrap();
    let payload = EventPayload::Clipboard(ClipboardPayload { text: text.to_string() });
    Event {
        event_id: Event::new_id(),
        user_id: identity.public_hex().to_string(),
        device_id: device_id.to_string(),
        device_seq,
        stream_id: streams::CLIPBOARD.to_string(),
        stream_seq: 0,
        kind: EventKind::ClipboardText,
        encrypted_payload: aead::encrypt_b64(key.as_bytes(), &payload.to_bytes().unwrap())
            .unwrap(),
        ttl: None,
        created_at: None,
    }
}

#[tokio::test]
async fn offline_queueing_drains_in_emission_order() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;
    let device_id = client.device().device_id;

    // Three updates while disconnected — nothing may reach the relay yet.
    for text in ["one", "two", "three"] {
        client.clipboard.send_text(text).await.unwrap().unwrap();
    }
    let status = client.queue_status().await.unwrap();
    assert_eq!(status.pending_count, 3);
    assert_eq!(relay.with_state(|s| s.received_order.len()), 0);

    client.connect().await.unwrap();
    let order = wait_for(WAIT, || {
        relay.with_state(|s| (s.received_order.len() >= 3).then(|| s.received_order.clone()))
    })
    .await;
    assert_eq!(
        order,
        vec![(device_id.clone(), 1), (device_id.clone(), 2), (device_id.clone(), 3)]
    );

    // Acks advance the high-water mark to the third event's sequence.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = client.queue_status().await.unwrap();
        if status.last_ack_device_seq == 3 && status.pending_count == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "acks never arrived: {status:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn clipboard_round_trip_between_two_devices() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();

    let alpha = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;
    alpha.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 1).then_some(()))).await;

    alpha.clipboard.send_text("hello").await.unwrap().unwrap();
    wait_for(WAIT, || relay.with_state(|s| (!s.events.is_empty()).then_some(()))).await;

    // A second device of the same user connects afterwards and receives
    // the history push.
    let beta = seeded_client(&relay, &identity, &dir, "beta", |_| {}).await;
    beta.connect().await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if beta.clipboard.latest_text().await.unwrap().as_deref() == Some("hello") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "clipboard never converged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn replay_pages_through_large_history() {
    let relay = TestRelay::new();
    relay.with_state(|s| s.push_history = false);
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();

    for seq in 1..=250u64 {
        relay.seed_event(fabricated_clipboard_event(
            &identity,
            "device-x",
            seq,
            &format!("text-{seq}"),
        ));
    }

    let client = seeded_client(&relay, &identity, &dir, "gamma", |_| {}).await;
    // A non-zero acknowledgement mark is what arms replay on establish.
    relay.set_last_ack(&client.device().device_id, 5);
    client.connect().await.unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if client.clipboard.latest_text().await.unwrap().as_deref() == Some("text-250") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "replay never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // All 250 replayed events landed exactly once.
    let blob = client.export().await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&blob).unwrap();
    assert_eq!(parsed["events"].as_array().unwrap().len(), 250);
}

#[tokio::test]
async fn close_1001_rotates_session_without_losing_events() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;

    let statuses: Arc<Mutex<Vec<ConnectionStatus>>> = Arc::default();
    let statuses2 = statuses.clone();
    let _sub = client.subscribe_status(move |s| statuses2.lock().unwrap().push(s));

    client.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 1).then_some(()))).await;
    client.clipboard.send_text("before rotation").await.unwrap().unwrap();
    wait_for(WAIT, || relay.with_state(|s| (!s.received_order.is_empty()).then_some(()))).await;

    relay.force_close(1001);

    // Scenario d: a fresh session within two seconds, no user action.
    wait_for(Duration::from_secs(2), || {
        relay.with_state(|s| (s.established >= 2).then_some(()))
    })
    .await;
    assert!(statuses.lock().unwrap().contains(&ConnectionStatus::Rotating));

    // The channel keeps working after rotation.
    client.clipboard.send_text("after rotation").await.unwrap().unwrap();
    wait_for(WAIT, || {
        relay.with_state(|s| (s.received_order.len() >= 2).then_some(()))
    })
    .await;

    // No post-ack re-emit: the acknowledged first event must not have
    // been transmitted again by the post-rotation drain.
    let order = relay.with_state(|s| s.received_order.clone());
    let firsts = order.iter().filter(|(_, seq)| *seq == 1).count();
    assert_eq!(firsts, 1, "acknowledged event was re-emitted: {order:?}");
}

#[tokio::test]
async fn full_resync_wipes_local_state_and_reconnects() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;

    client.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 1).then_some(()))).await;
    client.clipboard.send_text("to be wiped").await.unwrap().unwrap();
    wait_for(WAIT, || relay.with_state(|s| (!s.received_order.is_empty()).then_some(()))).await;

    relay.broadcast(&pb_proto::Frame::FullResyncRequired {
        reason: "server storage migration".into(),
        recommendation: Some("reconnect".into()),
    });

    // Log wiped and a fresh session established. The new session adopts
    // the relay's acknowledgement mark again, so only the log emptiness
    // proves the wipe.
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 2).then_some(()))).await;
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let status = client.queue_status().await.unwrap();
        let blob = client.export().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&blob).unwrap();
        if status.pending_count == 0 && parsed["events"].as_array().unwrap().is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "local state not wiped: {status:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn session_expiring_soon_triggers_clean_rotation() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;

    client.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 1).then_some(()))).await;

    // Announce an expiry just past the 30-second rotation lead: the
    // manager should rotate almost immediately.
    relay.broadcast(&pb_proto::Frame::SessionExpiringSoon {
        expires_in_seconds: 31,
        expires_at: pb_store::now_ms() + 30_200,
    });
    wait_for(Duration::from_secs(3), || {
        relay.with_state(|s| (s.established >= 2).then_some(()))
    })
    .await;
}

#[tokio::test]
async fn oversized_file_send_is_refused_by_queue_bounds() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |c| {
        c.chunk_size_bytes = 256;
        c.queue_max_count = 5;
    })
    .await;

    // 10 chunks against a 5-event bound — refused up front, nothing
    // half-written into the log.
    let payload = vec![7u8; 2_560];
    let err = client
        .files
        .send_file("big.bin", "application/octet-stream", &payload)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::QueueBounded), "got {err:?}");
    assert_eq!(client.queue_status().await.unwrap().pending_count, 0);
}

#[tokio::test]
async fn duplicated_server_hello_yields_exactly_one_client_auth() {
    let relay = TestRelay::new();
    relay.with_state(|s| s.duplicate_server_hello = true);
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;

    client.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 1).then_some(()))).await;
    // Give a straggler auth a moment to (wrongly) appear.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.with_state(|s| s.client_auth_count), 1);
}

#[tokio::test]
async fn sequence_advances_past_server_acknowledgement_mark() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |c| {
        // Replay is irrelevant here; the relay holds no history.
        c.replay_page_limit = 10;
    })
    .await;
    let device_id = client.device().device_id;

    // The server believes 42 events from this device are acknowledged —
    // a crash lost the local counter, say.
    relay.set_last_ack(&device_id, 42);
    client.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 1).then_some(()))).await;

    client.clipboard.send_text("post-crash").await.unwrap().unwrap();
    let order = wait_for(WAIT, || {
        relay.with_state(|s| s.received_order.last().cloned())
    })
    .await;
    assert_eq!(order, (device_id, 43));
}

#[tokio::test]
async fn tampered_file_chunk_fails_reassembly_with_integrity_error() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |c| {
        c.chunk_size_bytes = 1024;
    })
    .await;

    // Three chunks; everything stays local (no connection needed).
    let payload: Vec<u8> = (0..3_000u32).map(|i| (i % 251) as u8).collect();
    let transfer = client
        .files
        .send_file("blob.bin", "application/octet-stream", &payload)
        .await
        .unwrap();
    assert_eq!(transfer.total_chunks, 3);
    assert_eq!(client.files.reassemble(&transfer.file_id).await.unwrap(), payload);

    // Tamper with chunk 1 in storage: rewrite its inner hash under the
    // real shared key so only the per-chunk integrity check can notice.
    let key = kdf::derive_shared_key(identity.secret_bytes(), identity.public_hex()).unwrap();
    let store = Store::open(&dir.path().join("alpha.db")).await.unwrap();
    let log = EventLog::new(store.clone());
    let chunk_stream = streams::file_chunks(&transfer.file_id);
    let target = log
        .stream_events(&chunk_stream)
        .await
        .unwrap()
        .into_iter()
        .find(|stored| {
            let bytes =
                aead::decrypt_b64(key.as_bytes(), &stored.event.encrypted_payload).unwrap();
            matches!(
                EventPayload::from_bytes(stored.event.kind, &bytes),
                Ok(EventPayload::FileChunk(chunk)) if chunk.chunk_index == 1
            )
        })
        .expect("chunk 1 present");
    let bytes = aead::decrypt_b64(key.as_bytes(), &target.event.encrypted_payload).unwrap();
    let Ok(EventPayload::FileChunk(mut chunk)) =
        EventPayload::from_bytes(target.event.kind, &bytes)
    else {
        unreachable!()
    };
    chunk.hash = "00".repeat(32);
    let forged = aead::encrypt_b64(
        key.as_bytes(),
        &EventPayload::FileChunk(chunk).to_bytes().unwrap(),
    )
    .unwrap();
    sqlx::query("UPDATE events SET encrypted_payload = ? WHERE event_id = ?")
        .bind(&forged)
        .bind(&target.event.event_id)
        .execute(&store.pool)
        .await
        .unwrap();

    let err = client.files.reassemble(&transfer.file_id).await.unwrap_err();
    assert!(matches!(err, SyncError::IntegrityFailed(_)), "got {err:?}");
    // The offending event is retained for diagnosis.
    assert!(log.get(&target.event.event_id).await.unwrap().is_some());
}

#[tokio::test]
async fn self_destruct_messages_expire_but_events_remain() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;

    client.messages.send("burn after reading", Some(1)).await.unwrap();
    let active = client.messages.active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].text, "burn after reading");

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(client.messages.active().await.unwrap().is_empty());

    // The event itself survives for replay accounting.
    let report = client.integrity_check().await.unwrap();
    assert_eq!(report.events_total, 1);
}

#[tokio::test]
async fn deleted_message_payload_is_gone_for_good() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;

    let event = client.messages.send("secret", Some(3_600)).await.unwrap();
    client.messages.delete_payload(&event.event_id).await.unwrap();
    assert!(client.messages.active().await.unwrap().is_empty());

    let report = client.integrity_check().await.unwrap();
    assert_eq!(report.events_total, 1);
}

#[tokio::test]
async fn silent_relay_times_out_and_schedules_reconnect() {
    let relay = TestRelay::new();
    relay.with_state(|s| s.silent = true);
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();
    let client = seeded_client(&relay, &identity, &dir, "alpha", |c| {
        c.handshake_timeout_ms = 100;
    })
    .await;

    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    let errors2 = errors.clone();
    let _sub = client.subscribe_errors(move |e| errors2.lock().unwrap().push(e.to_string()));

    client.connect().await.unwrap();
    wait_for(WAIT, || {
        let errors = errors.lock().unwrap();
        errors
            .iter()
            .any(|e| e.contains("handshake rejected"))
            .then_some(())
    })
    .await;
    assert_eq!(client.connection_status(), ConnectionStatus::Error);
}

#[tokio::test]
async fn scratchpad_converges_across_devices() {
    let relay = TestRelay::new();
    let dir = TempDir::new().unwrap();
    let identity = IdentityKeyPair::generate();

    let alpha = seeded_client(&relay, &identity, &dir, "alpha", |_| {}).await;
    alpha.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 1).then_some(()))).await;

    let beta = seeded_client(&relay, &identity, &dir, "beta", |_| {}).await;
    beta.connect().await.unwrap();
    wait_for(WAIT, || relay.with_state(|s| (s.established >= 2).then_some(()))).await;

    alpha.scratchpad.set_text("hello from alpha").await.unwrap().unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if beta.scratchpad.text().unwrap() == "hello from alpha" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "scratchpad never converged");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Edits from the second device merge rather than clobber.
    beta.scratchpad.insert(0, ">> ").await.unwrap().unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if alpha.scratchpad.text().unwrap() == ">> hello from alpha" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "edit never propagated back");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A rebuild from the log reproduces the live document.
    assert_eq!(beta.scratchpad.rebuild_from_log().await.unwrap(), ">> hello from alpha");
}
