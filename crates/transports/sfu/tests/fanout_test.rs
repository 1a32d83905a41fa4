//! Producer/consumer session integration tests
//!
//! Multi-client fan-out through the client orchestrator: initial
//! subscription, incremental re-listing on `newProducer`, and teardown
//! on `producerClosed`.

mod harness;

use harness::{within, SfuTestHarness, SimulatedDevice, WAIT};
use relaycast_sfu::client::{ConsumerState, ConsumerUpdate, ProducerState};
use relaycast_sfu::engine::MediaKind;
use relaycast_sfu::SfuEvent;
use std::sync::Arc;
use std::time::Duration;

/// Connection id of the next producer registered on the server
async fn producer_connection(harness: &SfuTestHarness) -> String {
    harness
        .server
        .next_event(|event| matches!(event, SfuEvent::ProducerAdded { .. }))
        .await
        .and_then(|event| event.connection_id().map(str::to_string))
        .unwrap()
}

#[tokio::test]
async fn test_producer_publishes_audio_only_when_present() {
    let harness = SfuTestHarness::new().await.unwrap();

    let mut with_audio = harness
        .start_producer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();
    assert_eq!(with_audio.state(), ProducerState::Active);
    let kinds: Vec<_> = with_audio.published().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);

    let mut video_only = harness
        .start_producer(Arc::new(SimulatedDevice::video_only()))
        .await
        .unwrap();
    assert_eq!(video_only.published().len(), 1);
    assert!(video_only.producer_id(MediaKind::Audio).is_none());

    assert_eq!(harness.server.router().producer_count(), 3);

    with_audio.stop().unwrap();
    video_only.stop().unwrap();
    harness.wait_for_disconnects().await.unwrap();
    assert_eq!(harness.server.router().producer_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_producer_stop_runs_in_reverse_order() {
    let harness = SfuTestHarness::new().await.unwrap();
    let device = Arc::new(SimulatedDevice::new());
    let log = device.log();

    let mut producer = harness.start_producer(device).await.unwrap();
    let video = producer.producer_id(MediaKind::Video).unwrap().to_string();
    let audio = producer.producer_id(MediaKind::Audio).unwrap().to_string();
    // One attach per published track
    assert_eq!(log.entries().len(), 2);

    producer.stop().unwrap();
    assert_eq!(producer.state(), ProducerState::Stopped);

    let teardown: Vec<String> = log.entries().into_iter().skip(2).collect();
    assert_eq!(teardown.len(), 5);
    assert_eq!(teardown[0], "stop track camera");
    assert_eq!(teardown[1], "stop track microphone");
    assert_eq!(teardown[2], format!("close producer {}", audio));
    assert_eq!(teardown[3], format!("close producer {}", video));
    assert!(teardown[4].starts_with("close send transport "));

    // Stopping twice is harmless
    producer.stop().unwrap();
    assert!(producer.signaling().is_err());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_consumer_subscribes_to_existing_peers() {
    let harness = SfuTestHarness::new().await.unwrap();
    let mut producer = harness
        .start_producer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();
    let producer_conn = producer_connection(&harness).await;

    let mut consumer = harness
        .start_consumer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();
    assert_eq!(consumer.state(), ConsumerState::Subscribed);
    assert_eq!(consumer.peers().len(), 1);

    let peer = consumer.peer(&producer_conn).unwrap();
    assert_eq!(peer.tracks.len(), 2);
    let video = peer.track(MediaKind::Video).unwrap();
    assert_eq!(
        Some(video.producer_id.as_str()),
        producer.producer_id(MediaKind::Video)
    );
    assert!(peer.track(MediaKind::Audio).is_some());
    assert_eq!(harness.server.router().consumer_count(), 2);

    consumer.stop().unwrap();
    producer.stop().unwrap();
    harness.wait_for_disconnects().await.unwrap();
    assert_eq!(harness.server.router().consumer_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_consumer_with_empty_room_is_subscribed() {
    let harness = SfuTestHarness::new().await.unwrap();

    let mut consumer = harness
        .start_consumer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();
    assert_eq!(consumer.state(), ConsumerState::Subscribed);
    assert!(consumer.peers().is_empty());

    consumer.stop().unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_incompatible_consumer_surfaces_capability_mismatch() {
    let harness = SfuTestHarness::new().await.unwrap();
    let mut producer = harness
        .start_producer(Arc::new(SimulatedDevice::video_only()))
        .await
        .unwrap();

    let mut consumer = relaycast_sfu::ConsumerSession::connect(
        harness.client_config(),
        Arc::new(SimulatedDevice::with_video_codec("video/H264")),
    )
    .await
    .unwrap();
    let err = consumer.start().await.unwrap_err();
    assert!(
        matches!(err, relaycast_sfu::Error::CapabilityMismatch(_)),
        "got {:?}",
        err
    );
    assert_eq!(consumer.state(), ConsumerState::InitialFanout);
    assert_eq!(harness.server.router().consumer_count(), 0);

    consumer.stop().unwrap();
    producer.stop().unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_producer_disconnect_notifies_each_consumer_once() {
    let harness = SfuTestHarness::new().await.unwrap();
    let mut producer = harness
        .start_producer(Arc::new(SimulatedDevice::video_only()))
        .await
        .unwrap();
    let producer_conn = producer_connection(&harness).await;

    let mut b = harness
        .start_consumer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();
    let mut c = harness
        .start_consumer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();

    let engine_consumers: Vec<_> = [&b, &c]
        .iter()
        .flat_map(|session| session.peers()[0].tracks.clone())
        .map(|track| harness.server.router().consumer(&track.consumer_id).unwrap())
        .collect();
    assert_eq!(engine_consumers.len(), 2);

    producer.stop().unwrap();

    for session in [&mut b, &mut c] {
        let update = within("producerClosed", session.next_update())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update, Some(ConsumerUpdate::PeerRemoved(producer_conn.clone())));
        assert!(session.peers().is_empty());
    }

    for consumer in &engine_consumers {
        assert!(consumer.is_closed());
    }
    assert_eq!(harness.server.router().consumer_count(), 0);

    // Nothing else arrives for either consumer
    for session in [&mut b, &mut c] {
        let extra = tokio::time::timeout(Duration::from_millis(200), session.next_update()).await;
        assert!(extra.is_err(), "unexpected extra update: {:?}", extra);
    }

    b.stop().unwrap();
    c.stop().unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_new_producer_fans_out_incrementally() {
    let harness = SfuTestHarness::new().await.unwrap();
    let mut a = harness
        .start_producer(Arc::new(SimulatedDevice::video_only()))
        .await
        .unwrap();
    let a_conn = producer_connection(&harness).await;

    let mut b = harness
        .start_consumer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();
    let a_consumer = b.peer(&a_conn).unwrap().tracks[0].consumer_id.clone();

    let mut d = harness
        .start_producer(Arc::new(SimulatedDevice::video_only()))
        .await
        .unwrap();
    let d_conn = producer_connection(&harness).await;

    let update = within("newProducer", b.next_update())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update, Some(ConsumerUpdate::PeersAdded(vec![d_conn.clone()])));

    assert_eq!(b.peers().len(), 2);
    assert_eq!(b.peers()[0].connection_id, a_conn);
    assert_eq!(b.peers()[1].connection_id, d_conn);
    // A's consumer was not re-created
    assert_eq!(b.peer(&a_conn).unwrap().tracks[0].consumer_id, a_consumer);
    assert_eq!(harness.server.router().consumer_count(), 2);
    assert!(harness.server.router().consumer(&a_consumer).is_some());

    d.stop().unwrap();
    let update = within("producerClosed", b.next_update())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update, Some(ConsumerUpdate::PeerRemoved(d_conn)));
    assert_eq!(b.peers().len(), 1);

    b.stop().unwrap();
    a.stop().unwrap();
    tokio::time::timeout(WAIT, harness.wait_for_disconnects())
        .await
        .unwrap()
        .unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_replacing_producer_notifies_and_relists() {
    let harness = SfuTestHarness::new().await.unwrap();
    let producer_client = harness.signaling_client().await.unwrap();
    let info = producer_client.create_producer_transport().await.unwrap();
    producer_client
        .connect_producer_transport(info.dtls_parameters)
        .await
        .unwrap();
    let rtp = serde_json::json!({"codecs": [{"mimeType": "video/VP8"}]});
    let first = producer_client
        .produce(MediaKind::Video, "1".into(), rtp.clone().into())
        .await
        .unwrap();
    let conn = producer_connection(&harness).await;

    let mut consumer = harness
        .start_consumer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();
    assert_eq!(consumer.peer(&conn).unwrap().tracks[0].producer_id, first);

    // Same room, connection and kind replaces the old producer
    let second = producer_client
        .produce(MediaKind::Video, "1".into(), rtp.into())
        .await
        .unwrap();
    assert_ne!(first, second);

    let mut saw_removed = false;
    let mut saw_added = false;
    while !(saw_removed && saw_added) {
        match within("replacement pushes", consumer.next_update())
            .await
            .unwrap()
            .unwrap()
        {
            Some(ConsumerUpdate::PeerRemoved(id)) => {
                assert_eq!(id, conn);
                saw_removed = true;
            }
            Some(ConsumerUpdate::PeersAdded(ids)) => {
                assert_eq!(ids, vec![conn.clone()]);
                saw_added = true;
            }
            Some(ConsumerUpdate::Unchanged) => {}
            None => panic!("signaling closed"),
        }
    }
    assert_eq!(consumer.peer(&conn).unwrap().tracks[0].producer_id, second);

    consumer.stop().unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_known_peer_late_track_is_merged() {
    let harness = SfuTestHarness::new().await.unwrap();
    let mut consumer = harness
        .start_consumer(Arc::new(SimulatedDevice::new()))
        .await
        .unwrap();

    let publisher = harness.signaling_client().await.unwrap();
    let info = publisher.create_producer_transport().await.unwrap();
    publisher
        .connect_producer_transport(info.dtls_parameters)
        .await
        .unwrap();
    let video = publisher
        .produce(
            MediaKind::Video,
            "1".into(),
            serde_json::json!({"codecs": [{"mimeType": "video/VP8"}]}).into(),
        )
        .await
        .unwrap();
    let conn = producer_connection(&harness).await;

    let update = within("newProducer", consumer.next_update())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update, Some(ConsumerUpdate::PeersAdded(vec![conn.clone()])));
    let video_consumer = consumer.peer(&conn).unwrap().tracks[0].consumer_id.clone();

    let audio = publisher
        .produce(
            MediaKind::Audio,
            "1".into(),
            serde_json::json!({"codecs": [{"mimeType": "audio/opus"}]}).into(),
        )
        .await
        .unwrap();

    let update = within("newProducer", consumer.next_update())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update, Some(ConsumerUpdate::PeersAdded(vec![conn.clone()])));

    assert_eq!(consumer.peers().len(), 1);
    let peer = consumer.peer(&conn).unwrap();
    let kinds: Vec<_> = peer.tracks.iter().map(|track| track.kind).collect();
    assert_eq!(kinds, vec![MediaKind::Video, MediaKind::Audio]);
    assert_eq!(peer.track(MediaKind::Video).unwrap().consumer_id, video_consumer);
    assert_eq!(peer.track(MediaKind::Video).unwrap().producer_id, video);
    assert_eq!(peer.track(MediaKind::Audio).unwrap().producer_id, audio);
    assert_eq!(harness.server.router().consumer_count(), 2);

    // A further hint changes nothing
    assert_eq!(
        consumer
            .handle_push(relaycast_sfu::client::ServerPush::NewProducer)
            .await
            .unwrap(),
        ConsumerUpdate::Unchanged
    );
    assert_eq!(harness.server.router().consumer_count(), 2);

    consumer.stop().unwrap();
    publisher.close().unwrap();
    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_fanout_keeps_consumed_tracks() {
    let harness = SfuTestHarness::new().await.unwrap();
    let publisher = harness.signaling_client().await.unwrap();
    let info = publisher.create_producer_transport().await.unwrap();
    publisher
        .connect_producer_transport(info.dtls_parameters)
        .await
        .unwrap();
    publisher
        .produce(
            MediaKind::Video,
            "1".into(),
            serde_json::json!({"codecs": [{"mimeType": "video/VP8"}]}).into(),
        )
        .await
        .unwrap();
    publisher
        .produce(
            MediaKind::Audio,
            "1".into(),
            serde_json::json!({"codecs": [{"mimeType": "audio/PCMU"}]}).into(),
        )
        .await
        .unwrap();
    let conn = producer_connection(&harness).await;

    let device = Arc::new(SimulatedDevice::new());
    let log = device.log();
    let mut consumer = relaycast_sfu::ConsumerSession::connect(harness.client_config(), device)
        .await
        .unwrap();
    let err = consumer.start().await.unwrap_err();
    assert!(
        matches!(err, relaycast_sfu::Error::CapabilityMismatch(_)),
        "got {:?}",
        err
    );

    // The video consumer already live on the server stays tracked locally
    let peer = consumer.peer(&conn).unwrap();
    assert_eq!(peer.tracks.len(), 1);
    assert_eq!(peer.tracks[0].kind, MediaKind::Video);
    let video_consumer = peer.tracks[0].consumer_id.clone();
    assert_eq!(harness.server.router().consumer_count(), 1);

    consumer.stop().unwrap();
    assert!(log
        .entries()
        .contains(&format!("close consumer {}", video_consumer)));

    publisher.close().unwrap();
    harness.wait_for_disconnects().await.unwrap();
    assert_eq!(harness.server.router().consumer_count(), 0);
    harness.shutdown().await;
}
