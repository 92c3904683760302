//! End-to-end meeting flow against a scripted relay and the in-process media
//! engine: joins, offer/answer/ICE routing, screen-share swaps and teardown.

use std::sync::Arc;
use std::time::Duration;

use meetlink_core::media::{
    LocalTrack, MeetingDelegate, NullEngine, Participant, PeerManager, RemoteStream, TrackKind,
};
use meetlink_core::signal::{
    IceCandidate, MemoryConnector, ServerEnd, SessionDescription, SessionState, SignalMessage,
};
use meetlink_core::{ClientConfig, Identity};
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingDelegate {
    log: parking_lot::Mutex<Vec<String>>,
}

impl RecordingDelegate {
    fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl MeetingDelegate for RecordingDelegate {
    fn participant_joined(&self, participant: &Participant) {
        self.log.lock().push(format!("joined:{}", participant.id));
    }
    fn participant_left(&self, participant_id: &str) {
        self.log.lock().push(format!("left:{participant_id}"));
    }
    fn stream_received(&self, participant_id: &str, stream: &RemoteStream) {
        self.log
            .lock()
            .push(format!("stream:{participant_id}:{}", stream.id));
    }
    fn presence_changed(&self, participant: &Participant) {
        self.log.lock().push(format!(
            "presence:{}:{}:{}",
            participant.id, participant.muted, participant.video_off
        ));
    }
    fn connection_state_changed(&self, _state: SessionState, _attempt: u32) {}
}

struct Meeting {
    manager: PeerManager,
    engine: Arc<NullEngine>,
    delegate: Arc<RecordingDelegate>,
    server: ServerEnd,
    /// Kept alive so reconnect dials would be accepted, not refused.
    _accept_rx: mpsc::UnboundedReceiver<ServerEnd>,
}

async fn join() -> Meeting {
    let (connector, mut accept_rx) = MemoryConnector::pair();
    let engine = Arc::new(NullEngine::new());
    let delegate = Arc::new(RecordingDelegate::default());
    let config = ClientConfig {
        reconnect_base_ms: 50,
        reconnect_cap_ms: 200,
        max_reconnect_attempts: 3,
        ..ClientConfig::default()
    };

    let manager_fut = PeerManager::join(
        &config,
        "standup",
        Identity {
            user_id: "self".to_string(),
            display_name: "Me".to_string(),
        },
        vec![LocalTrack::audio("mic"), LocalTrack::video("cam")],
        engine.clone(),
        Arc::new(connector),
        delegate.clone(),
    );
    let (manager, server) = tokio::join!(manager_fut, async {
        let mut server = accept_rx.recv().await.expect("no dial");
        let first = server.recv().await.expect("no handshake");
        assert!(matches!(first, SignalMessage::Join { .. }));
        server
    });

    Meeting {
        manager: manager.expect("join failed"),
        engine,
        delegate,
        server,
        _accept_rx: accept_rx,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn candidate(tag: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{tag}"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_meeting_lifecycle() {
    let mut meeting = join().await;

    // Two participants arrive; the manager offers to each.
    meeting.server.send(SignalMessage::Joined {
        participant_id: "ada".to_string(),
        display_name: "Ada".to_string(),
    });
    meeting.server.send(SignalMessage::Joined {
        participant_id: "grace".to_string(),
        display_name: "Grace".to_string(),
    });
    settle().await;

    let outbound = meeting.server.drain();
    let offered_to: Vec<_> = outbound
        .iter()
        .filter_map(|m| match m {
            SignalMessage::Offer { participant_id, .. } => Some(participant_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(offered_to.len(), 2);
    assert!(offered_to.contains(&"ada".to_string()));
    assert!(offered_to.contains(&"grace".to_string()));
    assert_eq!(meeting.manager.participants().len(), 2);

    // Ada answers; her candidate applies to her connection only.
    meeting.server.send(SignalMessage::Answer {
        participant_id: "ada".to_string(),
        sdp: SessionDescription::answer("v=0 ada".to_string()),
    });
    meeting.server.send(SignalMessage::IceCandidate {
        participant_id: "ada".to_string(),
        candidate: candidate("ada-1"),
    });
    // A candidate for a participant who already left is dropped quietly.
    meeting.server.send(SignalMessage::IceCandidate {
        participant_id: "gone".to_string(),
        candidate: candidate("stale"),
    });
    settle().await;

    let ada = meeting.engine.endpoint("ada").unwrap();
    assert_eq!(ada.answers_accepted().len(), 1);
    assert_eq!(ada.remote_candidates().len(), 1);
    assert!(meeting.engine.endpoint("gone").is_none());

    // Ada's media lands and is surfaced on her participant record.
    ada.emit_remote_stream(RemoteStream {
        id: "ada-stream".to_string(),
        tracks: vec![],
    });
    settle().await;
    assert!(meeting
        .delegate
        .entries()
        .contains(&"stream:ada:ada-stream".to_string()));

    // Grace leaves; only her connection is torn down.
    meeting.server.send(SignalMessage::Left {
        participant_id: "grace".to_string(),
    });
    settle().await;
    assert!(meeting.engine.endpoint("grace").unwrap().is_closed());
    assert!(!meeting.engine.endpoint("ada").unwrap().is_closed());
    assert_eq!(meeting.manager.participants().len(), 1);
    assert!(meeting.delegate.entries().contains(&"left:grace".to_string()));

    meeting.manager.leave().await;
    assert!(meeting.engine.endpoint("ada").unwrap().is_closed());
    assert!(meeting.manager.participants().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_local_candidates_are_relayed_through_signaling() {
    let mut meeting = join().await;

    meeting.server.send(SignalMessage::Joined {
        participant_id: "ada".to_string(),
        display_name: "Ada".to_string(),
    });
    settle().await;
    let _ = meeting.server.drain();

    meeting
        .engine
        .endpoint("ada")
        .unwrap()
        .emit_candidate(candidate("local-1"));
    settle().await;

    let relayed: Vec<_> = meeting
        .server
        .drain()
        .into_iter()
        .filter_map(|m| match m {
            SignalMessage::IceCandidate {
                participant_id,
                candidate,
            } => Some((participant_id, candidate.candidate)),
            _ => None,
        })
        .collect();
    assert_eq!(
        relayed,
        vec![("ada".to_string(), "candidate:local-1".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_screen_share_swap_is_per_kind() {
    let meeting = join().await;

    meeting.server.send(SignalMessage::Joined {
        participant_id: "ada".to_string(),
        display_name: "Ada".to_string(),
    });
    meeting.server.send(SignalMessage::Joined {
        participant_id: "grace".to_string(),
        display_name: "Grace".to_string(),
    });
    settle().await;

    let ada = meeting.engine.endpoint("ada").unwrap();
    let audio_before = ada.attached(TrackKind::Audio).unwrap();

    // Camera → screen, then screen → camera again; audio never moves.
    meeting
        .manager
        .replace_local_tracks(vec![LocalTrack::video("screen:1")])
        .await
        .unwrap();
    meeting
        .manager
        .replace_local_tracks(vec![LocalTrack::video("cam")])
        .await
        .unwrap();

    for id in ["ada", "grace"] {
        let endpoint = meeting.engine.endpoint(id).unwrap();
        assert_eq!(endpoint.attached(TrackKind::Audio).unwrap(), audio_before.clone());
        assert_eq!(endpoint.attached(TrackKind::Video).unwrap().label, "cam");
        let swapped: Vec<_> = endpoint
            .replacements()
            .into_iter()
            .map(|t| t.label)
            .collect();
        assert_eq!(swapped, vec!["screen:1".to_string(), "cam".to_string()]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_remote_presence_updates_roster() {
    let mut meeting = join().await;

    meeting.server.send(SignalMessage::Joined {
        participant_id: "ada".to_string(),
        display_name: "Ada".to_string(),
    });
    settle().await;

    meeting.server.send(SignalMessage::Presence {
        participant_id: "ada".to_string(),
        muted: true,
        video_off: false,
    });
    settle().await;

    let roster = meeting.manager.participants();
    assert!(roster[0].muted);
    assert!(!roster[0].video_off);
    assert!(meeting
        .delegate
        .entries()
        .contains(&"presence:ada:true:false".to_string()));
    let _ = meeting.server.drain();
}
