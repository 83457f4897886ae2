//! Per-connection session lifecycle.
//!
//! A session moves through three states: admission (credential and
//! membership checks), the active receive loop (validate, persist, fan
//! out), and teardown. Teardown always deregisters the connection; the
//! registry's idempotent unregister makes it safe against a concurrent
//! broadcast-triggered prune.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use palaver_core::{
    BroadcastPayload, ConnectionHandle, ConnectionId, ConnectionSink, DeliveryError,
    IdentityResolver, InboundMessage, RoomDirectory, RoomId, StoreError, UserId,
};
use palaver_protocol::{close, ErrorNotice, InboundFrame, ProtocolError};

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};

/// Why a connection was refused at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionReject {
    /// No credential was supplied.
    #[error("missing credential")]
    MissingCredential,

    /// The credential did not resolve to a user.
    #[error("unknown credential")]
    UnknownCredential,

    /// The room id is not well-formed.
    #[error("malformed room id")]
    MalformedRoomId,

    /// The room does not exist.
    #[error("unknown room")]
    UnknownRoom,

    /// The user is not a participant of the room.
    #[error("not a participant")]
    NotParticipant,
}

impl AdmissionReject {
    /// WebSocket close code reported to the peer.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Self::MissingCredential | Self::UnknownCredential | Self::MalformedRoomId => {
                close::POLICY_VIOLATION
            }
            Self::UnknownRoom | Self::NotParticipant => close::CANNOT_ACCEPT,
        }
    }
}

/// Identity and room established by a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// The room this connection is attached to for its entire lifetime.
    pub room: RoomId,
    /// The authenticated user; every relayed message carries this sender.
    pub user: UserId,
}

/// Check a connection attempt against the identity and membership
/// collaborators. Performs no registration; the caller registers only on
/// success.
pub async fn admit(
    room_id: &str,
    token: Option<&str>,
    identity: &dyn IdentityResolver,
    directory: &dyn RoomDirectory,
) -> Result<Admitted, AdmissionReject> {
    let token = token.ok_or(AdmissionReject::MissingCredential)?;
    let user = identity
        .resolve(token)
        .await
        .ok_or(AdmissionReject::UnknownCredential)?;
    let room = RoomId::parse(room_id).map_err(|_| AdmissionReject::MalformedRoomId)?;

    if !directory.room_exists(&room).await {
        return Err(AdmissionReject::UnknownRoom);
    }
    if !directory.is_participant(&room, &user).await {
        return Err(AdmissionReject::NotParticipant);
    }

    Ok(Admitted { room, user })
}

/// Fatal errors on the relay path. These close the connection but never
/// propagate past the session task.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A frame could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Outcome of processing one inbound frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Message persisted and fanned out to the room.
    Relayed {
        /// Number of successful deliveries, sender included.
        delivered: usize,
    },
    /// Frame ignored; the notice is sent back to the sender.
    Rejected(ErrorNotice),
}

/// Validate, persist, and fan out one inbound frame.
///
/// Undecodable frames and empty content are recoverable: the frame is
/// dropped and the sender notified. A malformed reply reference degrades to
/// no reply rather than failing the frame.
///
/// # Errors
///
/// Returns an error only for failures that are fatal to this connection,
/// such as a persistence error.
pub async fn handle_inbound(
    text: &str,
    admitted: &Admitted,
    state: &AppState,
) -> Result<FrameOutcome, SessionError> {
    let frame = match InboundFrame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(room = %admitted.room, error = %e, "Ignoring undecodable frame");
            return Ok(FrameOutcome::Rejected(ErrorNotice::new(
                "Malformed message",
            )));
        }
    };

    let Some(message) = InboundMessage::from_frame(&frame) else {
        warn!(room = %admitted.room, "Ignoring frame with empty content");
        return Ok(FrameOutcome::Rejected(ErrorNotice::new(
            "Content cannot be empty",
        )));
    };

    if frame.reply_to_message_id.is_some() && message.reply_to.is_none() {
        // Deliberate leniency: relay the message without the reference.
        warn!(room = %admitted.room, "Ignoring malformed reply_to_message_id");
    }

    let persisted = state
        .store
        .persist(message, admitted.room, admitted.user)
        .await?;
    debug!(
        room = %admitted.room,
        message = %persisted.id,
        "Message persisted"
    );

    let replied_to = match persisted.reply_to {
        Some(id) => state.store.resolve_reply(&id).await,
        None => None,
    };

    let payload = BroadcastPayload::new(persisted, replied_to);
    let delivered = state.broadcaster.broadcast(&admitted.room, &payload).await;

    Ok(FrameOutcome::Relayed { delivered })
}

/// Sink half of a session: broadcasts are queued here and drained into the
/// WebSocket by the session's own loop.
struct SessionSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl ConnectionSink for SessionSink {
    async fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        self.tx
            .send(frame.to_owned())
            .map_err(|_| DeliveryError::Closed)
    }
}

/// Drive one WebSocket connection from admission to teardown.
pub async fn run(socket: WebSocket, room_id: String, token: Option<String>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();

    // Admission: the handshake is already complete, so refusals close the
    // accepted socket with a specific code.
    let admitted = match admit(
        &room_id,
        token.as_deref(),
        &*state.identity,
        &*state.directory,
    )
    .await
    {
        Ok(admitted) => admitted,
        Err(reject) => {
            warn!(room = %room_id, reason = %reject, "Connection refused");
            metrics::record_error("admission");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: reject.close_code(),
                    reason: reject.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let connection_id = ConnectionId::generate();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    state.registry.register(
        admitted.room,
        ConnectionHandle::new(connection_id, Arc::new(SessionSink { tx })),
    );
    metrics::set_active_rooms(state.registry.room_count());

    info!(
        room = %admitted.room,
        user = %admitted.user,
        connection = %connection_id,
        "Session active"
    );

    loop {
        tokio::select! {
            biased;

            // Drain broadcasts queued for this connection.
            Some(frame) = outbound.recv() => {
                metrics::record_message(frame.len(), "outbound");
                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }

            // Receive from the peer.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !process_frame(&text, &admitted, &state, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // The protocol is JSON either way; non-UTF-8 data is
                        // just an undecodable frame.
                        match String::from_utf8(data) {
                            Ok(text) => {
                                if !process_frame(&text, &admitted, &state, &mut sender).await {
                                    break;
                                }
                            }
                            Err(_) => {
                                warn!(connection = %connection_id, "Ignoring non-UTF-8 frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Teardown: always deregister, even if a broadcast prune got here first.
    state.registry.unregister(&admitted.room, connection_id);
    metrics::set_active_rooms(state.registry.room_count());
    debug!(
        room = %admitted.room,
        connection = %connection_id,
        "Session closed"
    );
}

/// Process one inbound text frame. Returns `false` when the session must
/// close: either the relay path failed fatally or the peer is unreachable.
async fn process_frame(
    text: &str,
    admitted: &Admitted,
    state: &AppState,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    metrics::record_message(text.len(), "inbound");
    let start = Instant::now();

    match handle_inbound(text, admitted, state).await {
        Ok(FrameOutcome::Relayed { delivered }) => {
            metrics::record_deliveries(delivered);
            metrics::record_relay_latency(start.elapsed().as_secs_f64());
            true
        }
        Ok(FrameOutcome::Rejected(notice)) => match notice.encode() {
            Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
            Err(e) => {
                error!(room = %admitted.room, error = %e, "Failed to encode notice");
                true
            }
        },
        Err(e) => {
            // Fatal to this connection only; other rooms and connections
            // are unaffected.
            error!(room = %admitted.room, error = %e, "Relay failed, closing session");
            metrics::record_error("relay");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use palaver_core::{MemoryDirectory, MemoryStore, MessageId, MessageStore};
    use palaver_protocol::BroadcastFrame;
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionSink for RecordingSink {
        async fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
            self.frames.lock().unwrap().push(frame.to_owned());
            Ok(())
        }
    }

    struct Fixture {
        state: Arc<AppState>,
        directory: Arc<MemoryDirectory>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(AppState::new(
            Config::default(),
            directory.clone(),
            directory.clone(),
            store.clone(),
        ));
        Fixture {
            state,
            directory,
            store,
        }
    }

    fn admit_fixture(fix: &Fixture) -> Admitted {
        let room = RoomId::generate();
        let user = UserId::generate();
        fix.directory.insert_token("alice-token", user);
        fix.directory.add_participant(room, user);
        Admitted { room, user }
    }

    fn attach(fix: &Fixture, room: RoomId) -> Arc<RecordingSink> {
        let sink = RecordingSink::new();
        fix.state
            .registry
            .register(room, ConnectionHandle::new(ConnectionId::generate(), sink.clone()));
        sink
    }

    #[tokio::test]
    async fn test_admit_success() {
        let fix = fixture();
        let expected = admit_fixture(&fix);

        let admitted = admit(
            &expected.room.to_string(),
            Some("alice-token"),
            &*fix.state.identity,
            &*fix.state.directory,
        )
        .await
        .unwrap();

        assert_eq!(admitted, expected);
    }

    #[tokio::test]
    async fn test_admit_rejects_missing_and_unknown_credentials() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);
        let room = admitted.room.to_string();

        let reject = admit(&room, None, &*fix.state.identity, &*fix.state.directory)
            .await
            .unwrap_err();
        assert_eq!(reject, AdmissionReject::MissingCredential);
        assert_eq!(reject.close_code(), close::POLICY_VIOLATION);

        let reject = admit(
            &room,
            Some("wrong-token"),
            &*fix.state.identity,
            &*fix.state.directory,
        )
        .await
        .unwrap_err();
        assert_eq!(reject, AdmissionReject::UnknownCredential);
        assert_eq!(reject.close_code(), close::POLICY_VIOLATION);
    }

    #[tokio::test]
    async fn test_admit_rejects_malformed_room_id() {
        let fix = fixture();
        admit_fixture(&fix);

        let reject = admit(
            "lobby",
            Some("alice-token"),
            &*fix.state.identity,
            &*fix.state.directory,
        )
        .await
        .unwrap_err();
        assert_eq!(reject, AdmissionReject::MalformedRoomId);
        assert_eq!(reject.close_code(), close::POLICY_VIOLATION);
    }

    #[tokio::test]
    async fn test_admit_rejects_unknown_room_and_non_participant() {
        let fix = fixture();
        admit_fixture(&fix);

        let reject = admit(
            &RoomId::generate().to_string(),
            Some("alice-token"),
            &*fix.state.identity,
            &*fix.state.directory,
        )
        .await
        .unwrap_err();
        assert_eq!(reject, AdmissionReject::UnknownRoom);
        assert_eq!(reject.close_code(), close::CANNOT_ACCEPT);

        // A room that exists, but the user is not in it.
        let other_room = RoomId::generate();
        fix.directory.add_participant(other_room, UserId::generate());
        let reject = admit(
            &other_room.to_string(),
            Some("alice-token"),
            &*fix.state.identity,
            &*fix.state.directory,
        )
        .await
        .unwrap_err();
        assert_eq!(reject, AdmissionReject::NotParticipant);
        assert_eq!(reject.close_code(), close::CANNOT_ACCEPT);

        // Refusal happens before any registration.
        assert_eq!(fix.state.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected_without_persisting() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);
        let sink = attach(&fix, admitted.room);

        let outcome = handle_inbound(r#"{"content": ""}"#, &admitted, &fix.state)
            .await
            .unwrap();

        match outcome {
            FrameOutcome::Rejected(notice) => {
                assert_eq!(notice.error, "Content cannot be empty");
            }
            other => panic!("Expected rejection, got {:?}", other),
        }
        assert!(fix.store.is_empty());
        assert!(sink.received().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_rejected_without_persisting() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);

        let outcome = handle_inbound("not json at all", &admitted, &fix.state)
            .await
            .unwrap();

        assert!(matches!(outcome, FrameOutcome::Rejected(_)));
        assert!(fix.store.is_empty());
    }

    #[tokio::test]
    async fn test_valid_message_is_persisted_and_fanned_out() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);
        // The sender's own connection is part of the room and receives the
        // echo; a second member receives the same frame.
        let sender_sink = attach(&fix, admitted.room);
        let peer_sink = attach(&fix, admitted.room);

        let outcome = handle_inbound(r#"{"content": "hi"}"#, &admitted, &fix.state)
            .await
            .unwrap();

        match outcome {
            FrameOutcome::Relayed { delivered } => assert_eq!(delivered, 2),
            other => panic!("Expected relay, got {:?}", other),
        }

        assert_eq!(fix.store.len(), 1);
        let frame = BroadcastFrame::decode(&sender_sink.received()[0]).unwrap();
        assert_eq!(frame.content, "hi");
        assert_eq!(frame.chat_id, admitted.room.as_uuid());
        assert_eq!(frame.sender_id, admitted.user.as_uuid());
        assert_eq!(sender_sink.received(), peer_sink.received());
    }

    #[tokio::test]
    async fn test_sender_identity_comes_from_admission_not_the_frame() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);
        let sink = attach(&fix, admitted.room);

        // A spoofed sender_id in the frame is not part of the protocol and
        // must be ignored.
        let text = format!(
            r#"{{"content": "hi", "sender_id": "{}"}}"#,
            UserId::generate()
        );
        handle_inbound(&text, &admitted, &fix.state).await.unwrap();

        let frame = BroadcastFrame::decode(&sink.received()[0]).unwrap();
        assert_eq!(frame.sender_id, admitted.user.as_uuid());
    }

    #[tokio::test]
    async fn test_malformed_reply_reference_relays_without_reply() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);
        let sink = attach(&fix, admitted.room);

        let outcome = handle_inbound(
            r#"{"content": "hi", "reply_to_message_id": "not-a-uuid"}"#,
            &admitted,
            &fix.state,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, FrameOutcome::Relayed { .. }));
        let frame = BroadcastFrame::decode(&sink.received()[0]).unwrap();
        assert!(frame.replied_to_message.is_none());
    }

    #[tokio::test]
    async fn test_reply_to_known_message_carries_summary() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);

        let original = fix
            .store
            .persist(
                InboundMessage::new("the original"),
                admitted.room,
                admitted.user,
            )
            .await
            .unwrap();

        let sink = attach(&fix, admitted.room);
        let text = format!(
            r#"{{"content": "agreed", "reply_to_message_id": "{}"}}"#,
            original.id
        );
        handle_inbound(&text, &admitted, &fix.state).await.unwrap();

        let frame = BroadcastFrame::decode(&sink.received()[0]).unwrap();
        let reply = frame.replied_to_message.unwrap();
        assert_eq!(reply.id, original.id.as_uuid());
        assert_eq!(reply.content, "the original");
    }

    #[tokio::test]
    async fn test_reply_to_unknown_message_relays_without_summary() {
        let fix = fixture();
        let admitted = admit_fixture(&fix);
        let sink = attach(&fix, admitted.room);

        let text = format!(
            r#"{{"content": "hi", "reply_to_message_id": "{}"}}"#,
            MessageId::generate()
        );
        handle_inbound(&text, &admitted, &fix.state).await.unwrap();

        let frame = BroadcastFrame::decode(&sink.received()[0]).unwrap();
        assert!(frame.replied_to_message.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_senders_lose_no_writes() {
        let fix = fixture();
        let room = RoomId::generate();
        let alice = Admitted {
            room,
            user: UserId::generate(),
        };
        let bob = Admitted {
            room,
            user: UserId::generate(),
        };
        let alice_sink = attach(&fix, room);
        let bob_sink = attach(&fix, room);

        let state = fix.state.clone();
        let first = tokio::spawn(async move {
            handle_inbound(r#"{"content": "from alice"}"#, &alice, &state).await
        });
        let state = fix.state.clone();
        let second = tokio::spawn(async move {
            handle_inbound(r#"{"content": "from bob"}"#, &bob, &state).await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // No lost writes, and every member saw both fully-formed payloads.
        assert_eq!(fix.store.len(), 2);
        for sink in [&alice_sink, &bob_sink] {
            let mut contents: Vec<String> = sink
                .received()
                .iter()
                .map(|frame| BroadcastFrame::decode(frame).unwrap().content)
                .collect();
            contents.sort();
            assert_eq!(contents, vec!["from alice", "from bob"]);
        }
    }
}
