//! Broadcast routing
//!
//! Decides, for each incoming envelope, what derived envelope goes out
//! and which live sessions receive it, then delivers without holding the
//! registry lock across the fan-out.

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use log::{debug, info, warn};

use crate::core::envelope::{Envelope, Identity};
use crate::core::frame;
use crate::core::session::{lock_registry, Registry};
use crate::error::Result;
use crate::event_log::{log_connection_event, ConnectionEvent};
use crate::storage::BlobSink;

/// What the session loop should do after an envelope has been routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Disconnect,
}

/// Routes envelopes between live sessions
pub struct BroadcastRouter {
    registry: Registry,
    blob_sink: Arc<dyn BlobSink>,
    bind_address: String,
}

impl BroadcastRouter {
    pub fn new(registry: Registry, blob_sink: Arc<dyn BlobSink>, bind_address: String) -> Self {
        Self {
            registry,
            blob_sink,
            bind_address,
        }
    }

    /// Process one decoded envelope from `source_id`
    pub async fn route(&self, source_id: u64, envelope: Envelope) -> Result<Disposition> {
        match envelope {
            Envelope::Identity { username, avatar } => {
                self.handle_identity(source_id, username, avatar).await?;
                Ok(Disposition::Continue)
            }
            Envelope::ChatText {
                username,
                message,
                avatar,
                ..
            } => {
                self.handle_chat_text(source_id, username, message, avatar)
                    .await?;
                Ok(Disposition::Continue)
            }
            Envelope::ChatImage {
                username,
                filename,
                size,
                data,
                avatar,
                ..
            } => {
                self.handle_image(source_id, username, filename, size, data, avatar)
                    .await?;
                Ok(Disposition::Continue)
            }
            // A server-origin kind arriving from a peer is acknowledged
            // privately and never re-broadcast
            Envelope::System { .. } => {
                self.send_to_source(
                    source_id,
                    &Envelope::system("Structured message received: system"),
                )?;
                Ok(Disposition::Continue)
            }
            Envelope::PlainText { body } => self.handle_plain(source_id, body).await,
        }
    }

    /// Attach the identity, notify the other sessions, welcome the source
    async fn handle_identity(
        &self,
        source_id: u64,
        username: String,
        avatar: Option<String>,
    ) -> Result<()> {
        let identity = Identity {
            username: username.clone(),
            avatar,
        };
        let newly_attached = {
            let mut registry = lock_registry(&self.registry)?;
            registry.set_identity(source_id, identity)
        };
        let newly_attached = match newly_attached {
            Some(flag) => flag,
            // Session torn down while the envelope was in flight
            None => return Ok(()),
        };

        info!("Session CONN_{} announced as '{}'", source_id, username);
        log_connection_event(ConnectionEvent::IdentityAttached {
            session_id: source_id,
            username: username.clone(),
        })
        .await;

        if newly_attached {
            let notice = Envelope::system(format!("{} joined the chat", username));
            let delivered = self.broadcast(Some(source_id), &notice).await?;
            log_connection_event(ConnectionEvent::MessageRouted {
                session_id: source_id,
                kind: "system",
                delivered,
            })
            .await;
        }

        self.send_to_source(source_id, &Envelope::system(format!("Welcome, {}!", username)))
    }

    /// Broadcast a chat message to every live session, the source included;
    /// the sender's client renders its own message from this echo
    async fn handle_chat_text(
        &self,
        source_id: u64,
        username: String,
        message: String,
        avatar: Option<String>,
    ) -> Result<()> {
        let stamped = Envelope::ChatText {
            username,
            message,
            avatar,
            timestamp: Some(Utc::now()),
        };
        let delivered = self.broadcast(None, &stamped).await?;
        log_connection_event(ConnectionEvent::MessageRouted {
            session_id: source_id,
            kind: "text",
            delivered,
        })
        .await;
        Ok(())
    }

    /// Persist the image through the blob sink, then broadcast. Persistence
    /// problems are reported to the source but never block the broadcast:
    /// the bytes are already in hand.
    async fn handle_image(
        &self,
        source_id: u64,
        username: String,
        filename: String,
        size: u64,
        data: String,
        avatar: Option<String>,
    ) -> Result<()> {
        match base64::engine::general_purpose::STANDARD.decode(data.as_bytes()) {
            Ok(bytes) => match self.blob_sink.store(&filename, &bytes).await {
                Ok(stored) => {
                    log_connection_event(ConnectionEvent::ImageStored {
                        session_id: source_id,
                        location: stored.location.clone(),
                        size: stored.size,
                    })
                    .await;
                    self.send_to_source(
                        source_id,
                        &Envelope::system(format!("Image '{}' received and stored", filename)),
                    )?;
                }
                Err(e) => {
                    warn!(
                        "CONN_{}: failed to persist image '{}': {}",
                        source_id, filename, e
                    );
                    log_connection_event(ConnectionEvent::PersistenceFailed {
                        session_id: source_id,
                        reason: e.to_string(),
                    })
                    .await;
                    self.send_to_source(
                        source_id,
                        &Envelope::system(format!("Image '{}' could not be stored: {}", filename, e)),
                    )?;
                }
            },
            Err(e) => {
                warn!(
                    "CONN_{}: image '{}' payload is not valid base64: {}",
                    source_id, filename, e
                );
                log_connection_event(ConnectionEvent::PersistenceFailed {
                    session_id: source_id,
                    reason: format!("invalid base64 payload: {}", e),
                })
                .await;
                self.send_to_source(
                    source_id,
                    &Envelope::system(format!("Image '{}' payload is not valid base64", filename)),
                )?;
            }
        }

        let stamped = Envelope::ChatImage {
            username,
            filename,
            size,
            data,
            avatar,
            timestamp: Some(Utc::now()),
        };
        let delivered = self.broadcast(None, &stamped).await?;
        log_connection_event(ConnectionEvent::MessageRouted {
            session_id: source_id,
            kind: "image",
            delivered,
        })
        .await;
        Ok(())
    }

    /// Plain text splits on whether the source has announced itself: an
    /// identified source is promoted to a chat broadcast, an anonymous one
    /// gets the private command dialogue
    async fn handle_plain(&self, source_id: u64, body: String) -> Result<Disposition> {
        let identity = lock_registry(&self.registry)?.identity_of(source_id);
        match identity {
            Some(identity) => {
                self.handle_chat_text(source_id, identity.username, body, identity.avatar)
                    .await?;
                Ok(Disposition::Continue)
            }
            None => self.command_dialogue(source_id, &body).await,
        }
    }

    /// Fixed command set, recognized case-insensitively, answered privately
    async fn command_dialogue(&self, source_id: u64, body: &str) -> Result<Disposition> {
        let reply = match body.trim().to_lowercase().as_str() {
            "quit" => {
                self.send_to_source(source_id, &Envelope::system("Goodbye!"))?;
                return Ok(Disposition::Disconnect);
            }
            "time" => format!("Server time: {}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
            "info" => {
                let count = lock_registry(&self.registry)?.client_count();
                format!(
                    "Server info - address: {}, online clients: {}",
                    self.bind_address, count
                )
            }
            "hello" => "Hello! Nice to meet you!".to_string(),
            _ => format!("Server reply: {}", body),
        };
        self.send_to_source(source_id, &Envelope::system(reply))?;
        Ok(Disposition::Continue)
    }

    /// Deliver one envelope to every live session except `exclude`.
    ///
    /// A target whose writer is gone is dropped from the registry without
    /// aborting delivery to the remaining targets.
    async fn broadcast(&self, exclude: Option<u64>, envelope: &Envelope) -> Result<usize> {
        let frame_bytes = frame::encode(&envelope.serialize()?)?;
        let targets = lock_registry(&self.registry)?.snapshot();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for target in targets {
            if exclude == Some(target.id) {
                continue;
            }
            if target.send_frame(frame_bytes.clone()) {
                delivered += 1;
            } else {
                dead.push(target.id);
            }
        }

        for target_id in dead {
            log_connection_event(ConnectionEvent::DeliveryFailed { target_id }).await;
            self.disconnect(target_id).await?;
        }
        Ok(delivered)
    }

    /// Remove a session from the registry and, when it had announced an
    /// identity, tell the remaining sessions it left.
    ///
    /// Safe to call from every teardown path; only the caller that wins
    /// the removal emits the notice.
    pub async fn disconnect(&self, session_id: u64) -> Result<()> {
        let (removed, active) = {
            let mut registry = lock_registry(&self.registry)?;
            let removed = registry.remove(session_id);
            (removed, registry.client_count())
        };
        let connection = match removed {
            Some(connection) => connection,
            None => return Ok(()),
        };

        info!(
            "Client disconnected: CONN_{} ({})",
            session_id, connection.addr
        );
        log_connection_event(ConnectionEvent::ClientDisconnected {
            session_id,
            active_connections: active,
        })
        .await;

        if let Some(identity) = connection.identity {
            let notice = Envelope::system(format!("{} left the chat", identity.username));
            self.notify_all(&notice)?;
        }
        Ok(())
    }

    /// Best-effort fan-out for teardown notices; failed targets are left
    /// for the next broadcast pass to reap, so teardown never recurses
    fn notify_all(&self, envelope: &Envelope) -> Result<usize> {
        let frame_bytes = frame::encode(&envelope.serialize()?)?;
        let targets = lock_registry(&self.registry)?.snapshot();
        let mut delivered = 0;
        for target in targets {
            if target.send_frame(frame_bytes.clone()) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Private reply to one session
    fn send_to_source(&self, session_id: u64, envelope: &Envelope) -> Result<()> {
        let frame_bytes = frame::encode(&envelope.serialize()?)?;
        let registry = lock_registry(&self.registry)?;
        match registry.get(session_id) {
            Some(connection) => {
                connection.send_frame(frame_bytes);
            }
            None => debug!(
                "Session CONN_{} vanished before reply delivery",
                session_id
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::Connection;
    use crate::core::session::create_registry;
    use crate::storage::MemoryBlobSink;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn test_router() -> (BroadcastRouter, Registry, Arc<MemoryBlobSink>) {
        let registry = create_registry();
        let sink = Arc::new(MemoryBlobSink::new());
        let router = BroadcastRouter::new(
            registry.clone(),
            sink.clone(),
            "127.0.0.1:8887".to_string(),
        );
        (router, registry, sink)
    }

    fn join_session(registry: &Registry, id: u64) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        lock_registry(registry).unwrap().add(Connection::new(id, addr, tx));
        rx
    }

    fn recv_envelope(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Envelope {
        let frame_bytes = rx.try_recv().expect("expected a queued frame");
        // Strip the 4-byte length prefix before parsing
        Envelope::parse(&frame_bytes[4..])
    }

    fn assert_no_frame(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) {
        assert!(rx.try_recv().is_err(), "expected no queued frame");
    }

    #[tokio::test]
    async fn test_identity_notifies_others_and_welcomes_source() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);
        let mut b = join_session(&registry, 2);

        let disposition = router
            .route(
                1,
                Envelope::Identity {
                    username: "Alice".to_string(),
                    avatar: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Continue);

        match recv_envelope(&mut b) {
            Envelope::System { message, .. } => {
                assert!(message.contains("Alice") && message.contains("joined"))
            }
            other => panic!("expected join notice, got {:?}", other),
        }
        assert_no_frame(&mut b);

        match recv_envelope(&mut a) {
            Envelope::System { message, .. } => assert!(message.contains("Welcome, Alice")),
            other => panic!("expected private welcome, got {:?}", other),
        }
        assert_no_frame(&mut a);
    }

    #[tokio::test]
    async fn test_repeat_identity_updates_without_second_join_notice() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);
        let mut b = join_session(&registry, 2);

        let alice = |name: &str| Envelope::Identity {
            username: name.to_string(),
            avatar: None,
        };
        router.route(1, alice("Alice")).await.unwrap();
        recv_envelope(&mut a); // welcome
        recv_envelope(&mut b); // join notice

        router.route(1, alice("Alicia")).await.unwrap();
        match recv_envelope(&mut a) {
            Envelope::System { message, .. } => assert!(message.contains("Alicia")),
            other => panic!("expected welcome, got {:?}", other),
        }
        assert_no_frame(&mut b);
        assert_eq!(
            lock_registry(&registry).unwrap().identity_of(1).unwrap().username,
            "Alicia"
        );
    }

    #[tokio::test]
    async fn test_chat_text_echoes_to_source_and_gets_timestamp() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);
        let mut b = join_session(&registry, 2);

        router
            .route(
                1,
                Envelope::ChatText {
                    username: "Bob".to_string(),
                    message: "hi".to_string(),
                    avatar: None,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        for rx in [&mut a, &mut b] {
            match recv_envelope(rx) {
                Envelope::ChatText {
                    username,
                    message,
                    timestamp,
                    ..
                } => {
                    assert_eq!(username, "Bob");
                    assert_eq!(message, "hi");
                    assert!(timestamp.is_some(), "broadcast must carry a server timestamp");
                }
                other => panic!("expected chat text, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_anonymous_plain_text_is_private_echo() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);
        let mut b = join_session(&registry, 2);

        router
            .route(
                1,
                Envelope::PlainText {
                    body: "PING_TEST".to_string(),
                },
            )
            .await
            .unwrap();

        match recv_envelope(&mut a) {
            Envelope::System { message, .. } => assert!(message.contains("PING_TEST")),
            other => panic!("expected echo reply, got {:?}", other),
        }
        assert_no_frame(&mut b);
    }

    #[tokio::test]
    async fn test_identified_plain_text_is_promoted_to_broadcast() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);
        let mut b = join_session(&registry, 2);

        router
            .route(
                1,
                Envelope::Identity {
                    username: "Carol".to_string(),
                    avatar: Some("YQ==".to_string()),
                },
            )
            .await
            .unwrap();
        recv_envelope(&mut a); // welcome
        recv_envelope(&mut b); // join notice

        router
            .route(
                1,
                Envelope::PlainText {
                    body: "hello everyone".to_string(),
                },
            )
            .await
            .unwrap();

        for rx in [&mut a, &mut b] {
            match recv_envelope(rx) {
                Envelope::ChatText {
                    username,
                    message,
                    avatar,
                    ..
                } => {
                    assert_eq!(username, "Carol");
                    assert_eq!(message, "hello everyone");
                    assert_eq!(avatar.as_deref(), Some("YQ=="));
                }
                other => panic!("expected promoted chat text, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_quit_command_requests_disconnect() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);

        let disposition = router
            .route(
                1,
                Envelope::PlainText {
                    body: "QUIT".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Disconnect);

        match recv_envelope(&mut a) {
            Envelope::System { message, .. } => assert!(message.contains("Goodbye")),
            other => panic!("expected farewell, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_info_command_reports_session_count() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);
        let _b = join_session(&registry, 2);

        router
            .route(
                1,
                Envelope::PlainText {
                    body: "info".to_string(),
                },
            )
            .await
            .unwrap();

        match recv_envelope(&mut a) {
            Envelope::System { message, .. } => {
                assert!(message.contains("127.0.0.1:8887"));
                assert!(message.contains("online clients: 2"));
            }
            other => panic!("expected info reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_image_is_stored_and_broadcast() {
        let (router, registry, sink) = test_router();
        let mut a = join_session(&registry, 1);
        let mut b = join_session(&registry, 2);

        let data = base64::engine::general_purpose::STANDARD.encode(b"fakepng");
        router
            .route(
                1,
                Envelope::ChatImage {
                    username: "Dana".to_string(),
                    filename: "cat.png".to_string(),
                    size: 7,
                    data: data.clone(),
                    avatar: None,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(sink.len().await, 1);

        // The source gets the storage acknowledgement first, then the echo
        match recv_envelope(&mut a) {
            Envelope::System { message, .. } => assert!(message.contains("cat.png")),
            other => panic!("expected storage ack, got {:?}", other),
        }
        match recv_envelope(&mut a) {
            Envelope::ChatImage {
                data: echoed,
                timestamp,
                ..
            } => {
                assert_eq!(echoed, data);
                assert!(timestamp.is_some());
            }
            other => panic!("expected image echo, got {:?}", other),
        }
        match recv_envelope(&mut b) {
            Envelope::ChatImage { filename, .. } => assert_eq!(filename, "cat.png"),
            other => panic!("expected image broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_base64_image_still_broadcasts() {
        let (router, registry, sink) = test_router();
        let mut a = join_session(&registry, 1);
        let mut b = join_session(&registry, 2);

        router
            .route(
                1,
                Envelope::ChatImage {
                    username: "Eve".to_string(),
                    filename: "bad.png".to_string(),
                    size: 3,
                    data: "!!!not-base64!!!".to_string(),
                    avatar: None,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(sink.len().await, 0);
        match recv_envelope(&mut a) {
            Envelope::System { message, .. } => assert!(message.contains("bad.png")),
            other => panic!("expected error report, got {:?}", other),
        }
        assert!(matches!(recv_envelope(&mut a), Envelope::ChatImage { .. }));
        assert!(matches!(recv_envelope(&mut b), Envelope::ChatImage { .. }));
    }

    #[tokio::test]
    async fn test_dead_target_is_removed_and_broadcast_continues() {
        let (router, registry, _sink) = test_router();
        let mut a = join_session(&registry, 1);
        let b = join_session(&registry, 2);
        let mut c = join_session(&registry, 3);

        // Session 2's writer is gone; its channel sends now fail
        drop(b);

        router
            .route(
                1,
                Envelope::ChatText {
                    username: "Finn".to_string(),
                    message: "still here".to_string(),
                    avatar: None,
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        assert!(matches!(recv_envelope(&mut a), Envelope::ChatText { .. }));
        assert!(matches!(recv_envelope(&mut c), Envelope::ChatText { .. }));

        let registry = lock_registry(&registry).unwrap();
        assert_eq!(registry.client_count(), 2);
        assert!(registry.get(2).is_none());
    }
}
