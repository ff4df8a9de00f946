//! Dialing, answering and declining calls.
//!
//! The manager owns at most one active session and connects it to the
//! inbox: dialing rings the callee, declining cancels on the caller's inbox,
//! and a cancellation from the other party withdraws a call that never
//! connected.

use std::sync::Arc;

use super::inbox::InboxNotifier;
use super::session::{self, SessionDeps, SessionHandle};
use super::{CallError, SessionState};
use crate::api::{display_name_or_fallback, ProfileLookup};
use crate::models::{
    CallCancelledPayload, CallIntent, CallKind, IncomingCallPayload, InboxEvent, UserId,
};

pub struct CallManager {
    own_id: UserId,
    deps: SessionDeps,
    profiles: Arc<dyn ProfileLookup>,
    active: Option<SessionHandle>,
}

impl CallManager {
    pub fn new(own_id: UserId, deps: SessionDeps, profiles: Arc<dyn ProfileLookup>) -> Self {
        Self {
            own_id,
            deps,
            profiles,
            active: None,
        }
    }

    pub fn own_id(&self) -> &UserId {
        &self.own_id
    }

    pub fn inbox(&self) -> &InboxNotifier {
        &self.deps.inbox
    }

    /// The current session, if one is still running.
    pub fn active(&self) -> Option<&SessionHandle> {
        self.active.as_ref().filter(|s| !s.is_finished())
    }

    /// Hand the current session over to the caller.
    pub fn take_active(&mut self) -> Option<SessionHandle> {
        self.active.take()
    }

    fn ensure_idle(&mut self) -> Result<(), CallError> {
        if self.active().is_some() {
            return Err(CallError::CallInProgress);
        }
        self.active = None;
        Ok(())
    }

    /// Ring `peer` and start the caller side of the call.
    pub async fn dial(&mut self, peer: UserId, kind: CallKind) -> Result<&SessionHandle, CallError> {
        self.ensure_idle()?;

        let caller_name = display_name_or_fallback(self.profiles.as_ref(), &self.own_id).await;
        let notice = IncomingCallPayload {
            caller_id: self.own_id.clone(),
            caller_name,
            kind,
        };
        self.deps.inbox.notify_incoming(&peer, &notice).await;

        let peer_name = display_name_or_fallback(self.profiles.as_ref(), &peer).await;
        let intent = CallIntent::dial(peer, kind);
        let handle = session::spawn(self.own_id.clone(), intent, peer_name, self.deps.clone());
        Ok(self.active.insert(handle))
    }

    /// Answer a ringing call.
    pub fn accept_incoming(&mut self, call: &IncomingCallPayload) -> Result<&SessionHandle, CallError> {
        self.ensure_idle()?;
        tracing::info!("Accepting {} call from {}", call.kind, call.caller_name);
        let intent = CallIntent::answer(call.caller_id.clone(), call.kind);
        let handle = session::spawn(
            self.own_id.clone(),
            intent,
            call.caller_name.clone(),
            self.deps.clone(),
        );
        Ok(self.active.insert(handle))
    }

    /// Turn down a ringing call; the caller gets a cancellation notice.
    pub async fn decline_incoming(&self, call: &IncomingCallPayload) {
        tracing::info!("Declining {} call from {}", call.kind, call.caller_name);
        let notice = CallCancelledPayload {
            caller_id: self.own_id.clone(),
            kind: call.kind,
        };
        self.deps
            .inbox
            .notify_cancelled(&call.caller_id, &notice)
            .await;
    }

    /// React to an inbox event. A cancellation from the party of an
    /// unconnected active call withdraws that call.
    pub fn handle_inbox_event(&self, event: &InboxEvent) {
        let InboxEvent::CallCancelled(notice) = event else {
            return;
        };
        let Some(session) = self.active() else {
            return;
        };
        if session.intent().peer_id != notice.caller_id {
            return;
        }
        match session.snapshot().state {
            SessionState::Initializing | SessionState::Ringing | SessionState::Connecting => {
                tracing::info!("{} withdrew the call", notice.caller_id);
                session.abort();
            }
            state => tracing::debug!("Ignoring cancellation while {:?}", state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{InMemoryMessageLog, StaticProfiles};
    use crate::bus::MemoryBus;
    use crate::calling::testing::{FakeCapture, FakeConnector};
    use crate::config::CallSettings;
    use std::collections::HashMap;
    use std::time::Duration;

    struct World {
        bus: MemoryBus,
        log: InMemoryMessageLog,
        connector: FakeConnector,
    }

    impl World {
        fn new(connector: FakeConnector) -> Self {
            Self {
                bus: MemoryBus::new(),
                log: InMemoryMessageLog::new(),
                connector,
            }
        }

        fn inbox(&self) -> InboxNotifier {
            InboxNotifier::new(Arc::new(self.bus.clone()), Arc::new(self.log.clone()))
        }

        fn manager(&self, id: &str) -> CallManager {
            let deps = SessionDeps {
                bus: Arc::new(self.bus.clone()),
                media: Arc::new(FakeCapture::default()),
                peers: Arc::new(self.connector.clone()),
                inbox: self.inbox(),
                settings: CallSettings {
                    quality_poll_ms: 20,
                    ..Default::default()
                },
            };
            let names = HashMap::from([("alice".to_string(), "Alice".to_string())]);
            CallManager::new(UserId::from(id), deps, Arc::new(StaticProfiles::new(names)))
        }
    }

    #[tokio::test]
    async fn test_dial_rings_and_connects() {
        let world = World::new(FakeConnector::loopback());
        let mut bob_inbox = world.inbox().subscribe(&UserId::from("bob")).await.unwrap();
        let mut alice = world.manager("alice");
        let mut bob = world.manager("bob");

        alice.dial(UserId::from("bob"), CallKind::Video).await.unwrap();
        let ringing = match bob_inbox.next().await {
            Some(InboxEvent::IncomingCall(p)) => p,
            other => panic!("expected incoming call, got {:?}", other),
        };
        assert_eq!(ringing.caller_id, UserId::from("alice"));
        assert_eq!(ringing.caller_name, "Alice");
        assert_eq!(ringing.kind, CallKind::Video);

        let answered = bob.accept_incoming(&ringing).unwrap();
        let snap = answered.wait_for_state(SessionState::Connected).await;
        assert_eq!(snap.peer_name, "Alice");
        let dialed = alice.active().unwrap();
        let snap = dialed.wait_for_state(SessionState::Connected).await;
        assert!(snap.remote_stream.is_some());
        // Bob has no profile.
        assert_eq!(snap.peer_name, "User");

        assert!(matches!(
            alice.dial(UserId::from("carol"), CallKind::Voice).await,
            Err(CallError::CallInProgress)
        ));

        alice.take_active().unwrap().hang_up();
        let last = bob.take_active().unwrap().join().await;
        assert_eq!(last.state, SessionState::Terminated);
        assert!(world.log.rows().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_peer_shows_fallback_name() {
        let world = World::new(FakeConnector::scripted());
        let mut alice = world.manager("alice");
        let dialed = alice.dial(UserId::from("carol"), CallKind::Voice).await.unwrap();
        assert_eq!(dialed.snapshot().peer_name, "User");
        alice.take_active().unwrap().hang_up();
    }

    #[tokio::test]
    async fn test_unknown_caller_rings_with_fallback_name() {
        let world = World::new(FakeConnector::scripted());
        let mut alice_inbox = world.inbox().subscribe(&UserId::from("alice")).await.unwrap();
        let mut bob = world.manager("bob");

        let dialed = bob.dial(UserId::from("alice"), CallKind::Voice).await.unwrap();
        assert_eq!(dialed.snapshot().peer_name, "Alice");
        match alice_inbox.next().await {
            Some(InboxEvent::IncomingCall(p)) => assert_eq!(p.caller_name, "User"),
            other => panic!("expected incoming call, got {:?}", other),
        }
        bob.take_active().unwrap().hang_up();
    }

    #[tokio::test]
    async fn test_decline_withdraws_caller_and_logs_missed_call() {
        let world = World::new(FakeConnector::scripted());
        let mut alice_inbox = world.inbox().subscribe(&UserId::from("alice")).await.unwrap();
        let mut bob_inbox = world.inbox().subscribe(&UserId::from("bob")).await.unwrap();
        let mut alice = world.manager("alice");
        let bob = world.manager("bob");

        alice.dial(UserId::from("bob"), CallKind::Video).await.unwrap();
        alice
            .active()
            .unwrap()
            .wait_for_state(SessionState::Ringing)
            .await;

        let Some(InboxEvent::IncomingCall(ringing)) = bob_inbox.next().await else {
            panic!("bob was not rung");
        };
        bob.decline_incoming(&ringing).await;

        let event = alice_inbox.next().await.unwrap();
        assert_eq!(
            event,
            InboxEvent::CallCancelled(CallCancelledPayload {
                caller_id: UserId::from("bob"),
                kind: CallKind::Video,
            })
        );
        alice.handle_inbox_event(&event);

        let last = tokio::time::timeout(Duration::from_secs(2), alice.take_active().unwrap().join())
            .await
            .unwrap();
        assert_eq!(last.state, SessionState::Terminated);

        let rows = world.log.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "Missed video call");
        assert_eq!(rows[0].receiver_id, UserId::from("alice"));
        // A withdrawn call does not cancel back.
        let echo = tokio::time::timeout(Duration::from_millis(100), bob_inbox.next()).await;
        assert!(echo.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_from_someone_else_is_ignored() {
        let world = World::new(FakeConnector::scripted());
        let mut alice = world.manager("alice");
        alice.dial(UserId::from("bob"), CallKind::Voice).await.unwrap();
        let session = alice.active().unwrap();
        session.wait_for_state(SessionState::Ringing).await;

        alice.handle_inbox_event(&InboxEvent::CallCancelled(CallCancelledPayload {
            caller_id: UserId::from("mallory"),
            kind: CallKind::Voice,
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(alice.active().unwrap().snapshot().state, SessionState::Ringing);

        alice.take_active().unwrap().hang_up();
    }
}
