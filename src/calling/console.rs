//! Terminal front end: place, receive and demo calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time;

use super::inbox::{InboxNotifier, InboxSubscription};
use super::manager::CallManager;
use super::media::SyntheticCapture;
use super::rtc::RtcConnector;
use super::session::{SessionDeps, SessionSnapshot};
use super::SessionState;
use crate::api::{
    InMemoryMessageLog, MessageLog, ProfileLookup, RestClient, RestMessageLog, RestProfiles,
    StaticProfiles,
};
use crate::auth::{ConfigIdentity, IdentityProvider, TokenStore};
use crate::bus::{MemoryBus, MessageBus, WsBus};
use crate::config::Config;
use crate::models::{CallKind, InboxEvent, UserId};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Collaborators for calls over the configured backend.
fn live_manager(config: &Config) -> Result<CallManager> {
    let own_id = ConfigIdentity::new(config)
        .current_user_id()
        .context("Run 'peercall login' first")?;
    let token = config.get_access_token().map(|t| t.token);
    let bus: Arc<dyn MessageBus> = Arc::new(WsBus::new(config.bus_url()?, token));

    let (log, profiles): (Arc<dyn MessageLog>, Arc<dyn ProfileLookup>) = if config.api_url.is_some()
    {
        let client = RestClient::from_config(config)?;
        (
            Arc::new(RestMessageLog::new(client.clone())),
            Arc::new(RestProfiles::new(client)),
        )
    } else {
        tracing::warn!("No api_url configured; missed calls are not persisted");
        (
            Arc::new(InMemoryMessageLog::new()),
            Arc::new(StaticProfiles::new(local_names(config))),
        )
    };

    let deps = SessionDeps {
        bus: bus.clone(),
        media: Arc::new(SyntheticCapture::new(config.call.video_device.clone())),
        peers: Arc::new(RtcConnector::new(config.call.ice_servers.clone())),
        inbox: InboxNotifier::new(bus, log),
        settings: config.call.clone(),
    };
    Ok(CallManager::new(own_id, deps, profiles))
}

/// Contact names plus our own, for use without a profiles backend.
fn local_names(config: &Config) -> HashMap<String, String> {
    let mut names = config.contacts.clone();
    if let (Some(id), Some(name)) = (&config.user_id, &config.display_name) {
        names.insert(id.clone(), name.clone());
    }
    names
}

/// Place a call and stay in it until it ends.
pub async fn run_call(peer: &str, kind: CallKind, duration: Option<u64>) -> Result<()> {
    let config = Config::load().context("Failed to load config")?;
    let mut manager = live_manager(&config)?;
    let peer = UserId::new(peer);

    // Declines come back through our own inbox.
    let mut inbox = manager.inbox().subscribe(manager.own_id()).await?;

    let own_id = manager.own_id().clone();
    let session = manager.dial(peer.clone(), kind).await?;

    println!();
    println!("=== {} call ===", kind);
    println!("From: {}", own_id);
    println!("To:   {} ({})", session.snapshot().peer_name, peer);
    println!();

    let last = follow_call(&mut manager, Some(&mut inbox), duration.map(Duration::from_secs)).await?;
    inbox.close().await;

    println!("final_state={:?}", last.state);
    Ok(())
}

/// Wait on our inbox and answer (or decline) incoming calls.
pub async fn run_listen(auto_accept: bool) -> Result<()> {
    let config = Config::load().context("Failed to load config")?;
    let mut manager = live_manager(&config)?;
    let mut inbox = manager.inbox().subscribe(manager.own_id()).await?;
    println!("Waiting for calls as {} (Ctrl-C to quit)", manager.own_id());

    loop {
        let event = tokio::select! {
            event = inbox.next() => match event {
                Some(event) => event,
                None => bail!("Inbox subscription closed"),
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            InboxEvent::IncomingCall(ref call) => {
                println!(
                    "Incoming {} call from {} ({})",
                    call.kind, call.caller_name, call.caller_id
                );
                if auto_accept {
                    manager.accept_incoming(call)?;
                    follow_call(&mut manager, Some(&mut inbox), None).await?;
                    println!("Waiting for calls...");
                } else {
                    manager.decline_incoming(call).await;
                    println!("Declined.");
                }
            }
            InboxEvent::CallCancelled(ref notice) => {
                println!("Missed {} call from {}", notice.kind, notice.caller_id);
                manager.handle_inbox_event(&event);
            }
        }
    }

    inbox.close().await;
    Ok(())
}

/// Print state changes of the active call until it ends.
///
/// Ctrl-C or the optional time limit hangs up. Inbox events that arrive
/// meanwhile are handled: cancellations may withdraw the call, other rings
/// are declined as busy.
async fn follow_call(
    manager: &mut CallManager,
    mut inbox: Option<&mut InboxSubscription>,
    limit: Option<Duration>,
) -> Result<SessionSnapshot> {
    let Some(session) = manager.active() else {
        bail!("No active call");
    };
    let mut updates = session.subscribe();
    println!("Call with {}", session.snapshot().peer_name);
    let mut deadline = limit.map(|d| Box::pin(time::sleep(d)));
    let mut shown_state = None;
    let mut shown_poor = false;

    loop {
        let snap = updates.borrow_and_update().clone();
        if shown_state != Some(snap.state) {
            println!("[{}]", snap.state.label());
            shown_state = Some(snap.state);
        }
        if snap.poor_connection != shown_poor {
            shown_poor = snap.poor_connection;
            println!("{}", if shown_poor { "Poor connection" } else { "Connection stable" });
        }
        if snap.state.is_terminal() {
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Hanging up...");
                session.hang_up();
            }
            _ = async {
                match deadline.as_mut() {
                    Some(d) => d.as_mut().await,
                    None => std::future::pending().await,
                }
            } => {
                deadline = None;
                println!("Time limit reached, hanging up...");
                session.hang_up();
            }
            Some(event) = async {
                match inbox.as_deref_mut() {
                    Some(sub) => sub.next().await,
                    None => std::future::pending().await,
                }
            } => match event {
                InboxEvent::IncomingCall(ref call) => {
                    println!("Busy: declining call from {}", call.caller_name);
                    manager.decline_incoming(call).await;
                }
                InboxEvent::CallCancelled(_) => manager.handle_inbox_event(&event),
            },
        }
    }

    let last = updates.borrow().clone();
    if let Some(session) = manager.take_active() {
        session.join().await;
    }
    Ok(last)
}

/// Two in-process participants calling each other over real WebRTC.
pub async fn run_demo(kind: CallKind, duration_secs: u64) -> Result<()> {
    let bus = MemoryBus::new();
    let log = InMemoryMessageLog::new();
    let names = HashMap::from([
        ("alice".to_string(), "Alice".to_string()),
        ("bob".to_string(), "Bob".to_string()),
    ]);
    let profiles: Arc<dyn ProfileLookup> = Arc::new(StaticProfiles::new(names));
    let inbox = InboxNotifier::new(Arc::new(bus.clone()), Arc::new(log.clone()));

    let mut settings = Config::load().map(|c| c.call).unwrap_or_default();
    // Both ends live on this host; host candidates are enough.
    settings.ice_servers.clear();
    let deps = SessionDeps {
        bus: Arc::new(bus.clone()),
        media: Arc::new(SyntheticCapture::default()),
        peers: Arc::new(RtcConnector::new(Vec::new())),
        inbox: inbox.clone(),
        settings,
    };
    let mut alice = CallManager::new(UserId::from("alice"), deps.clone(), profiles.clone());
    let mut bob = CallManager::new(UserId::from("bob"), deps, profiles);

    let mut alice_inbox = inbox.subscribe(alice.own_id()).await?;
    let mut bob_inbox = inbox.subscribe(bob.own_id()).await?;

    println!();
    println!("=== Demo: connected {} call ===", kind);
    alice.dial(UserId::from("bob"), kind).await?;
    let Some(InboxEvent::IncomingCall(ring)) = bob_inbox.next().await else {
        bail!("Bob was not rung");
    };
    println!("bob: incoming {} call from {}", ring.kind, ring.caller_name);
    bob.accept_incoming(&ring)?;

    for (name, manager) in [("alice", &alice), ("bob", &bob)] {
        let session = manager.active().context("session missing")?;
        let snap = time::timeout(CONNECT_TIMEOUT, session.wait_for(|s| {
            s.state == SessionState::Connected || s.state.is_terminal()
        }))
        .await
        .with_context(|| format!("{} did not connect in time", name))?;
        println!("{}: {}", name, snap.state.label());
    }

    time::sleep(Duration::from_secs(duration_secs)).await;
    if let Some(session) = alice.take_active() {
        session.hang_up();
        let last = session.join().await;
        println!("alice: {}", last.state.label());
    }
    if let Some(session) = bob.take_active() {
        let last = time::timeout(Duration::from_secs(5), session.join())
            .await
            .context("bob did not see the hangup")?;
        println!("bob: {}", last.state.label());
    }

    println!();
    println!("=== Demo: declined call ===");
    alice.dial(UserId::from("bob"), kind).await?;
    let Some(InboxEvent::IncomingCall(ring)) = bob_inbox.next().await else {
        bail!("Bob was not rung");
    };
    bob.decline_incoming(&ring).await;
    if let Some(event) = alice_inbox.next().await {
        alice.handle_inbox_event(&event);
    }
    if let Some(session) = alice.take_active() {
        let last = session.join().await;
        println!("alice: {}", last.state.label());
    }

    println!();
    println!("Message log:");
    for row in log.rows() {
        println!("  {} -> {}: {}", row.sender_id, row.receiver_id, row.text);
    }
    Ok(())
}
