//! One call attempt, from media acquisition to teardown.
//!
//! Each session runs as its own task and is driven through a
//! `SessionHandle`. The task multiplexes user commands, signaling envelopes,
//! peer connection events and the quality/reconnect timers in one
//! `select!` loop, so session state is only ever touched from one place.
//! Observers follow the session through a `watch` channel of snapshots.

use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, Sleep};

use super::inbox::InboxNotifier;
use super::media::{LocalStream, MediaCapture, TrackKind};
use super::peer::{PeerConnection, PeerConnector, PeerErrorKind, PeerEvent, PeerEventSender, RemoteStream};
use super::signaling::{is_stale, SignalingChannel};
use super::{CallError, SessionState};
use crate::bus::MessageBus;
use crate::config::CallSettings;
use crate::models::{
    CallCancelledPayload, CallIntent, CallRole, NegotiationBlob, SignalBody, SignalEnvelope, UserId,
};

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub bus: Arc<dyn MessageBus>,
    pub media: Arc<dyn MediaCapture>,
    pub peers: Arc<dyn PeerConnector>,
    pub inbox: InboxNotifier,
    pub settings: CallSettings,
}

/// Observable state of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Display name of the other party.
    pub peer_name: String,
    pub poor_connection: bool,
    pub muted: bool,
    pub camera_off: bool,
    pub local_stream: Option<LocalStream>,
    pub remote_stream: Option<RemoteStream>,
}

impl SessionSnapshot {
    fn initial(peer_name: String) -> Self {
        Self {
            state: SessionState::Initializing,
            peer_name,
            poor_connection: false,
            muted: false,
            camera_off: false,
            local_stream: None,
            remote_stream: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    ToggleMute,
    ToggleCamera,
    HangUp,
    Abort,
}

/// Control handle for a running session.
pub struct SessionHandle {
    intent: CallIntent,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn intent(&self) -> &CallIntent {
        &self.intent
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that sees every snapshot published from now on.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn toggle_mute(&self) {
        self.send(Command::ToggleMute);
    }

    pub fn toggle_camera(&self) {
        self.send(Command::ToggleCamera);
    }

    /// End the call, telling the other party.
    pub fn hang_up(&self) {
        self.send(Command::HangUp);
    }

    /// End the call locally because the other party already gave up.
    pub(crate) fn abort(&self) {
        self.send(Command::Abort);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Session already finished");
        }
    }

    /// Wait for a snapshot matching `pred`, or the last one if the session
    /// ends first.
    pub async fn wait_for(&self, mut pred: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut rx = self.snapshots.clone();
        let matched = rx.wait_for(|s| pred(s)).await.map(|s| s.clone()).ok();
        let snapshot = matched.unwrap_or_else(|| rx.borrow().clone());
        snapshot
    }

    pub async fn wait_for_state(&self, state: SessionState) -> SessionSnapshot {
        self.wait_for(|s| s.state == state).await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session task to exit.
    pub async fn join(self) -> SessionSnapshot {
        let snapshots = self.snapshots;
        if let Err(e) = self.task.await {
            tracing::warn!("Session task failed: {}", e);
        }
        let last = snapshots.borrow().clone();
        last
    }
}

/// Start a session for `intent` on behalf of `own_id`. `peer_name` is what
/// the call screen shows for the other party.
pub fn spawn(
    own_id: UserId,
    intent: CallIntent,
    peer_name: String,
    deps: SessionDeps,
) -> SessionHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshots) = watch::channel(SessionSnapshot::initial(peer_name.clone()));
    let session = CallSession::new(own_id, intent.clone(), peer_name, deps, snapshot_tx);
    let task = tokio::spawn(session.run(command_rx));
    SessionHandle {
        intent,
        commands,
        snapshots,
        task,
    }
}

struct CallSession {
    own_id: UserId,
    intent: CallIntent,
    peer_name: String,
    deps: SessionDeps,
    snapshots: watch::Sender<SessionSnapshot>,

    state: SessionState,
    poor_connection: bool,
    muted: bool,
    camera_off: bool,
    connected_once: bool,

    local: Option<LocalStream>,
    remote: Option<RemoteStream>,
    channel: Option<SignalingChannel>,
    peer: Option<Box<dyn PeerConnection>>,
    /// Most recent negotiation data we produced, replayed on ReadyPing.
    last_negotiation: Option<NegotiationBlob>,

    quality_poll: Option<Interval>,
    reconnect_deadline: Option<Pin<Box<Sleep>>>,
    torn_down: bool,
}

impl CallSession {
    fn new(
        own_id: UserId,
        intent: CallIntent,
        peer_name: String,
        deps: SessionDeps,
        snapshots: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            own_id,
            intent,
            peer_name,
            deps,
            snapshots,
            state: SessionState::Initializing,
            poor_connection: false,
            muted: false,
            camera_off: false,
            connected_once: false,
            local: None,
            remote: None,
            channel: None,
            peer: None,
            last_negotiation: None,
            quality_poll: None,
            reconnect_deadline: None,
            torn_down: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(
            "Starting {} call with {} as {:?}",
            self.intent.kind,
            self.intent.peer_id,
            self.intent.role
        );
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();

        // Setup may wait on a permission prompt for as long as the user
        // takes, so ending the call has to be possible meanwhile.
        let mut deferred = Vec::new();
        let started = tokio::select! {
            result = self.start(peer_tx) => Some(result),
            command = ending_command(&mut commands, &mut deferred) => {
                self.handle_command(command).await;
                None
            }
        };
        match started {
            Some(Ok(())) => {
                for command in deferred {
                    self.handle_command(command).await;
                }
            }
            Some(Err(e)) if e.is_media_failure() => {
                tracing::warn!("Cannot start call: {}", e);
                self.finish(SessionState::AccessDenied).await;
                return;
            }
            Some(Err(e)) => {
                tracing::error!("Call setup failed: {}", e);
                self.finish(SessionState::Terminated).await;
                return;
            }
            None => return,
        }

        while !self.state.is_terminal() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::info!("Session handle dropped; hanging up");
                        self.hang_up().await;
                    }
                },
                envelope = next_envelope(&mut self.channel) => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        tracing::warn!("Signaling channel closed");
                        self.finish(SessionState::Terminated).await;
                    }
                },
                Some(event) = peer_rx.recv() => self.handle_peer_event(event).await,
                _ = tick(&mut self.quality_poll) => self.sample_quality().await,
                _ = expired(&mut self.reconnect_deadline) => self.reconnect_timed_out().await,
            }
        }
        tracing::info!("Call with {} ended ({:?})", self.intent.peer_id, self.state);
    }

    /// Acquire media, join the signaling channel and create the connection.
    async fn start(&mut self, peer_tx: PeerEventSender) -> Result<(), CallError> {
        let local = self.deps.media.acquire(self.intent.kind).await?;
        self.local = Some(local.clone());
        self.publish();

        let channel =
            SignalingChannel::open(self.deps.bus.as_ref(), &self.own_id, &self.intent.peer_id)
                .await?;
        tracing::debug!("Joined signaling channel {}", channel.key());
        self.channel = Some(channel);

        let peer = self
            .deps
            .peers
            .create(self.intent.role, &local, peer_tx)
            .await?;
        self.peer = Some(peer);

        match self.intent.role {
            CallRole::Caller => self.set_state(SessionState::Ringing),
            CallRole::Receiver => {
                self.set_state(SessionState::Connecting);
                self.send(SignalBody::ReadyPing).await;
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ToggleMute => {
                self.muted = !self.muted;
                if let Some(ref local) = self.local {
                    local.set_track_enabled(TrackKind::Audio, !self.muted);
                }
                tracing::info!("Microphone {}", if self.muted { "muted" } else { "on" });
                self.publish();
            }
            Command::ToggleCamera => {
                let has_video = self
                    .local
                    .as_ref()
                    .is_some_and(|l| l.has_track(TrackKind::Video));
                if !has_video {
                    tracing::debug!("No camera in this call");
                    return;
                }
                self.camera_off = !self.camera_off;
                if let Some(ref local) = self.local {
                    local.set_track_enabled(TrackKind::Video, !self.camera_off);
                }
                tracing::info!("Camera {}", if self.camera_off { "off" } else { "on" });
                self.publish();
            }
            Command::HangUp => self.hang_up().await,
            Command::Abort => {
                tracing::info!("Call withdrawn by {}", self.intent.peer_id);
                self.finish(SessionState::Terminated).await;
            }
        }
    }

    async fn hang_up(&mut self) {
        tracing::info!("Hanging up");
        self.send(SignalBody::Hangup).await;
        if !self.connected_once {
            let notice = CallCancelledPayload {
                caller_id: self.own_id.clone(),
                kind: self.intent.kind,
            };
            self.deps
                .inbox
                .notify_cancelled(&self.intent.peer_id, &notice)
                .await;
        }
        self.finish(SessionState::Terminated).await;
    }

    async fn handle_envelope(&mut self, envelope: SignalEnvelope) {
        if envelope.sender_id == self.own_id {
            return;
        }
        match envelope.body {
            SignalBody::Negotiation(blob) => {
                let now = chrono::Utc::now().timestamp_millis();
                if is_stale(envelope.sent_at_ms, now, self.deps.settings.ghost_window_ms) {
                    tracing::debug!(
                        "Discarding stale negotiation data ({} ms old)",
                        now - envelope.sent_at_ms
                    );
                    return;
                }
                if let Some(ref peer) = self.peer {
                    peer.apply_remote_negotiation_data(&blob).await;
                }
            }
            SignalBody::ReadyPing => {
                if self.intent.role != CallRole::Caller {
                    return;
                }
                match self.last_negotiation.clone() {
                    Some(blob) => {
                        tracing::info!("{} is ready; resending negotiation data", self.intent.peer_id);
                        self.send(SignalBody::Negotiation(blob)).await;
                    }
                    None => tracing::debug!("Ready ping before any negotiation data"),
                }
            }
            SignalBody::Hangup => {
                tracing::info!("{} hung up", self.intent.peer_id);
                self.finish(SessionState::Terminated).await;
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationData(blob) => {
                self.last_negotiation = Some(blob.clone());
                self.send(SignalBody::Negotiation(blob)).await;
            }
            PeerEvent::RemoteStream(stream) => {
                tracing::info!("Remote media arrived ({})", stream.id);
                self.remote = Some(stream);
                match self.state {
                    SessionState::Ringing | SessionState::Connecting | SessionState::Reconnecting => {
                        self.on_connected()
                    }
                    _ => self.publish(),
                }
            }
            PeerEvent::Recovered => {
                if self.state == SessionState::Reconnecting {
                    tracing::info!("Connection recovered");
                    self.on_connected();
                }
            }
            PeerEvent::Error(PeerErrorKind::IceFailure) => {
                if self.state == SessionState::Connected {
                    tracing::warn!("Connectivity lost; reconnecting");
                    self.reconnect_deadline = self
                        .deps
                        .settings
                        .reconnect_timeout()
                        .map(|t| Box::pin(time::sleep(t)));
                    self.set_state(SessionState::Reconnecting);
                } else {
                    tracing::debug!("ICE failure while {:?}", self.state);
                }
            }
            PeerEvent::Error(PeerErrorKind::Other(message)) => {
                tracing::warn!("Peer connection error: {}", message);
            }
        }
    }

    fn on_connected(&mut self) {
        self.connected_once = true;
        self.reconnect_deadline = None;
        if self.quality_poll.is_none() {
            let period = self.deps.settings.quality_poll_interval();
            self.quality_poll = Some(time::interval_at(Instant::now() + period, period));
        }
        self.set_state(SessionState::Connected);
    }

    async fn sample_quality(&mut self) {
        let sample = match self.peer {
            Some(ref peer) => peer.sample_packet_loss().await,
            None => None,
        };
        let Some(sample) = sample else {
            tracing::debug!("Connection closed; stopping quality polling");
            self.quality_poll = None;
            return;
        };
        let poor = sample.is_poor(self.deps.settings.poor_loss_ratio);
        if poor != self.poor_connection {
            if poor {
                tracing::warn!(
                    "Poor connection: {:.1}% loss ({} lost, {} received)",
                    sample.loss_ratio() * 100.0,
                    sample.packets_lost,
                    sample.packets_received
                );
            } else {
                tracing::info!("Connection quality recovered");
            }
            self.poor_connection = poor;
            self.publish();
        }
    }

    async fn reconnect_timed_out(&mut self) {
        tracing::warn!("Could not reconnect; ending call");
        self.send(SignalBody::Hangup).await;
        self.finish(SessionState::Terminated).await;
    }

    async fn send(&self, body: SignalBody) {
        let Some(ref channel) = self.channel else {
            return;
        };
        let envelope = SignalEnvelope::now(self.own_id.clone(), body);
        if let Err(e) = channel.send(&envelope).await {
            tracing::warn!("Failed to send {}: {}", envelope.body.event_name(), e);
        }
    }

    async fn finish(&mut self, state: SessionState) {
        self.teardown().await;
        self.set_state(state);
    }

    /// Release everything the session holds. Runs its body once.
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.quality_poll = None;
        self.reconnect_deadline = None;

        if let Some(peer) = self.peer.take() {
            peer.destroy().await;
        }
        self.remote = None;
        if let Some(local) = self.local.take() {
            self.deps.media.release(&local);
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        tracing::debug!("Session resources released");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::info!("Call state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(SessionSnapshot {
            state: self.state,
            poor_connection: self.poor_connection,
            muted: self.muted,
            camera_off: self.camera_off,
            peer_name: self.peer_name.clone(),
            local_stream: self.local.clone(),
            remote_stream: self.remote.clone(),
        });
    }
}

/// Wait for a command that ends the call, holding back the others.
/// A dropped handle counts as hanging up.
async fn ending_command(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    deferred: &mut Vec<Command>,
) -> Command {
    loop {
        match commands.recv().await {
            Some(command @ (Command::HangUp | Command::Abort)) => return command,
            Some(command) => deferred.push(command),
            None => return Command::HangUp,
        }
    }
}

async fn next_envelope(channel: &mut Option<SignalingChannel>) -> Option<SignalEnvelope> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(deadline) => deadline.as_mut().await,
        None => std::future::pending().await,
    }
}
