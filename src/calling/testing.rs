//! Test doubles for the call core.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::media::{LocalStream, MediaCapture, TrackKind};
use super::peer::{PeerConnection, PeerConnector, PeerEvent, PeerEventSender, RemoteStream};
use super::quality::ConnectionQualitySample;
use super::CallError;
use crate::models::{CallKind, CallRole, NegotiationBlob};

pub const OFFER: &[u8] = b"offer";
pub const ANSWER: &[u8] = b"answer";

/// Capture that counts releases and can be told to fail or hang.
#[derive(Clone, Default)]
pub struct FakeCapture {
    pub deny: bool,
    /// Never answer, like a permission prompt nobody clicks.
    pub stall: bool,
    pub releases: Arc<AtomicUsize>,
}

impl FakeCapture {
    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Default::default()
        }
    }

    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Default::default()
        }
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self, kind: CallKind) -> Result<LocalStream, CallError> {
        if self.stall {
            return std::future::pending().await;
        }
        if self.deny {
            return Err(CallError::MediaAccessDenied);
        }
        Ok(LocalStream::new(kind))
    }

    fn release(&self, stream: &LocalStream) {
        stream.stop();
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared view of one fake connection, for driving and inspecting it.
#[derive(Clone)]
pub struct PeerProbe {
    pub role: CallRole,
    pub events: PeerEventSender,
    pub applied: Arc<Mutex<Vec<NegotiationBlob>>>,
    pub destroyed: Arc<AtomicUsize>,
    pub sample: Arc<Mutex<ConnectionQualitySample>>,
}

impl PeerProbe {
    pub fn applied(&self) -> Vec<NegotiationBlob> {
        self.applied.lock().unwrap().clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn set_sample(&self, lost: u64, received: u64) {
        *self.sample.lock().unwrap() = ConnectionQualitySample {
            packets_lost: lost,
            packets_received: received,
        };
    }

    pub fn emit(&self, event: PeerEvent) {
        self.events.send(event).unwrap();
    }
}

struct FakePeer {
    probe: PeerProbe,
    /// Answer offers and report remote media like a real connection would.
    loopback: bool,
}

fn remote_stream() -> RemoteStream {
    RemoteStream {
        id: "remote".to_string(),
        kinds: vec![TrackKind::Audio],
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn apply_remote_negotiation_data(&self, data: &NegotiationBlob) {
        if self.probe.destroy_count() > 0 {
            return;
        }
        self.probe.applied.lock().unwrap().push(data.clone());
        if !self.loopback {
            return;
        }
        if data.as_bytes() == OFFER {
            let _ = self
                .probe
                .events
                .send(PeerEvent::NegotiationData(NegotiationBlob::new(ANSWER)));
            let _ = self.probe.events.send(PeerEvent::RemoteStream(remote_stream()));
        } else if data.as_bytes() == ANSWER {
            let _ = self.probe.events.send(PeerEvent::RemoteStream(remote_stream()));
        }
    }

    async fn sample_packet_loss(&self) -> Option<ConnectionQualitySample> {
        if self.probe.destroy_count() > 0 {
            return None;
        }
        Some(*self.probe.sample.lock().unwrap())
    }

    async fn destroy(&self) {
        self.probe.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out fake peers.
#[derive(Clone, Default)]
pub struct FakeConnector {
    loopback: bool,
    probes: Arc<Mutex<Vec<PeerProbe>>>,
}

impl FakeConnector {
    /// Peers only record what they are given.
    pub fn scripted() -> Self {
        Self::default()
    }

    /// Callers offer on creation; peers answer and connect.
    pub fn loopback() -> Self {
        Self {
            loopback: true,
            ..Default::default()
        }
    }

    pub fn probes(&self) -> Vec<PeerProbe> {
        self.probes.lock().unwrap().clone()
    }

    /// Wait for the `index`th created peer.
    pub async fn probe(&self, index: usize) -> PeerProbe {
        wait_until(|| self.probes.lock().unwrap().len() > index).await;
        self.probes.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn create(
        &self,
        role: CallRole,
        _local: &LocalStream,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, CallError> {
        let probe = PeerProbe {
            role,
            events,
            applied: Arc::default(),
            destroyed: Arc::default(),
            sample: Arc::default(),
        };
        if self.loopback && role == CallRole::Caller {
            let _ = probe
                .events
                .send(PeerEvent::NegotiationData(NegotiationBlob::new(OFFER)));
        }
        self.probes.lock().unwrap().push(probe.clone());
        Ok(Box::new(FakePeer {
            probe,
            loopback: self.loopback,
        }))
    }
}

/// Poll `cond` until it holds, panicking after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
