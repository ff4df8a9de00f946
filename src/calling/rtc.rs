//! WebRTC peer connections.
//!
//! Negotiation data is JSON: either a full session description or one
//! trickled ICE candidate. The caller offers as soon as it is created and,
//! once gathering completes, sends its description again with every
//! candidate folded in, so the last blob it produced is enough on its own
//! for a late receiver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::media::{LocalStream, LocalTrack, TrackKind};
use super::peer::{
    PeerConnection, PeerConnector, PeerErrorKind, PeerEvent, PeerEventSender, RemoteStream,
};
use super::quality::{ConnectionQualitySample, LossTracker};
use super::tone::{self, ToneGenerator};
use super::CallError;
use crate::models::{CallRole, NegotiationBlob};

const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Negotiation message carried inside a `NegotiationBlob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RtcSignal {
    Description { description: RTCSessionDescription },
    Candidate { candidate: RTCIceCandidateInit },
}

impl RtcSignal {
    fn to_blob(&self) -> Option<NegotiationBlob> {
        match serde_json::to_vec(self) {
            Ok(bytes) => Some(NegotiationBlob::new(bytes)),
            Err(e) => {
                tracing::warn!("Failed to encode negotiation data: {}", e);
                None
            }
        }
    }
}

fn emit(events: &PeerEventSender, signal: RtcSignal) {
    if let Some(blob) = signal.to_blob() {
        let _ = events.send(PeerEvent::NegotiationData(blob));
    }
}

fn setup_err(e: impl std::fmt::Display) -> CallError {
    CallError::PeerSetup(e.to_string())
}

/// Creates webrtc-rs peer connections.
#[derive(Debug, Clone, Default)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(setup_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        api.new_peer_connection(config).await.map_err(setup_err)
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn create(
        &self,
        role: CallRole,
        local: &LocalStream,
        events: PeerEventSender,
    ) -> Result<Box<dyn PeerConnection>, CallError> {
        let pc = Arc::new(self.new_peer_connection().await?);
        let peer = RtcPeer {
            pc: pc.clone(),
            events: events.clone(),
            pending_candidates: Mutex::new(Vec::new()),
            loss: Arc::new(StdMutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        };

        peer.install_handlers(role);
        for track in local.tracks() {
            peer.attach_track(local, track).await?;
        }

        if role == CallRole::Caller {
            let offer = pc.create_offer(None).await.map_err(setup_err)?;
            emit(
                &events,
                RtcSignal::Description {
                    description: offer.clone(),
                },
            );
            pc.set_local_description(offer).await.map_err(setup_err)?;
            tracing::info!("Sent offer");
        }

        Ok(Box::new(peer))
    }
}

/// One webrtc-rs connection plus the tasks feeding it.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
    /// Candidates that arrived before the remote description.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    /// Receive counters keyed by SSRC.
    loss: Arc<StdMutex<HashMap<u32, LossTracker>>>,
    closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl RtcPeer {
    fn install_handlers(&self, role: CallRole) {
        let events = self.events.clone();
        let weak: Weak<RTCPeerConnection> = Arc::downgrade(&self.pc);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let weak = weak.clone();
                Box::pin(async move {
                    match candidate {
                        Some(c) => match c.to_json() {
                            Ok(init) => emit(&events, RtcSignal::Candidate { candidate: init }),
                            Err(e) => tracing::warn!("Unusable local candidate: {}", e),
                        },
                        None => {
                            tracing::debug!("ICE gathering complete");
                            if role != CallRole::Caller {
                                return;
                            }
                            let Some(pc) = weak.upgrade() else { return };
                            if let Some(description) = pc.local_description().await {
                                emit(&events, RtcSignal::Description { description });
                            }
                        }
                    }
                })
            }));

        let events = self.events.clone();
        let degraded = Arc::new(AtomicBool::new(false));
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {}", state);
                match state {
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        if !degraded.swap(true, Ordering::SeqCst) {
                            let _ = events.send(PeerEvent::Error(PeerErrorKind::IceFailure));
                        }
                    }
                    RTCPeerConnectionState::Connected => {
                        if degraded.swap(false, Ordering::SeqCst) {
                            let _ = events.send(PeerEvent::Recovered);
                        }
                    }
                    _ => {}
                }
                Box::pin(async {})
            }));

        let events = self.events.clone();
        let loss = self.loss.clone();
        let announced = Arc::new(AtomicBool::new(false));
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Remote {:?} track (ssrc={})", kind, track.ssrc());
            if !announced.swap(true, Ordering::SeqCst) {
                let _ = events.send(PeerEvent::RemoteStream(RemoteStream {
                    id: track.stream_id(),
                    kinds: vec![kind],
                }));
            }

            let loss = loss.clone();
            tokio::spawn(async move {
                let ssrc = track.ssrc();
                while let Ok((packet, _)) = track.read_rtp().await {
                    loss.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .entry(ssrc)
                        .or_default()
                        .record(packet.header.sequence_number);
                }
                tracing::debug!("Remote track {} ended", ssrc);
            });
            Box::pin(async {})
        }));
    }

    async fn attach_track(&self, stream: &LocalStream, track: &LocalTrack) -> Result<(), CallError> {
        let codec = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: 8000,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            codec,
            track.id().to_string(),
            stream.id().to_string(),
        ));
        let sender = self
            .pc
            .add_track(sample_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(setup_err)?;

        // RTCP has to be drained for the interceptors to work.
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        self.track_task(rtcp);

        // No video encoder: the video track negotiates but carries no frames.
        if track.kind() == TrackKind::Audio {
            self.track_task(tokio::spawn(pump_audio(sample_track, track.clone())));
        }
        Ok(())
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    async fn apply(&self, signal: RtcSignal) -> Result<(), webrtc::Error> {
        match signal {
            RtcSignal::Description { description } => match description.sdp_type {
                RTCSdpType::Offer => {
                    if self.pc.remote_description().await.is_some() {
                        tracing::debug!("Already have the remote offer; ignoring repeat");
                        return Ok(());
                    }
                    self.pc.set_remote_description(description).await?;
                    self.flush_candidates().await;
                    let answer = self.pc.create_answer(None).await?;
                    emit(
                        &self.events,
                        RtcSignal::Description {
                            description: answer.clone(),
                        },
                    );
                    self.pc.set_local_description(answer).await?;
                    tracing::info!("Sent answer");
                }
                RTCSdpType::Answer => {
                    if self.pc.remote_description().await.is_some() {
                        tracing::debug!("Already have the remote answer; ignoring repeat");
                        return Ok(());
                    }
                    self.pc.set_remote_description(description).await?;
                    self.flush_candidates().await;
                }
                other => tracing::debug!("Ignoring {} description", other),
            },
            RtcSignal::Candidate { candidate } => {
                if self.pc.remote_description().await.is_none() {
                    self.pending_candidates.lock().await.push(candidate);
                } else {
                    self.pc.add_ice_candidate(candidate).await?;
                }
            }
        }
        Ok(())
    }

    async fn flush_candidates(&self) {
        let pending = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Buffered candidate rejected: {}", e);
            }
        }
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn apply_remote_negotiation_data(&self, data: &NegotiationBlob) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("Connection closed; dropping negotiation data");
            return;
        }
        let signal: RtcSignal = match serde_json::from_slice(data.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Unreadable negotiation data ({} bytes): {}", data.len(), e);
                return;
            }
        };
        if let Err(e) = self.apply(signal).await {
            tracing::warn!("Failed to apply negotiation data: {}", e);
        }
    }

    async fn sample_packet_loss(&self) -> Option<ConnectionQualitySample> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let trackers = self.loss.lock().unwrap_or_else(|e| e.into_inner());
        Some(
            trackers
                .values()
                .map(LossTracker::sample)
                .fold(ConnectionQualitySample::default(), ConnectionQualitySample::combine),
        )
    }

    async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
        tracing::info!("Peer connection closed");
    }
}

/// Feed 20 ms tone frames into the track until it is stopped.
async fn pump_audio(sample_track: Arc<TrackLocalStaticSample>, track: LocalTrack) {
    let mut generator = ToneGenerator::default();
    let mut ticker = tokio::time::interval(AUDIO_FRAME);
    while track.is_live() {
        ticker.tick().await;
        // Keep the tone phase moving while muted.
        let frame = generator.next_pcmu_frame();
        let data = if track.is_enabled() {
            frame
        } else {
            tone::silence_frame()
        };
        let sample = Sample {
            data: Bytes::from(data),
            duration: AUDIO_FRAME,
            ..Default::default()
        };
        if let Err(e) = sample_track.write_sample(&sample).await {
            tracing::debug!("Audio write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallKind;
    use tokio::sync::mpsc;

    #[test]
    fn test_candidate_signal_wire_shape() {
        let signal = RtcSignal::Candidate {
            candidate: RTCIceCandidateInit {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let v: serde_json::Value = serde_json::to_value(&signal).unwrap();
        assert_eq!(v["kind"], "candidate");
        assert_eq!(v["candidate"]["sdpMid"], "0");
    }

    #[tokio::test]
    async fn test_caller_offers_immediately() {
        let connector = RtcConnector::new(Vec::new());
        let local = LocalStream::new(CallKind::Voice);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let peer = connector.create(CallRole::Caller, &local, tx).await.unwrap();
        let first = rx.recv().await.unwrap();
        let PeerEvent::NegotiationData(blob) = first else {
            panic!("expected negotiation data, got {:?}", first);
        };
        let signal: RtcSignal = serde_json::from_slice(blob.as_bytes()).unwrap();
        match signal {
            RtcSignal::Description { description } => {
                assert_eq!(description.sdp_type, RTCSdpType::Offer);
                assert!(description.sdp.contains("PCMU"));
            }
            other => panic!("expected offer, got {:?}", other),
        }

        peer.destroy().await;
        local.stop();
    }

    #[tokio::test]
    async fn test_destroyed_peer_ignores_data_and_stops_sampling() {
        let connector = RtcConnector::new(Vec::new());
        let local = LocalStream::new(CallKind::Voice);
        let (tx, _rx) = mpsc::unbounded_channel();

        let peer = connector.create(CallRole::Receiver, &local, tx).await.unwrap();
        assert_eq!(
            peer.sample_packet_loss().await,
            Some(ConnectionQualitySample::default())
        );

        peer.destroy().await;
        peer.destroy().await;
        peer.apply_remote_negotiation_data(&NegotiationBlob::new(b"{}".to_vec()))
            .await;
        assert!(peer.sample_packet_loss().await.is_none());
        local.stop();
    }
}
