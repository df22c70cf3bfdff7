use crate::data_channel::DataChannel;
use crate::error::Error;
use crate::room::{Candidate, SdpKind, SessionDescription};
use crate::transport::{Transport, TransportEvent, TransportEvents};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt::Formatter;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Configuration used by default: a single public STUN server.
pub fn default_rtc_config() -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".to_owned()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// [Transport] implemented on top of webrtc-rs peer connection.
pub struct WebrtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents<WebrtcTransport>,
}

impl WebrtcTransport {
    /// Creates a new peer connection. All of its notifications are routed to `events`.
    pub async fn start(
        rtc_config: RTCConfiguration,
        events: TransportEvents<WebrtcTransport>,
    ) -> Result<Self, Error> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        // Interceptors provide NACKs, RTCP reports etc. A registry is required per connection.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        pc.on_peer_connection_state_change(Box::new(move |s| {
            info!("peer connection state changed: {}", s);
            Box::pin(async move {})
        }));
        pc.on_signaling_state_change(Box::new(move |s| {
            debug!("signaling state changed: {}", s);
            Box::pin(async move {})
        }));
        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let candidate = match candidate {
                    None => Ok(None), // gathering complete
                    Some(c) => c.to_json().map(Some),
                };
                match candidate {
                    Ok(candidate) => {
                        let _ = events.send(TransportEvent::Candidate(candidate));
                    }
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let channel = Arc::new(DataChannel::new(dc, events.clone()));
                // channel must be known before it's reported as open
                let _ = events.send(TransportEvent::Channel(channel.clone()));
                channel.sync_ready_state();
                Box::pin(async move {})
            }));
        }
        {
            let events = events.clone();
            pc.on_track(Box::new(
                move |track: Arc<TrackRemote>,
                      _receiver: Arc<RTCRtpReceiver>,
                      _transceiver: Arc<RTCRtpTransceiver>| {
                    let _ = events.send(TransportEvent::Track(track));
                    Box::pin(async move {})
                },
            ));
        }
        {
            let events = events.clone();
            pc.on_negotiation_needed(Box::new(move || {
                let _ = events.send(TransportEvent::NegotiationNeeded);
                Box::pin(async move {})
            }));
        }

        Ok(WebrtcTransport { pc, events })
    }

    fn to_rtc(sdp: SessionDescription) -> Result<RTCSessionDescription, Error> {
        let desc = match sdp.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp)?,
        };
        Ok(desc)
    }
}

#[async_trait]
impl Transport for WebrtcTransport {
    type Channel = DataChannel;
    type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;
    type RemoteTrack = Arc<TrackRemote>;
    type Sender = Arc<RTCRtpSender>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<DataChannel>, Error> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(Arc::new(DataChannel::new(dc, self.events.clone())))
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.pc.set_local_description(Self::to_rtc(sdp)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.pc.set_remote_description(Self::to_rtc(sdp)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), Error> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn add_track(&self, track: Self::LocalTrack) -> Result<Self::Sender, Error> {
        Ok(self.pc.add_track(track).await?)
    }

    async fn remove_track(&self, sender: &Self::Sender) -> Result<(), Error> {
        self.pc.remove_track(sender).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.pc.close().await?;
        Ok(())
    }
}

impl AsRef<RTCPeerConnection> for WebrtcTransport {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.pc
    }
}

impl std::fmt::Debug for WebrtcTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebrtcTransport")
            .field("connection_state", &self.pc.connection_state())
            .field("signaling_state", &self.pc.signaling_state())
            .finish()
    }
}
