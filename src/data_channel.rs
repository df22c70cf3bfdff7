use crate::error::Error;
use crate::peer_connection::WebrtcTransport;
use crate::transport::{MessageChannel, TransportEvent, TransportEvents};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// [MessageChannel] over a WebRTC data channel. State changes and incoming text messages are
/// forwarded to the transport event sender.
pub struct DataChannel {
    dc: Arc<RTCDataChannel>,
    status: Arc<ArcSwap<DataChannelState>>,
    events: TransportEvents<WebrtcTransport>,
}

impl DataChannel {
    /// Starts as `Connecting` (or `Closed`). A channel which is already open when wrapped is
    /// reported by [DataChannel::sync_ready_state].
    pub(crate) fn new(dc: Arc<RTCDataChannel>, events: TransportEvents<WebrtcTransport>) -> Self {
        let initial = match dc.ready_state() {
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                DataChannelState::Closed
            }
            _ => DataChannelState::Connecting,
        };
        let status = Arc::new(ArcSwap::from_pointee(initial));

        let s = Arc::downgrade(&status);
        let tx = events.clone();
        dc.on_open(Box::new(move || {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    transition(&status, DataChannelState::Open, &tx);
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let tx = events.clone();
        dc.on_close(Box::new(move || {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    transition(&status, DataChannelState::Closed, &tx);
                }
            })
        }));
        let label = dc.label().to_owned();
        dc.on_error(Box::new(move |e| {
            warn!("data channel '{}' failed: {}", label, e);
            Box::pin(async move {})
        }));
        let tx = events.clone();
        dc.on_message(Box::new(move |msg| {
            if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(TransportEvent::Message(text));
                    }
                    Err(e) => warn!("dropping non UTF-8 text message: {}", e),
                }
            } else {
                debug!("dropping binary message ({} bytes)", msg.data.len());
            }
            Box::pin(async move {})
        }));

        DataChannel { dc, status, events }
    }

    /// Reports the channel as open if the underlying data channel already is. Open
    /// notification is sent at most once, no matter if it comes from here or from the
    /// data channel itself.
    pub(crate) fn sync_ready_state(&self) {
        if self.dc.ready_state() == RTCDataChannelState::Open {
            transition(&self.status, DataChannelState::Open, &self.events);
        }
    }
}

/// Moves the channel to `next` state, notifying about it unless it already was there.
fn transition(
    status: &ArcSwap<DataChannelState>,
    next: DataChannelState,
    events: &TransportEvents<WebrtcTransport>,
) {
    let old = status.swap(Arc::new(next));
    if *old == next {
        return;
    }
    let event = match next {
        DataChannelState::Open => TransportEvent::ChannelOpen,
        DataChannelState::Closed => TransportEvent::ChannelClose,
        DataChannelState::Connecting => return,
    };
    let _ = events.send(event);
}

#[async_trait]
impl MessageChannel for DataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        **self.status.load() == DataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::channel_closed());
        }
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        let old = self.status.swap(Arc::new(DataChannelState::Closed));
        if *old != DataChannelState::Closed {
            self.dc.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.dc.label())
            .field("state", &**self.status.load())
            .finish()
    }
}

impl AsRef<RTCDataChannel> for DataChannel {
    fn as_ref(&self) -> &RTCDataChannel {
        &self.dc
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DataChannelState {
    /// Underlying data channel is waiting to become open.
    Connecting,
    /// Underlying data channel is open and ready to send/receive messages.
    Open,
    Closed,
}
