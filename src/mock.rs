//! In-memory transport used to exercise negotiation without a network.

use crate::error::Error;
use crate::room::{Candidate, SessionDescription};
use crate::transport::{
    MessageChannel, Transport, TransportEvent, TransportEventReceiver, TransportEvents,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::unbounded_channel;

pub(crate) struct MockChannel {
    label: String,
    open: AtomicBool,
    pub sent: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn open(label: &str) -> Self {
        MockChannel {
            label: label.to_owned(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<serde_json::Value> {
        let sent = self.sent.lock().unwrap();
        sent.iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), Error> {
        if !self.is_open() {
            return Err(Error::channel_closed());
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Transport producing deterministic descriptions (`offer:<name>:<n>`) and two local
/// candidates (`<name>-0`, `<name>-1`) whenever a local description is set.
pub(crate) struct MockTransport {
    name: String,
    events: TransportEvents<MockTransport>,
    rounds: AtomicUsize,
    pub emit_candidates: AtomicBool,
    pub channels: Mutex<Vec<Arc<MockChannel>>>,
    pub local: Mutex<Vec<SessionDescription>>,
    pub remote: Mutex<Vec<SessionDescription>>,
    pub applied: Mutex<Vec<Candidate>>,
    pub closed: Arc<AtomicBool>,
    /// Set when the transport is dropped.
    pub released: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new(name: &str) -> (Self, TransportEventReceiver<Self>) {
        let (events, rx) = unbounded_channel();
        let transport = MockTransport {
            name: name.to_owned(),
            events,
            rounds: AtomicUsize::new(0),
            emit_candidates: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
            local: Mutex::new(Vec::new()),
            remote: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
            released: Arc::new(AtomicBool::new(false)),
        };
        (transport, rx)
    }

    pub fn candidates(name: &str) -> Vec<Candidate> {
        (0..2)
            .map(|i| Candidate {
                candidate: format!("{}-{}", name, i),
                sdp_mid: Some("0".to_owned()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .collect()
    }

    /// Simulates a notification coming from the underlying session.
    pub fn trigger(&self, event: TransportEvent<MockTransport>) {
        self.events.send(event).unwrap();
    }

    pub fn channel(&self) -> Option<Arc<MockChannel>> {
        self.channels.lock().unwrap().last().cloned()
    }

    pub fn applied(&self) -> Vec<String> {
        let applied = self.applied.lock().unwrap();
        applied.iter().map(|c| c.candidate.clone()).collect()
    }

    pub fn remote(&self) -> Vec<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    fn sdp(&self, kind: &str) -> String {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}:{}:{}", kind, self.name, round)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Channel = MockChannel;
    type LocalTrack = String;
    type RemoteTrack = String;
    type Sender = String;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<MockChannel>, Error> {
        let channel = Arc::new(MockChannel::open(label));
        self.channels.lock().unwrap().push(channel.clone());
        let _ = self.events.send(TransportEvent::ChannelOpen);
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, Error> {
        Ok(SessionDescription::offer(self.sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, Error> {
        Ok(SessionDescription::answer(self.sdp("answer")))
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.local.lock().unwrap().push(sdp);
        if self.emit_candidates.load(Ordering::SeqCst) {
            for candidate in Self::candidates(&self.name) {
                let _ = self.events.send(TransportEvent::Candidate(Some(candidate)));
            }
            let _ = self.events.send(TransportEvent::Candidate(None));
        }
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), Error> {
        self.remote.lock().unwrap().push(sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Candidate) -> Result<(), Error> {
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: String) -> Result<String, Error> {
        Ok(format!("sender:{}", track))
    }

    async fn remove_track(&self, _sender: &String) -> Result<(), Error> {
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
