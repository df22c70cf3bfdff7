use crate::error::Error;
use crate::event::{self, Envelope, Event, EventBus};
use crate::gather::CandidateGatherer;
use crate::gist::GistStore;
use crate::peer_connection::{default_rtc_config, WebrtcTransport};
use crate::room::{self, Candidate, Room, SessionDescription};
use crate::store::{DocumentStore, FilePatch};
use crate::transport::{MessageChannel, Transport, TransportEvent, TransportEventReceiver};
use arc_swap::ArcSwapOption;
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Formatter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::configuration::RTCConfiguration;

/// In-band message asking the remote peer to publish a new offer.
const RENEGOTIATE: &str = "renegotiate";

/// What to do with local candidates when a room operation runs after a previous round has
/// already created a message channel and published this session's candidates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RegatherPolicy {
    /// Don't gather (nor publish) candidates again. The remote peer keeps using the ones
    /// published before, which may be stale if the network path has changed.
    #[default]
    SkipWhenChannelExists,
    /// Always wait for a fresh set of local candidates.
    Always,
}

#[derive(Clone)]
pub struct Options {
    pub rtc_config: RTCConfiguration,
    /// Label of the message channel created by the offering side.
    pub channel_label: String,
    /// How long to wait for local candidate discovery to complete.
    pub gather_timeout: Duration,
    pub gather_interval: Duration,
    /// How often the room document is checked for an answer after publishing an offer.
    pub answer_poll_interval: Duration,
    /// Stop waiting for an answer after that time. `None` waits until the room is left.
    pub answer_timeout: Option<Duration>,
    /// Delay between requesting a renegotiation and picking up the new offer.
    pub renegotiation_delay: Duration,
    pub regather: RegatherPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            rtc_config: default_rtc_config(),
            channel_label: "pist".to_owned(),
            gather_timeout: Duration::from_secs(10),
            gather_interval: Duration::from_millis(200),
            answer_poll_interval: Duration::from_secs(2),
            answer_timeout: None,
            renegotiation_delay: Duration::from_secs(10),
            regather: RegatherPolicy::default(),
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("channel_label", &self.channel_label)
            .field("gather_timeout", &self.gather_timeout)
            .field("gather_interval", &self.gather_interval)
            .field("answer_poll_interval", &self.answer_poll_interval)
            .field("answer_timeout", &self.answer_timeout)
            .field("renegotiation_delay", &self.renegotiation_delay)
            .field("regather", &self.regather)
            .finish()
    }
}

/// Lifecycle of a [Connection]. Renegotiation happens on top of `Connected` and is reported by
/// [Connection::is_negotiating].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Uninitialized,
    /// Shared container is being resolved.
    Initializing,
    Ready,
    /// Publishing an offer. Stays in this state until the answer is picked up.
    Offering,
    Answering,
    /// Offer and answer have been exchanged.
    Connected,
    Closed,
}

/// Peer connection negotiated through room documents of a shared document store.
///
/// One side creates a room (publishes an offer and waits for an answer), the other joins it
/// (picks up the offer and publishes an answer). Local candidates of both sides are published
/// in the same room document, keyed by [Connection::session_id].
pub struct Connection<T: Transport = WebrtcTransport> {
    inner: Arc<Inner<T>>,
}

impl Connection<WebrtcTransport> {
    /// Starts a WebRTC peer connection signaled through GitHub Gists accessible with a given
    /// token. If `container_id` is not provided, the gist tagged as room container is looked up
    /// and created when missing.
    pub async fn connect(
        token: &str,
        container_id: Option<String>,
        options: Options,
    ) -> Result<Self, Error> {
        let store = GistStore::new(token).map_err(Error::initialization)?;
        let (events_tx, events_rx) = unbounded_channel();
        let transport = WebrtcTransport::start(options.rtc_config.clone(), events_tx)
            .await
            .map_err(Error::initialization)?;
        Self::initialize(Arc::new(store), transport, events_rx, container_id, options).await
    }
}

impl<T: Transport> Connection<T> {
    /// Resolves the shared container and starts processing `events` of the `transport`.
    ///
    /// Failure to resolve the container is terminal: the transport is closed and
    /// [Error::Initialization] returned.
    pub async fn initialize(
        store: Arc<dyn DocumentStore>,
        transport: T,
        events: TransportEventReceiver<T>,
        container_id: Option<String>,
        options: Options,
    ) -> Result<Self, Error> {
        let (state, _) = watch::channel(State::Initializing);
        let container_id = match container_id {
            Some(id) => id,
            None => match resolve_container(store.as_ref()).await {
                Ok(id) => id,
                Err(cause) => {
                    error!("failed to resolve shared container: {}", cause);
                    if let Err(e) = transport.close().await {
                        warn!("failed to close transport: {}", e);
                    }
                    return Err(Error::initialization(cause));
                }
            },
        };

        let inner = Arc::new(Inner {
            session_id: uuid::Uuid::new_v4().to_string(),
            container_id,
            store,
            transport,
            channel: ArcSwapOption::empty(),
            gatherer: CandidateGatherer::new(options.gather_interval),
            events: EventBus::new(),
            state,
            negotiating: AtomicBool::new(false),
            published: AtomicBool::new(false),
            room: ArcSwapOption::empty(),
            answer_poll: ArcSwapOption::empty(),
            shutdown: CancellationToken::new(),
            options,
        });
        tokio::spawn(dispatch(
            Arc::downgrade(&inner),
            events,
            inner.shutdown.clone(),
        ));
        inner.set_state(State::Ready);
        info!(
            "session {} ready, using container {}",
            inner.session_id, inner.container_id
        );
        Ok(Connection { inner })
    }

    /// Identifier under which this session publishes its candidates.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn container_id(&self) -> &str {
        &self.inner.container_id
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Receiver notified about every [State] transition.
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    pub fn is_negotiating(&self) -> bool {
        self.inner.negotiating.load(Ordering::Acquire)
    }

    /// Checks if a published offer is still waiting for its answer.
    pub fn is_awaiting_answer(&self) -> bool {
        match &*self.inner.answer_poll.load() {
            Some(token) => !token.is_cancelled(),
            None => false,
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Registers a listener of built-in ([event::OPEN], [event::CLOSE], [event::TRACK]) or
    /// application defined events. Messages of type `"renegotiate"` are consumed by the connection
    /// and never reach listeners.
    pub fn on<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&Event<T::RemoteTrack>) + Send + Sync + 'static,
    {
        self.inner.events.on(event_type, listener)
    }

    /// Sends an application event to the remote peer. Fails with [Error::ChannelNotOpen] if
    /// there's no open message channel. The `"renegotiate"` type is reserved and rejected with
    /// [Error::ReservedEventType].
    pub async fn send<D: Serialize>(&self, event_type: &str, data: D) -> Result<(), Error> {
        if event_type == RENEGOTIATE {
            return Err(Error::ReservedEventType(event_type.to_owned()));
        }
        let data = serde_json::to_value(data)?;
        self.inner.send(event_type, data).await
    }

    /// Publishes an offer in a given room, then waits in the background for an answer.
    pub async fn create_room(&self, room_id: &str) -> Result<(), Error> {
        Inner::create_room(&self.inner, room_id).await
    }

    /// Answers an offer published in a given room. Returns `false` if nobody created the room
    /// yet, leaving the room untouched.
    pub async fn join_room(&self, room_id: &str) -> Result<bool, Error> {
        Inner::join_room(&self.inner, room_id).await
    }

    /// Stops all background work and closes the message channel and transport. The connection
    /// can't be used afterwards.
    pub async fn leave_room(&self, room_id: &str) -> Result<(), Error> {
        self.inner.leave(room_id).await
    }

    pub async fn add_track(&self, track: T::LocalTrack) -> Result<T::Sender, Error> {
        self.inner.ensure_open()?;
        self.inner.transport.add_track(track).await
    }

    pub async fn remove_track(&self, sender: &T::Sender) -> Result<(), Error> {
        self.inner.ensure_open()?;
        self.inner.transport.remove_track(sender).await
    }

    /// Current content of a room document. A room which has never been written to is returned
    /// empty.
    pub async fn get_room(&self, room_id: &str) -> Result<Room, Error> {
        self.inner.get_room(room_id).await
    }

    /// Identifiers of all rooms present in the shared container.
    pub async fn rooms(&self) -> Result<Vec<String>, Error> {
        let container = self.inner.container().await?;
        let mut rooms: Vec<String> = container
            .files
            .keys()
            .filter_map(|name| room::room_id(name))
            .map(str::to_owned)
            .collect();
        rooms.sort();
        Ok(rooms)
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.inner.session_id)
            .field("container_id", &self.inner.container_id)
            .field("state", &self.inner.state())
            .finish()
    }
}

async fn resolve_container(store: &dyn DocumentStore) -> Result<String, Error> {
    let containers = store.list().await?;
    if let Some(container) = containers
        .into_iter()
        .find(|c| room::is_container(c.description.as_deref()))
    {
        debug!("found shared container {}", container.id);
        return Ok(container.id);
    }
    let id = store
        .create(room::default_container_payload(room::DEFAULT_ROOM_ID))
        .await?;
    info!("created shared container {}", id);
    Ok(id)
}

struct Inner<T: Transport> {
    session_id: String,
    container_id: String,
    store: Arc<dyn DocumentStore>,
    transport: T,
    channel: ArcSwapOption<T::Channel>,
    gatherer: CandidateGatherer,
    events: EventBus<Event<T::RemoteTrack>>,
    state: watch::Sender<State>,
    /// Guards against more than one renegotiation in flight.
    negotiating: AtomicBool,
    /// Set once local candidates of this session have been written to a room document.
    published: AtomicBool,
    /// Room of the latest create/join call.
    room: ArcSwapOption<String>,
    answer_poll: ArcSwapOption<CancellationToken>,
    /// Cancelled when the connection is closed or dropped. Parent of all background timers.
    shutdown: CancellationToken,
    options: Options,
}

impl<T: Transport> Inner<T> {
    fn state(&self) -> State {
        *self.state.borrow()
    }

    fn set_state(&self, state: State) {
        let old = self.state.send_replace(state);
        if old != state {
            debug!("session {}: {:?} -> {:?}", self.session_id, old, state);
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.shutdown.is_cancelled() || self.state() == State::Closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn has_channel(&self) -> bool {
        self.channel.load().is_some()
    }

    async fn send(&self, event_type: &str, data: serde_json::Value) -> Result<(), Error> {
        self.ensure_open()?;
        let channel = match self.channel.load_full() {
            Some(channel) if channel.is_open() => channel,
            _ => return Err(Error::ChannelNotOpen),
        };
        let envelope = Envelope {
            event_type: event_type.to_owned(),
            data,
        };
        channel.send_text(serde_json::to_string(&envelope)?).await
    }

    async fn create_room(this: &Arc<Self>, room_id: &str) -> Result<(), Error> {
        this.ensure_open()?;
        let previous = this.state();
        this.set_state(State::Offering);
        this.room.store(Some(Arc::new(room_id.to_owned())));
        match Self::offer(this, room_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("failed to create room '{}': {}", room_id, e);
                this.restore_state(State::Offering, previous);
                Err(e)
            }
        }
    }

    async fn offer(this: &Arc<Self>, room_id: &str) -> Result<(), Error> {
        let had_channel = this.has_channel();
        if !had_channel {
            // channel must exist before the offer is created, otherwise it's not a part of it
            let channel = this
                .transport
                .create_data_channel(&this.options.channel_label)
                .await?;
            this.channel.store(Some(channel));
        }
        let offer = this.transport.create_offer().await?;
        this.transport.set_local_description(offer.clone()).await?;
        let candidates = this.gather(had_channel).await?;

        let mut room = Room::empty(room_id);
        room.ice = this.own_ice(candidates);
        room.offer = Some(offer);
        this.publish(room_id, room).await?;
        info!("published offer in room '{}'", room_id);

        Self::watch_answer(this, room_id.to_owned());
        Ok(())
    }

    async fn join_room(this: &Arc<Self>, room_id: &str) -> Result<bool, Error> {
        this.ensure_open()?;
        let room = this.get_room(room_id).await?;
        let offer = match room.offer.clone() {
            Some(offer) => offer,
            None => {
                debug!("room '{}' has no offer to answer", room_id);
                return Ok(false);
            }
        };
        let previous = this.state();
        this.set_state(State::Answering);
        this.room.store(Some(Arc::new(room_id.to_owned())));
        match this.answer(room_id, room, offer).await {
            Ok(()) => {
                this.set_state(State::Connected);
                Ok(true)
            }
            Err(e) => {
                warn!("failed to join room '{}': {}", room_id, e);
                this.restore_state(State::Answering, previous);
                Err(e)
            }
        }
    }

    async fn answer(
        &self,
        room_id: &str,
        room: Room,
        offer: SessionDescription,
    ) -> Result<(), Error> {
        let had_channel = self.has_channel();
        self.transport.set_remote_description(offer).await?;
        self.apply_candidates(&room).await?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        let candidates = self.gather(had_channel).await?;

        let reply = Room {
            name: room.name,
            ice: self.own_ice(candidates),
            offer: room.offer,
            answer: Some(answer),
        };
        self.publish(room_id, reply).await?;
        info!("published answer in room '{}'", room_id);
        Ok(())
    }

    /// Gathers local candidates, or returns `None` if regathering is skipped by policy. Only
    /// a round which has already published its candidates counts as a previous round: a channel
    /// left behind by a failed attempt doesn't.
    async fn gather(&self, had_channel: bool) -> Result<Option<Vec<Candidate>>, Error> {
        if had_channel
            && self.published.load(Ordering::Acquire)
            && self.options.regather == RegatherPolicy::SkipWhenChannelExists
        {
            debug!("candidates already published, skipping candidate gathering");
            self.gatherer.clear().await;
            return Ok(None);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Closed),
            res = self.gatherer.gather(self.options.gather_timeout) => res.map(Some),
        }
    }

    fn own_ice(&self, candidates: Option<Vec<Candidate>>) -> Option<BTreeMap<String, Vec<Candidate>>> {
        let mut ice = BTreeMap::new();
        ice.insert(self.session_id.clone(), candidates?);
        Some(ice)
    }

    /// Applies candidates of the remote session(s). Must happen after the remote description
    /// has been set.
    async fn apply_candidates(&self, room: &Room) -> Result<(), Error> {
        let candidates = room.remote_candidates(&self.session_id);
        trace!("applying {} remote candidates", candidates.len());
        for candidate in candidates {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    fn restore_state(&self, expected: State, previous: State) {
        if self.state() == expected {
            self.set_state(previous);
        }
    }

    async fn container(&self) -> Result<crate::store::Container, Error> {
        self.store
            .get(&self.container_id)
            .await?
            .ok_or_else(|| Error::RoomSourceMissing(self.container_id.clone()))
    }

    async fn get_room(&self, room_id: &str) -> Result<Room, Error> {
        let name = room::room_name(room_id);
        let container = self.container().await?;
        match container.files.get(&name) {
            None => Ok(Room::empty(room_id)),
            Some(file) => {
                let bytes = self.store.fetch_file(file).await?;
                Ok(Room::decode(name, &bytes)?)
            }
        }
    }

    /// Writes a room produced by an offer/answer round and remembers if it carried local
    /// candidates.
    async fn publish(&self, room_id: &str, room: Room) -> Result<(), Error> {
        let has_ice = room.ice.is_some();
        self.update_room(room_id, room).await?;
        if has_ice {
            self.published.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Overwrites the room document, except for `ice` entries of sessions not present in
    /// `room`, which are kept.
    async fn update_room(&self, room_id: &str, mut room: Room) -> Result<(), Error> {
        let prior = self.get_room(room_id).await?;
        room.merge_ice(&prior);
        let patch = FilePatch::default().with_file(room.name.clone(), room.encode()?);
        self.store.update(&self.container_id, patch).await?;
        Ok(())
    }

    /// Polls the room in the background until its answer shows up. Replaces (and cancels) the
    /// poll of a previous offer.
    fn watch_answer(this: &Arc<Self>, room_id: String) {
        let token = this.shutdown.child_token();
        if let Some(previous) = this.answer_poll.swap(Some(Arc::new(token.clone()))) {
            previous.cancel();
        }
        let inner = Arc::downgrade(this);
        let period = this.options.answer_poll_interval;
        let deadline = this.options.answer_timeout;
        tokio::spawn(async move {
            let poll = poll_answer(inner, &room_id, period);
            let answered = tokio::select! {
                _ = token.cancelled() => {
                    debug!("stopped waiting for answer in room '{}'", room_id);
                    return;
                }
                answered = with_deadline(deadline, poll) => answered,
            };
            if !answered {
                warn!("room '{}' was not answered within {:?}", room_id, deadline);
            }
            token.cancel();
        });
    }

    /// Returns `true` once the answer has been applied.
    async fn accept_answer(&self, room_id: &str) -> Result<bool, Error> {
        let room = self.get_room(room_id).await?;
        let answer = match room.answer.clone() {
            Some(answer) => answer,
            None => return Ok(false),
        };
        self.transport.set_remote_description(answer).await?;
        self.apply_candidates(&room).await?;
        self.set_state(State::Connected);
        info!("received answer in room '{}'", room_id);
        Ok(true)
    }

    async fn leave(&self, room_id: &str) -> Result<(), Error> {
        if self.state() == State::Closed {
            return Ok(());
        }
        info!("session {} leaving room '{}'", self.session_id, room_id);
        // stops answer poll, renegotiation timer, pending gather and the event loop
        self.shutdown.cancel();
        self.gatherer.clear().await;

        let channel_closed = match self.channel.swap(None) {
            None => Ok(()),
            Some(channel) => {
                let was_open = channel.is_open();
                let res = channel.close().await;
                if was_open {
                    self.events.emit(event::CLOSE, &Event::Close);
                }
                res
            }
        };
        let transport_closed = self.transport.close().await;
        self.set_state(State::Closed);
        channel_closed.and(transport_closed)
    }

    /// Handles renegotiation requested by the transport: asks the remote peer for a new offer
    /// and picks it up after a delay. A request made while another one is in flight is dropped.
    async fn renegotiate(this: &Arc<Self>) {
        let state = this.state();
        if state != State::Connected {
            debug!("ignoring negotiation request in {:?} state", state);
            return;
        }
        if this
            .negotiating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("renegotiation already in flight, dropping request");
            return;
        }
        let room_id = match this.room.load_full() {
            Some(room_id) => room_id,
            None => {
                this.negotiating.store(false, Ordering::Release);
                return;
            }
        };
        if let Err(e) = this.send(RENEGOTIATE, serde_json::Value::Null).await {
            warn!("failed to request renegotiation: {}", e);
            this.negotiating.store(false, Ordering::Release);
            return;
        }
        info!("requested renegotiation of room '{}'", room_id);

        let token = this.shutdown.child_token();
        let delay = this.options.renegotiation_delay;
        let inner = Arc::downgrade(this);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    if let Some(inner) = inner.upgrade() {
                        match Self::join_room(&inner, &room_id).await {
                            Ok(true) => debug!("renegotiated room '{}'", room_id),
                            Ok(false) => warn!("room '{}' has no offer to renegotiate", room_id),
                            Err(e) => warn!("renegotiation of room '{}' failed: {}", room_id, e),
                        }
                    }
                }
            }
            if let Some(inner) = inner.upgrade() {
                inner.negotiating.store(false, Ordering::Release);
            }
        });
    }

    /// Remote peer asked for a new offer.
    fn renegotiate_requested(this: &Arc<Self>) {
        let room_id = match this.room.load_full() {
            Some(room_id) => room_id,
            None => {
                warn!("renegotiation requested before any room was created");
                return;
            }
        };
        let inner = Arc::downgrade(this);
        tokio::spawn(async move {
            let inner = match inner.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            if let Err(e) = Self::create_room(&inner, &room_id).await {
                warn!("failed to publish new offer in room '{}': {}", room_id, e);
            }
        });
    }

    fn receive(this: &Arc<Self>, text: &str) {
        match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) if envelope.event_type == RENEGOTIATE => {
                Self::renegotiate_requested(this)
            }
            Ok(envelope) => {
                let event_type = envelope.event_type;
                let delivered = this
                    .events
                    .emit(&event_type, &Event::Message(envelope.data));
                if delivered == 0 {
                    trace!("no listeners for '{}' message", event_type);
                }
            }
            Err(e) => warn!("dropping malformed message: {}", e),
        }
    }
}

async fn poll_answer<T: Transport>(inner: Weak<Inner<T>>, room_id: &str, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately, the answer can't be there yet
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        match inner.accept_answer(room_id).await {
            Ok(true) => return,
            Ok(false) => trace!("no answer in room '{}' yet", room_id),
            Err(e @ (Error::Http(_) | Error::StoreStatus { .. } | Error::Json(_))) => {
                warn!("failed to poll room '{}': {}", room_id, e)
            }
            Err(e) => {
                error!("stopped waiting for answer in room '{}': {}", room_id, e);
                return;
            }
        }
    }
}

/// Returns `false` if `fut` didn't complete before the deadline.
async fn with_deadline<F: std::future::Future<Output = ()>>(
    deadline: Option<Duration>,
    fut: F,
) -> bool {
    match deadline {
        Some(deadline) => timeout(deadline, fut).await.is_ok(),
        None => {
            fut.await;
            true
        }
    }
}

/// Routes transport notifications to the candidate gatherer and event listeners.
async fn dispatch<T: Transport>(
    inner: Weak<Inner<T>>,
    mut events: TransportEventReceiver<T>,
    shutdown: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => match received {
                Some(notification) => notification,
                None => break,
            },
        };
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        trace!("transport event: {:?}", notification);
        match notification {
            TransportEvent::Candidate(candidate) => inner.gatherer.push(candidate).await,
            TransportEvent::Channel(channel) => {
                // opening is reported separately by `ChannelOpen`
                debug!("received message channel '{}'", channel.label());
                inner.channel.store(Some(channel));
            }
            TransportEvent::ChannelOpen => {
                inner.events.emit(event::OPEN, &Event::Open);
            }
            TransportEvent::ChannelClose => {
                inner.events.emit(event::CLOSE, &Event::Close);
            }
            TransportEvent::Message(text) => Inner::receive(&inner, &text),
            TransportEvent::Track(track) => {
                inner.events.emit(event::TRACK, &Event::Track(track));
            }
            TransportEvent::NegotiationNeeded => Inner::renegotiate(&inner).await,
        }
    }
    trace!("transport event loop finished");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{MockChannel, MockTransport};
    use crate::room::{RoomStatus, DEFAULT_ROOM_ID};
    use crate::store::{Container, FileEntry, MemoryStore, NewContainer};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn options() -> Options {
        Options {
            gather_timeout: Duration::from_millis(500),
            gather_interval: Duration::from_millis(5),
            answer_poll_interval: Duration::from_millis(10),
            renegotiation_delay: Duration::from_secs(60),
            ..Options::default()
        }
    }

    async fn peer(
        store: &Arc<MemoryStore>,
        name: &str,
        container_id: Option<String>,
    ) -> Result<Connection<MockTransport>, Error> {
        let (transport, events) = MockTransport::new(name);
        Connection::initialize(store.clone(), transport, events, container_id, options()).await
    }

    async fn wait_for_state(conn: &Connection<MockTransport>, state: State) {
        let mut states = conn.subscribe_state();
        let reached = timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != state {
                if states.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(reached.is_ok(), "state {:?} was not reached", state);
        assert_eq!(conn.state(), state);
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        let res = timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(res.is_ok(), "condition not met in time");
    }

    fn candidate_values(candidates: &[Candidate]) -> Vec<String> {
        candidates.iter().map(|c| c.candidate.clone()).collect()
    }

    /// Store failing every request, as when the service is down.
    struct UnavailableStore;

    #[async_trait]
    impl DocumentStore for UnavailableStore {
        async fn list(&self) -> Result<Vec<Container>, Error> {
            Err(Error::StoreStatus {
                status: 503,
                url: "https://store/gists".to_owned(),
            })
        }

        async fn get(&self, _: &str) -> Result<Option<Container>, Error> {
            self.list().await.map(|_| None)
        }

        async fn create(&self, _: NewContainer) -> Result<String, Error> {
            self.list().await.map(|_| String::new())
        }

        async fn update(&self, _: &str, _: FilePatch) -> Result<String, Error> {
            self.list().await.map(|_| String::new())
        }

        async fn fetch_file(&self, _: &FileEntry) -> Result<Bytes, Error> {
            self.list().await.map(|_| Bytes::new())
        }
    }

    #[tokio::test]
    async fn initialization_creates_and_reuses_container() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        assert_eq!(a.state(), State::Ready);
        assert_eq!(a.rooms().await?, vec![DEFAULT_ROOM_ID.to_owned()]);

        // second peer discovers the tagged container instead of creating a new one
        let b = peer(&store, "b", None).await?;
        assert_eq!(a.container_id(), b.container_id());
        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(store.list().await?.len(), 1);

        let c = peer(&store, "c", Some(a.container_id().to_owned())).await?;
        assert_eq!(c.container_id(), a.container_id());
        Ok(())
    }

    #[tokio::test]
    async fn initialization_fails_when_store_is_unavailable() {
        let (transport, events) = MockTransport::new("a");
        let closed = transport.closed.clone();
        let res = Connection::initialize(
            Arc::new(UnavailableStore),
            transport,
            events,
            None,
            options(),
        )
        .await;

        match res {
            Err(Error::Initialization(cause)) => {
                assert!(matches!(*cause, Error::StoreStatus { status: 503, .. }))
            }
            other => panic!("expected initialization error, got {:?}", other),
        }
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_room_is_empty() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;

        let room = a.get_room("never-created").await?;
        assert_eq!(room, Room::empty("never-created"));
        assert!(room.ice.is_none());
        assert_eq!(room.status(), RoomStatus::Unclaimed);
        Ok(())
    }

    #[tokio::test]
    async fn deleted_container_is_reported() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        assert!(store.remove(a.container_id()).await);

        let res = a.get_room("x").await;
        assert!(matches!(res, Err(Error::RoomSourceMissing(id)) if id == a.container_id()));

        // per-room errors don't invalidate the connection
        let res = a.join_room("x").await;
        assert!(matches!(res, Err(Error::RoomSourceMissing(_))));
        assert_eq!(a.state(), State::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn create_room_publishes_offer() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        a.create_room("x").await?;

        let room = a.get_room("x").await?;
        assert_eq!(room.status(), RoomStatus::AwaitingAnswer);
        assert_eq!(room.offer, Some(SessionDescription::offer("offer:a:1")));
        let ice = room.ice.unwrap();
        assert_eq!(ice.len(), 1);
        assert_eq!(
            candidate_values(&ice[a.session_id()]),
            vec!["a-0", "a-1"]
        );

        assert_eq!(a.state(), State::Offering);
        assert!(a.is_awaiting_answer());
        assert_eq!(a.transport().channel().unwrap().label(), "pist");
        Ok(())
    }

    #[tokio::test]
    async fn join_room_answers_and_offerer_picks_answer_up() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        let b = peer(&store, "b", None).await?;

        a.create_room("x").await?;
        assert!(b.join_room("x").await?);
        assert_eq!(b.state(), State::Connected);

        let room = b.get_room("x").await?;
        assert_eq!(room.status(), RoomStatus::Complete);
        assert_eq!(room.answer, Some(SessionDescription::answer("answer:b:1")));
        let ice = room.ice.unwrap();
        assert_eq!(candidate_values(&ice[a.session_id()]), vec!["a-0", "a-1"]);
        assert_eq!(candidate_values(&ice[b.session_id()]), vec!["b-0", "b-1"]);

        // answerer applied the offer and offerer's candidates only
        assert_eq!(
            b.transport().remote(),
            vec![SessionDescription::offer("offer:a:1")]
        );
        assert_eq!(b.transport().applied(), vec!["a-0", "a-1"]);

        wait_for_state(&a, State::Connected).await;
        wait_until(|| !a.is_awaiting_answer()).await;
        assert_eq!(
            a.transport().remote(),
            vec![SessionDescription::answer("answer:b:1")]
        );
        assert_eq!(a.transport().applied(), vec!["b-0", "b-1"]);
        Ok(())
    }

    #[tokio::test]
    async fn joining_unclaimed_room_leaves_store_untouched() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let b = peer(&store, "b", None).await?;

        assert!(!b.join_room("y").await?);
        assert_eq!(b.state(), State::Ready);
        assert!(store
            .file(b.container_id(), &room::room_name("y"))
            .await
            .is_none());
        assert_eq!(
            store
                .file(b.container_id(), &room::room_name(DEFAULT_ROOM_ID))
                .await
                .as_deref(),
            Some("{}")
        );
        assert!(b.transport().remote().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn gather_timeout_is_recoverable() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        a.transport().emit_candidates.store(false, Ordering::SeqCst);

        let res = a.create_room("x").await;
        assert!(matches!(res, Err(Error::GatherTimeout(_))));
        assert_eq!(a.state(), State::Ready);
        assert_eq!(a.get_room("x").await?.status(), RoomStatus::Unclaimed);

        // discovery finishes after the deadline
        for candidate in MockTransport::candidates("a") {
            a.transport().trigger(TransportEvent::Candidate(Some(candidate)));
        }
        a.transport().trigger(TransportEvent::Candidate(None));

        // channel of the failed attempt doesn't count as a previous round
        a.create_room("x").await?;
        let room = a.get_room("x").await?;
        assert_eq!(room.offer, Some(SessionDescription::offer("offer:a:2")));
        let ice = room.ice.unwrap();
        assert_eq!(candidate_values(&ice[a.session_id()]), vec!["a-0", "a-1"]);

        // once published, following rounds skip gathering and keep the entry
        a.create_room("x").await?;
        let room = a.get_room("x").await?;
        assert_eq!(room.offer, Some(SessionDescription::offer("offer:a:3")));
        let ice = room.ice.unwrap();
        assert_eq!(candidate_values(&ice[a.session_id()]), vec!["a-0", "a-1"]);
        Ok(())
    }

    #[tokio::test]
    async fn regather_policy_always_republishes_candidates() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let (transport, events) = MockTransport::new("a");
        let options = Options {
            regather: RegatherPolicy::Always,
            ..options()
        };
        let a = Connection::initialize(store.clone(), transport, events, None, options).await?;

        a.create_room("x").await?;
        a.create_room("x").await?;

        let room = a.get_room("x").await?;
        assert_eq!(room.offer, Some(SessionDescription::offer("offer:a:2")));
        let ice = room.ice.unwrap();
        assert_eq!(candidate_values(&ice[a.session_id()]), vec!["a-0", "a-1"]);
        assert_eq!(a.transport().local.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn messages_are_dispatched_by_type() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;

        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            a.on("hello", move |e| {
                if let Event::Message(data) = e {
                    received.lock().unwrap().push(data.clone());
                }
            });
        }
        let opened = Arc::new(AtomicBool::new(false));
        {
            let opened = opened.clone();
            a.on(event::OPEN, move |_| opened.store(true, Ordering::SeqCst));
        }

        let res = a.send("hello", "too early").await;
        assert!(matches!(res, Err(Error::ChannelNotOpen)));

        a.create_room("x").await?;
        wait_until(|| opened.load(Ordering::SeqCst)).await;

        a.send("hello", serde_json::json!({"n": 1})).await?;
        let sent = a.transport().channel().unwrap().sent();
        assert_eq!(sent, vec![serde_json::json!({"type": "hello", "data": {"n": 1}})]);

        a.transport().trigger(TransportEvent::Message(
            r#"{"type":"hello","data":"world"}"#.to_owned(),
        ));
        a.transport()
            .trigger(TransportEvent::Message("not json".to_owned()));
        wait_until(|| !received.lock().unwrap().is_empty()).await;
        assert_eq!(*received.lock().unwrap(), vec![serde_json::json!("world")]);
        Ok(())
    }

    #[tokio::test]
    async fn remote_channel_is_reported_open_once() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let b = peer(&store, "b", None).await?;

        let opened = Arc::new(AtomicUsize::new(0));
        {
            let opened = opened.clone();
            b.on(event::OPEN, move |_| {
                opened.fetch_add(1, Ordering::SeqCst);
            });
        }
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            b.on("done", move |_| done.store(true, Ordering::SeqCst));
        }

        // channel arrives already open, then its open notification follows
        let channel = Arc::new(MockChannel::open("pist"));
        b.transport().trigger(TransportEvent::Channel(channel.clone()));
        b.transport().trigger(TransportEvent::ChannelOpen);
        b.transport()
            .trigger(TransportEvent::Message(r#"{"type":"done"}"#.to_owned()));
        wait_until(|| done.load(Ordering::SeqCst)).await;

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        b.send("hello", 1).await?;
        assert_eq!(
            channel.sent(),
            vec![serde_json::json!({"type": "hello", "data": 1})]
        );
        Ok(())
    }

    #[tokio::test]
    async fn renegotiate_event_type_is_reserved() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        a.create_room("x").await?;

        let res = a.send(RENEGOTIATE, serde_json::Value::Null).await;
        assert!(matches!(res, Err(Error::ReservedEventType(t)) if t == "renegotiate"));
        let channel = a.transport().channel().unwrap();
        assert!(channel.sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_connection_releases_transport() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        a.create_room("x").await?;
        let released = a.transport().released.clone();

        a.transport().trigger(TransportEvent::Message(
            r#"{"type":"renegotiate","data":null}"#.to_owned(),
        ));
        drop(a);
        wait_until(|| released.load(Ordering::SeqCst)).await;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_renegotiation_sends_single_request() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        let b = peer(&store, "b", None).await?;
        a.create_room("x").await?;
        assert!(b.join_room("x").await?);
        wait_for_state(&a, State::Connected).await;

        a.transport().trigger(TransportEvent::NegotiationNeeded);
        a.transport().trigger(TransportEvent::NegotiationNeeded);

        let channel = a.transport().channel().unwrap();
        wait_until(|| !channel.sent().is_empty()).await;
        sleep(Duration::from_millis(50)).await;

        let sent = channel.sent();
        assert_eq!(
            sent,
            vec![serde_json::json!({"type": "renegotiate", "data": null})]
        );
        assert!(a.is_negotiating());
        Ok(())
    }

    #[tokio::test]
    async fn negotiation_request_before_connection_is_ignored() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        a.create_room("x").await?;

        a.transport().trigger(TransportEvent::NegotiationNeeded);
        sleep(Duration::from_millis(50)).await;

        assert!(!a.is_negotiating());
        assert!(a.transport().channel().unwrap().sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn renegotiation_request_publishes_new_offer() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        let b = peer(&store, "b", None).await?;
        a.create_room("x").await?;
        assert!(b.join_room("x").await?);
        wait_for_state(&a, State::Connected).await;

        a.transport().trigger(TransportEvent::Message(
            r#"{"type":"renegotiate","data":null}"#.to_owned(),
        ));
        wait_for_state(&a, State::Offering).await;
        wait_until(|| a.is_awaiting_answer()).await;

        let room = a.get_room("x").await?;
        assert_eq!(room.status(), RoomStatus::AwaitingAnswer);
        assert_eq!(room.offer, Some(SessionDescription::offer("offer:a:2")));
        // channel already exists: nothing regathered, previous entries are kept
        let ice = room.ice.unwrap();
        assert_eq!(candidate_values(&ice[a.session_id()]), vec!["a-0", "a-1"]);
        assert_eq!(candidate_values(&ice[b.session_id()]), vec!["b-0", "b-1"]);

        // answering again completes the new round
        assert!(b.join_room("x").await?);
        wait_for_state(&a, State::Connected).await;
        assert_eq!(
            a.transport().remote().last(),
            Some(&SessionDescription::answer("answer:b:2"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn leave_room_stops_background_work() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;
        let closed = Arc::new(AtomicBool::new(false));
        {
            let closed = closed.clone();
            a.on(event::CLOSE, move |_| closed.store(true, Ordering::SeqCst));
        }
        a.create_room("x").await?;
        assert!(a.is_awaiting_answer());

        a.leave_room("x").await?;
        assert_eq!(a.state(), State::Closed);
        assert!(!a.is_awaiting_answer());
        assert!(closed.load(Ordering::SeqCst));
        assert!(!a.transport().channel().unwrap().is_open());
        assert!(a.transport().closed.load(Ordering::SeqCst));

        assert!(matches!(a.create_room("x").await, Err(Error::Closed)));
        assert!(matches!(a.join_room("x").await, Err(Error::Closed)));
        assert!(matches!(
            a.add_track("audio".to_owned()).await,
            Err(Error::Closed)
        ));
        // leaving twice is fine
        a.leave_room("x").await?;
        Ok(())
    }

    #[tokio::test]
    async fn tracks_pass_through_to_transport() -> Result<(), Error> {
        let store = Arc::new(MemoryStore::new());
        let a = peer(&store, "a", None).await?;

        let sender = a.add_track("camera".to_owned()).await?;
        assert_eq!(sender, "sender:camera");
        a.remove_track(&sender).await?;

        let tracks = Arc::new(Mutex::new(Vec::new()));
        {
            let tracks = tracks.clone();
            a.on(event::TRACK, move |e| {
                if let Event::Track(track) = e {
                    tracks.lock().unwrap().push(track.clone());
                }
            });
        }
        a.transport()
            .trigger(TransportEvent::Track("remote-camera".to_owned()));
        wait_until(|| !tracks.lock().unwrap().is_empty()).await;
        assert_eq!(*tracks.lock().unwrap(), vec!["remote-camera".to_owned()]);
        Ok(())
    }
}
