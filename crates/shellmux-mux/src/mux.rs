use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use shellmux_frame::{
    FrameConfig, FrameError, Transport, TransportRx, TransportTx, DEFAULT_MAX_PAYLOAD,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{inbound, Capacity, Channel, ChannelMode, InboundRx, InboundTx, Subscription};
use crate::error::{MuxError, Result};
use crate::message::{envelope_len, validate_name, Message, MessageKind};

static NEXT_MUX_ID: AtomicU64 = AtomicU64::new(1);

/// Multiplexer tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Default in-flight limit for bounded channels, and the inbound limit
    /// for credited traffic on channels not opened bounded locally. Both
    /// endpoints should agree on it. Default: 64.
    pub channel_capacity: usize,
    /// Shared queue between bounded publishers and the writer task. Default: 256.
    pub outbound_capacity: usize,
    /// Largest frame accepted or produced, envelope included. Default: 16 MiB.
    pub max_payload_size: usize,
    /// How long `close` keeps flushing queued messages. Default: 1s.
    pub flush_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            outbound_capacity: 256,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            flush_timeout: Duration::from_secs(1),
        }
    }
}

impl MuxConfig {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MuxState {
    Open,
    ClosedLocally,
    Disconnected(String),
}

impl MuxState {
    fn error(&self) -> Option<MuxError> {
        match self {
            MuxState::Open => None,
            MuxState::ClosedLocally => Some(MuxError::MultiplexerClosed),
            MuxState::Disconnected(reason) => Some(MuxError::ConnectionClosed(reason.clone())),
        }
    }
}

/// Local bookkeeping for one channel name.
struct Slot {
    /// `None` while inbound traffic arrived before any local `open_channel`.
    channel: Option<Channel>,
    /// Parked receiver for a pending slot, handed to the channel on adoption.
    pending_rx: Option<InboundRx>,
    /// Dropped when the peer closes the channel or the multiplexer shuts down.
    inbound_tx: Option<InboundTx>,
    last_inbound_seq: u64,
}

impl Slot {
    fn pending(name: &str, credit_tx: &mpsc::UnboundedSender<Bytes>) -> Self {
        let (tx, rx) = inbound(name, credit_tx.clone());
        Self {
            channel: None,
            pending_rx: Some(rx),
            inbound_tx: Some(tx),
            last_inbound_seq: 0,
        }
    }
}

struct Shared {
    id: u64,
    config: MuxConfig,
    slots: Mutex<HashMap<String, Slot>>,
    state: watch::Sender<MuxState>,
    /// Set once the writer has finished with the transport.
    flushed: watch::Sender<bool>,
    data_tx: mpsc::Sender<Bytes>,
    /// Unbounded channels and returned credits.
    priority_tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

impl Shared {
    fn check_open(&self) -> Result<()> {
        match self.state.borrow().error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn closed_error(&self) -> MuxError {
        self.state
            .borrow()
            .error()
            .unwrap_or(MuxError::MultiplexerClosed)
    }

    /// Record the first close cause. Later causes are ignored.
    fn mark_closed(&self, cause: MuxState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == MuxState::Open {
                *state = cause;
                true
            } else {
                false
            }
        })
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Many named, typed channels over one transport to one peer.
///
/// Two background tasks own the transport: a reader that demultiplexes
/// inbound frames into per-channel buffers, and a writer that drains a
/// priority lane (unbounded channels) ahead of the shared data lane
/// (bounded channels). Order is preserved per channel, not across channels.
///
/// Must be created inside a tokio runtime. Dropping the multiplexer closes it.
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Start multiplexing over `io`.
    pub fn new<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let frame_config = FrameConfig::default().with_max_payload_size(config.max_payload_size);
        let (rx, tx) = Transport::with_config(io, &frame_config).into_split();

        let (data_tx, data_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(MuxState::Open);
        let (flushed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: NEXT_MUX_ID.fetch_add(1, Ordering::Relaxed),
            config,
            slots: Mutex::new(HashMap::new()),
            state,
            flushed,
            data_tx,
            priority_tx,
            cancel: CancellationToken::new(),
        });

        debug!(mux = shared.id, "multiplexer started");
        tokio::spawn(read_loop(Arc::clone(&shared), rx));
        tokio::spawn(write_loop(Arc::clone(&shared), tx, priority_rx, data_rx));

        Self { shared }
    }

    /// Identifier used in log fields.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Open `name` in `mode` with the default bounded capacity.
    pub fn open_channel(&self, name: &str, mode: ChannelMode) -> Result<Channel> {
        self.open_channel_with(
            name,
            mode,
            Capacity::Bounded(self.shared.config.channel_capacity),
        )
    }

    /// Open `name` in `mode` with an explicit capacity.
    ///
    /// Reopening with the same mode returns the existing channel (the
    /// original capacity is kept); a different mode is a `ChannelConflict`.
    pub fn open_channel_with(
        &self,
        name: &str,
        mode: ChannelMode,
        capacity: Capacity,
    ) -> Result<Channel> {
        validate_name(name)?;

        let mut slots = self.shared.lock_slots();
        // Checked under the slot lock: the reader marks the state and clears
        // senders while holding it.
        self.shared.check_open()?;

        let slot = slots
            .entry(name.to_owned())
            .or_insert_with(|| Slot::pending(name, &self.shared.priority_tx));
        if let Some(existing) = &slot.channel {
            if existing.mode() != mode {
                return Err(MuxError::ChannelConflict {
                    name: name.to_owned(),
                    existing: existing.mode(),
                    requested: mode,
                });
            }
            return Ok(existing.clone());
        }

        let rx = match slot.pending_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = inbound(name, self.shared.priority_tx.clone());
                slot.inbound_tx = Some(tx);
                rx
            }
        };
        let channel = Channel::new(self.shared.id, name.to_owned(), mode, capacity, rx);
        slot.channel = Some(channel.clone());
        debug!(mux = self.shared.id, channel = name, %mode, ?capacity, "channel opened");
        Ok(channel)
    }

    /// Publish a data message. Returns its sequence number.
    ///
    /// Suspends while a bounded channel has its full capacity unconsumed on
    /// the far side.
    pub async fn publish(&self, channel: &Channel, payload: impl Into<Bytes>) -> Result<u64> {
        self.send(channel, MessageKind::Data, None, payload.into(), "publish")
            .await
    }

    /// Publish a control-kind message.
    pub async fn publish_control(
        &self,
        channel: &Channel,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        self.send(channel, MessageKind::Control, None, payload.into(), "publish")
            .await
    }

    /// Tell the peer nothing more will be published on `channel`.
    ///
    /// The remote subscription ends after it drains what it already holds.
    /// Later publishes on this channel fail with `ChannelClosed`.
    pub async fn close_channel(&self, channel: &Channel) -> Result<()> {
        self.send(channel, MessageKind::Close, None, Bytes::new(), "close")
            .await?;
        channel
            .state
            .closed
            .store(true, Ordering::Release);
        Ok(())
    }

    /// Take the channel's inbound stream.
    ///
    /// Only one subscription may exist at a time.
    pub fn subscribe(&self, channel: &Channel) -> Result<Subscription> {
        self.check_owner(channel)?;
        if !channel.mode().can_subscribe() {
            return Err(direction(channel, "subscribe"));
        }
        self.shared.check_open()?;
        let guard = Arc::clone(&channel.state.inbound)
            .try_lock_owned()
            .map_err(|_| MuxError::AlreadySubscribed(channel.name().to_owned()))?;
        Ok(Subscription::new(channel.name().to_owned(), guard))
    }

    /// Send a request and wait for the reply that names it in `reply_to`.
    ///
    /// Replies to earlier requests that already timed out are discarded.
    /// Concurrent requests on one channel are served one after another, all
    /// within their own timeout.
    pub async fn request(
        &self,
        channel: &Channel,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        self.check_owner(channel)?;
        if channel.mode() != ChannelMode::Request {
            return Err(direction(channel, "request"));
        }
        let payload = payload.into();

        let exchange = async {
            let mut inbound = channel.state.inbound.lock().await;
            let seq = self
                .send(channel, MessageKind::Data, None, payload, "request")
                .await?;
            loop {
                let Some(reply) = inbound.recv().await else {
                    self.shared.check_open()?;
                    return Err(MuxError::ChannelClosed(channel.name().to_owned()));
                };
                match reply.reply_to {
                    Some(id) if id == seq => return Ok(reply),
                    other => {
                        debug!(
                            mux = self.shared.id,
                            channel = channel.name(),
                            expected = seq,
                            reply_to = ?other,
                            "discarding stale reply"
                        );
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::Timeout(timeout)),
        }
    }

    /// Answer `request` on a reply-mode channel.
    pub async fn reply(
        &self,
        channel: &Channel,
        request: &Message,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        if channel.mode() != ChannelMode::Reply {
            return Err(direction(channel, "reply"));
        }
        self.send(
            channel,
            MessageKind::Data,
            Some(request.seq),
            payload.into(),
            "reply",
        )
        .await
    }

    /// Close every channel and release the transport.
    ///
    /// Queued outbound messages are flushed first (bounded by
    /// `MuxConfig::flush_timeout`). Idempotent.
    pub fn close(&self) {
        if self.shared.mark_closed(MuxState::ClosedLocally) {
            info!(mux = self.shared.id, "multiplexer closing");
        }
        self.shared.cancel.cancel();
    }

    /// Close, then wait until queued messages reach the transport (or the
    /// flush gives up). Use before exiting a process that just said goodbye.
    pub async fn shutdown(&self) {
        self.close();
        let mut flushed = self.shared.flushed.subscribe();
        let budget = self.shared.config.flush_timeout + Duration::from_millis(100);
        let _ = tokio::time::timeout(budget, flushed.wait_for(|done| *done)).await;
    }

    /// True once closed locally or disconnected.
    pub fn is_closed(&self) -> bool {
        *self.shared.state.borrow() != MuxState::Open
    }

    /// Wait until the multiplexer is closed for any reason and return the
    /// error later operations will report.
    pub async fn closed(&self) -> MuxError {
        let mut state = self.shared.state.subscribe();
        loop {
            if let Some(err) = state.borrow_and_update().error() {
                return err;
            }
            if state.changed().await.is_err() {
                return MuxError::MultiplexerClosed;
            }
        }
    }

    fn check_owner(&self, channel: &Channel) -> Result<()> {
        if channel.state.mux_id != self.shared.id {
            return Err(MuxError::ForeignChannel);
        }
        Ok(())
    }

    async fn send(
        &self,
        channel: &Channel,
        kind: MessageKind,
        reply_to: Option<u64>,
        payload: Bytes,
        operation: &'static str,
    ) -> Result<u64> {
        self.check_owner(channel)?;
        if !channel.mode().can_send() {
            return Err(direction(channel, operation));
        }
        if channel.is_closed() {
            return Err(MuxError::ChannelClosed(channel.name().to_owned()));
        }
        let size = envelope_len(channel.name(), payload.len());
        if size > self.shared.config.max_payload_size {
            return Err(MuxError::PayloadTooLarge {
                size,
                max: self.shared.config.max_payload_size,
            });
        }
        self.shared.check_open()?;

        let mut seq_guard = channel.state.send_seq.lock().await;
        let seq = *seq_guard + 1;
        // Close never sits in the peer's buffer, so it costs no credit.
        let credited = channel.state.credits.is_some() && kind != MessageKind::Close;
        let frame = Message {
            channel: channel.name().to_owned(),
            seq,
            reply_to,
            kind,
            credited,
            payload,
        }
        .encode();

        match &channel.state.credits {
            Some(credits) => {
                let credit = if credited {
                    tokio::select! {
                        credit = Arc::clone(credits).acquire_owned() => {
                            Some(credit.map_err(|_| MuxError::MultiplexerClosed)?)
                        }
                        _ = self.shared.cancel.cancelled() => return Err(self.shared.closed_error()),
                    }
                } else {
                    None
                };
                tokio::select! {
                    sent = self.shared.data_tx.send(frame) => {
                        sent.map_err(|_| self.shared.closed_error())?
                    }
                    _ = self.shared.cancel.cancelled() => return Err(self.shared.closed_error()),
                }
                // Spent until the peer consumes the message and hands it back.
                if let Some(credit) = credit {
                    credit.forget();
                }
            }
            None => self
                .shared
                .priority_tx
                .send(frame)
                .map_err(|_| self.shared.closed_error())?,
        }

        *seq_guard = seq;
        Ok(seq)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("id", &self.shared.id)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

fn direction(channel: &Channel, operation: &'static str) -> MuxError {
    MuxError::Direction {
        name: channel.name().to_owned(),
        mode: channel.mode(),
        operation,
    }
}

async fn read_loop<T>(shared: Arc<Shared>, mut rx: TransportRx<T>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let cause = loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break MuxState::ClosedLocally,
            frame = rx.receive() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => {
                break MuxState::Disconnected("peer closed the connection".into())
            }
            Err(err) => {
                warn!(mux = shared.id, error = %err, "unrecoverable framing error");
                break MuxState::Disconnected(err.to_string());
            }
        };
        match Message::decode(frame) {
            Ok(message) => {
                if let Err(reason) = dispatch(&shared, message) {
                    warn!(mux = shared.id, %reason, "peer broke flow control");
                    break MuxState::Disconnected(reason);
                }
            }
            Err(err) => warn!(mux = shared.id, error = %err, "dropping undecodable message"),
        }
    };

    let mut slots = shared.lock_slots();
    if shared.mark_closed(cause.clone()) {
        info!(mux = shared.id, cause = ?cause, "multiplexer disconnected");
    }
    for slot in slots.values_mut() {
        slot.inbound_tx = None;
    }
    drop(slots);
    shared.cancel.cancel();
}

/// Route one inbound message. An error means the peer overran a channel
/// and the connection has to go.
fn dispatch(shared: &Shared, message: Message) -> std::result::Result<(), String> {
    let mut slots = shared.lock_slots();

    if message.kind == MessageKind::Credit {
        let channel = slots.get(&message.channel).and_then(|slot| slot.channel.as_ref());
        match (channel, message.credit_count()) {
            (Some(channel), Some(count)) => channel.return_credits(count),
            (None, _) => debug!(mux = shared.id, channel = %message.channel, "credit for unknown channel"),
            (_, None) => warn!(mux = shared.id, channel = %message.channel, "malformed credit"),
        }
        return Ok(());
    }

    let slot = slots
        .entry(message.channel.clone())
        .or_insert_with(|| Slot::pending(&message.channel, &shared.priority_tx));

    if message.seq <= slot.last_inbound_seq {
        warn!(
            mux = shared.id,
            channel = %message.channel,
            seq = message.seq,
            last = slot.last_inbound_seq,
            "rejecting out-of-order or duplicate message"
        );
        return Ok(());
    }
    if message.seq > slot.last_inbound_seq + 1 {
        warn!(
            mux = shared.id,
            channel = %message.channel,
            seq = message.seq,
            expected = slot.last_inbound_seq + 1,
            "sequence gap"
        );
    }
    slot.last_inbound_seq = message.seq;

    if message.kind == MessageKind::Close {
        debug!(mux = shared.id, channel = %message.channel, "peer closed channel");
        slot.inbound_tx = None;
        return Ok(());
    }

    if let Some(channel) = &slot.channel {
        if !channel.mode().can_receive() {
            warn!(
                mux = shared.id,
                channel = %message.channel,
                mode = %channel.mode(),
                "dropping message for send-only channel"
            );
            refund(shared, &message);
            return Ok(());
        }
    }

    let limit = match slot.channel.as_ref().map(Channel::capacity) {
        Some(Capacity::Bounded(n)) => Some(n.max(1)),
        _ if message.credited => Some(shared.config.channel_capacity.max(1)),
        _ => None,
    };

    match &slot.inbound_tx {
        Some(tx) => {
            if let Some(limit) = limit {
                if tx.queued() >= limit {
                    return Err(format!(
                        "peer overran channel '{}' ({limit} messages unconsumed)",
                        message.channel
                    ));
                }
            }
            if let Err(message) = tx.push(message) {
                debug!(mux = shared.id, "inbound receiver gone");
                refund(shared, &message);
            }
        }
        None => {
            debug!(
                mux = shared.id,
                channel = %message.channel,
                "dropping message for closed channel"
            );
            refund(shared, &message);
        }
    }
    Ok(())
}

/// Hand back the credit of a message that will never be consumed.
fn refund(shared: &Shared, message: &Message) {
    if message.credited {
        let _ = shared
            .priority_tx
            .send(Message::credit(&message.channel, 1).encode());
    }
}

async fn write_loop<T>(
    shared: Arc<Shared>,
    mut tx: TransportTx<T>,
    mut priority_rx: mpsc::UnboundedReceiver<Bytes>,
    mut data_rx: mpsc::Receiver<Bytes>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = priority_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            _ = shared.cancel.cancelled() => break,
        };
        if let Err(err) = tx.send(frame).await {
            warn!(mux = shared.id, error = %err, "transport write failed");
            shared.mark_closed(MuxState::Disconnected(err.to_string()));
            shared.cancel.cancel();
            shared.flushed.send_replace(true);
            return;
        }
    }

    // Closing: flush what publishers already queued, priority first.
    priority_rx.close();
    data_rx.close();
    let flush = async {
        while let Some(frame) = priority_rx.recv().await {
            tx.feed(frame).await?;
        }
        while let Some(frame) = data_rx.recv().await {
            tx.feed(frame).await?;
        }
        tx.close().await
    };
    match tokio::time::timeout(shared.config.flush_timeout, flush).await {
        Ok(Ok(())) => debug!(mux = shared.id, "transport flushed and closed"),
        Ok(Err(err)) => debug!(mux = shared.id, error = %err, "flush on close failed"),
        Err(_) => warn!(mux = shared.id, "flush on close timed out"),
    }
    shared.flushed.send_replace(true);
}
