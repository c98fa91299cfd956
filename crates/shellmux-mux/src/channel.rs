use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, Semaphore};

use crate::message::Message;

/// Direction of a channel, seen from the side that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelMode {
    Publish,
    Subscribe,
    Request,
    Reply,
    StreamIn,
    StreamOut,
}

impl ChannelMode {
    /// Whether this side may publish on the channel.
    pub fn can_send(self) -> bool {
        matches!(
            self,
            ChannelMode::Publish | ChannelMode::Request | ChannelMode::Reply | ChannelMode::StreamOut
        )
    }

    /// Whether inbound messages are accepted on the channel.
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            ChannelMode::Subscribe | ChannelMode::Request | ChannelMode::Reply | ChannelMode::StreamIn
        )
    }

    /// Whether `subscribe` is allowed. Request channels receive only through `request`.
    pub fn can_subscribe(self) -> bool {
        matches!(
            self,
            ChannelMode::Subscribe | ChannelMode::Reply | ChannelMode::StreamIn
        )
    }

    /// The mode the other endpoint opens for the same channel name.
    pub fn peer_mode(self) -> ChannelMode {
        match self {
            ChannelMode::Publish => ChannelMode::Subscribe,
            ChannelMode::Subscribe => ChannelMode::Publish,
            ChannelMode::Request => ChannelMode::Reply,
            ChannelMode::Reply => ChannelMode::Request,
            ChannelMode::StreamIn => ChannelMode::StreamOut,
            ChannelMode::StreamOut => ChannelMode::StreamIn,
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelMode::Publish => "publish",
            ChannelMode::Subscribe => "subscribe",
            ChannelMode::Request => "request",
            ChannelMode::Reply => "reply",
            ChannelMode::StreamIn => "stream-in",
            ChannelMode::StreamOut => "stream-out",
        };
        f.write_str(name)
    }
}

/// How many of a channel's messages may be in flight between the publisher
/// and the consumer on the far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Publishers suspend once `n` messages are unconsumed. The receiving
    /// side buffers at most `n` and treats more as a protocol violation.
    Bounded(usize),
    /// Never blocks; rides the priority lane. Keep to small control messages.
    Unbounded,
}

/// Buffer for messages the reader has accepted but nobody consumed yet.
pub(crate) fn inbound(
    name: &str,
    credit_tx: mpsc::UnboundedSender<Bytes>,
) -> (InboundTx, InboundRx) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (
        InboundTx {
            tx,
            queued: Arc::clone(&queued),
        },
        InboundRx {
            name: name.to_owned(),
            rx,
            queued,
            credit_tx,
        },
    )
}

/// Reader's end of an inbound buffer.
pub(crate) struct InboundTx {
    tx: mpsc::UnboundedSender<Message>,
    queued: Arc<AtomicUsize>,
}

impl InboundTx {
    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Hands the message back if the receiving end is gone.
    pub(crate) fn push(&self, message: Message) -> std::result::Result<(), Message> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.tx.send(message).map_err(|err| {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            err.0
        })
    }
}

/// Consumer's end of an inbound buffer. Taking a credited message out
/// returns its credit to the peer.
pub(crate) struct InboundRx {
    name: String,
    rx: mpsc::UnboundedReceiver<Message>,
    queued: Arc<AtomicUsize>,
    credit_tx: mpsc::UnboundedSender<Bytes>,
}

impl InboundRx {
    pub(crate) async fn recv(&mut self) -> Option<Message> {
        let message = self.rx.recv().await?;
        Some(self.consumed(message))
    }

    pub(crate) fn try_recv(&mut self) -> Option<Message> {
        let message = self.rx.try_recv().ok()?;
        Some(self.consumed(message))
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        let message = ready!(self.rx.poll_recv(cx));
        Poll::Ready(message.map(|message| self.consumed(message)))
    }

    fn consumed(&self, message: Message) -> Message {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        if message.credited {
            // Fails only once the multiplexer is gone, when credits no longer matter.
            let _ = self.credit_tx.send(Message::credit(&self.name, 1).encode());
        }
        message
    }
}

/// Handle to a named channel on one multiplexer.
///
/// Clones refer to the same logical channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) state: Arc<ChannelState>,
}

pub(crate) struct ChannelState {
    pub(crate) mux_id: u64,
    pub(crate) name: String,
    pub(crate) mode: ChannelMode,
    pub(crate) capacity: Capacity,
    /// Last sequence number handed out; held across enqueue so queue order
    /// matches sequence order.
    pub(crate) send_seq: Mutex<u64>,
    pub(crate) credits: Option<Arc<Semaphore>>,
    pub(crate) closed: AtomicBool,
    pub(crate) inbound: Arc<Mutex<InboundRx>>,
    queued: Arc<AtomicUsize>,
}

impl Channel {
    pub(crate) fn new(
        mux_id: u64,
        name: String,
        mode: ChannelMode,
        capacity: Capacity,
        inbound: InboundRx,
    ) -> Self {
        let credits = match capacity {
            Capacity::Bounded(n) => Some(Arc::new(Semaphore::new(n.max(1)))),
            Capacity::Unbounded => None,
        };
        let queued = Arc::clone(&inbound.queued);
        Self {
            state: Arc::new(ChannelState {
                mux_id,
                name,
                mode,
                capacity,
                send_seq: Mutex::new(0),
                credits,
                closed: AtomicBool::new(false),
                inbound: Arc::new(Mutex::new(inbound)),
                queued,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn mode(&self) -> ChannelMode {
        self.state.mode
    }

    pub fn capacity(&self) -> Capacity {
        self.state.capacity
    }

    /// True once `close_channel` has been called locally.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Inbound messages received but not consumed yet.
    pub fn queued(&self) -> usize {
        self.state.queued.load(Ordering::Acquire)
    }

    /// Credits the peer handed back; never more than were spent.
    pub(crate) fn return_credits(&self, count: u32) {
        if let (Some(credits), Capacity::Bounded(n)) = (&self.state.credits, self.state.capacity) {
            let spent = n.max(1).saturating_sub(credits.available_permits());
            credits.add_permits((count as usize).min(spent));
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.state.name)
            .field("mode", &self.state.mode)
            .field("capacity", &self.state.capacity)
            .finish()
    }
}

/// Exclusive, ordered view of a channel's inbound messages.
///
/// Ends when the peer closes the channel or the multiplexer shuts down,
/// after everything already buffered has been yielded. Dropping it lets
/// another subscriber take over the remaining messages.
pub struct Subscription {
    name: String,
    rx: OwnedMutexGuard<InboundRx>,
}

impl Subscription {
    pub(crate) fn new(name: String, rx: OwnedMutexGuard<InboundRx>) -> Self {
        Self { name, rx }
    }

    /// Next message, or `None` once the channel has ended.
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Self::next`].
    pub fn try_next(&mut self) -> Option<Message> {
        self.rx.try_recv()
    }

    pub fn channel_name(&self) -> &str {
        &self.name
    }
}

impl futures_core::Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.name)
            .finish()
    }
}
