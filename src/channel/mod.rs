//! Channel module - request/reply/dump/event correlation
//!
//! Pairs outbound requests with the reply kinds they expect, manages
//! multi-reply dump streams, and routes unsolicited events to
//! subscribers:
//! - `send` - single request/reply exchange
//! - `dump` - request followed by a finite stream of detail replies
//! - `subscribe_events` - want-toggle plus asynchronous event delivery
//! - `verify_module_version` - compatibility gate per module
//!
//! Every exchange is tracked by its own pending record keyed by a u32
//! correlation context; completion of one exchange never blocks or
//! reorders another. A reply arriving after its exchange timed out or
//! was cancelled is dropped, not delivered.

mod transport;

pub use transport::{
    InboundFrame, LoopbackPeer, LoopbackTransport, ModuleVersion, OutboundFrame, Transport,
};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec::{self, CodecError, Record, Value};
use crate::config::ExchangeConfig;
use crate::registry::Registry;
use crate::schema::{MessageKind, MessageSchema};

/// Exchange errors
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("message '{0}' is not registered")]
    UnknownMessage(String),

    #[error("module '{0}' is not registered")]
    UnknownModule(String),

    #[error("message '{message}' is a {kind}, expected a {expected}")]
    WrongKind {
        message: String,
        kind: MessageKind,
        expected: MessageKind,
    },

    /// The dataplane's CRC for this module disagrees with the linked
    /// schemas; traffic for the module is rejected before transmission
    #[error("module '{module}' failed version verification against the dataplane")]
    VersionMismatch { module: String },

    /// No reply within the deadline. The dataplane operation's actual
    /// outcome is unknown - indeterminate, not failed.
    #[error("no reply to '{message}' within {timeout_ms} ms, outcome indeterminate")]
    Timeout { message: String, timeout_ms: u64 },

    /// The reply decoded fine but its result field reports a failure;
    /// the numeric code is preserved for the caller to interpret
    #[error("'{message}' returned application error code {code}")]
    Application { message: String, code: i32 },

    #[error("expected reply '{expected}', dataplane sent '{got}'")]
    UnexpectedReply { expected: String, got: String },

    #[error("encoded payload of {len} bytes exceeds maximum {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("channel closed")]
    Closed,
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Pending exchange, owned by the map until its resolution
enum Pending {
    /// Awaiting a single reply
    Single {
        reply: String,
        tx: oneshot::Sender<ChannelResult<Record>>,
    },
    /// Streaming detail replies until the end-of-dump signal
    Stream {
        details: String,
        tx: mpsc::Sender<ChannelResult<Record>>,
    },
}

type PendingMap = Arc<Mutex<HashMap<u32, Pending>>>;
type SubscriberMap = Arc<Mutex<HashMap<String, Vec<(Uuid, mpsc::Sender<Record>)>>>>;

/// Correlated exchange channel to one dataplane
///
/// Cheap to share behind an `Arc`; any number of exchanges may be in
/// flight concurrently.
pub struct Channel {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    config: ExchangeConfig,
    pending: PendingMap,
    subscribers: SubscriberMap,
    blocked: HashSet<String>,
    next_context: AtomicU32,
    demux: JoinHandle<()>,
}

impl Channel {
    /// Create a channel over a connected transport
    ///
    /// Verifies every registered module against the module table the
    /// dataplane announced; mismatched modules are blocked until the
    /// schemas are regenerated.
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundFrame>,
        registry: Arc<Registry>,
        config: ExchangeConfig,
    ) -> Self {
        let blocked = verify_modules(&registry, &transport.module_versions());

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let demux = tokio::spawn(demux_loop(
            inbound,
            Arc::clone(&pending),
            Arc::clone(&subscribers),
            Arc::clone(&registry),
        ));

        Self {
            transport,
            registry,
            config,
            pending,
            subscribers,
            blocked,
            next_context: AtomicU32::new(1),
            demux,
        }
    }

    /// The schema registry this channel encodes and decodes with
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Check a module's wire compatibility with the dataplane
    pub fn verify_module_version(&self, module: &str) -> ChannelResult<()> {
        if self.registry.module(module).is_none() {
            return Err(ChannelError::UnknownModule(module.to_string()));
        }
        if self.blocked.contains(module) {
            return Err(ChannelError::VersionMismatch {
                module: module.to_string(),
            });
        }
        Ok(())
    }

    /// Single request/reply exchange with the default deadline
    pub async fn send(&self, message: &str, body: Record) -> ChannelResult<Record> {
        self.send_with_timeout(
            message,
            body,
            Duration::from_millis(self.config.reply_timeout_ms),
        )
        .await
    }

    /// Single request/reply exchange
    ///
    /// Resolves to the decoded reply, or `Application` when the reply's
    /// result field is non-zero, or `Timeout` when the deadline passes.
    pub async fn send_with_timeout(
        &self,
        message: &str,
        body: Record,
        timeout: Duration,
    ) -> ChannelResult<Record> {
        let schema = self.request_schema(message)?;
        let reply_name = format!("{message}_reply");
        self.expect_kind(&reply_name, MessageKind::Reply)?;

        let payload = self.encode_checked(&body, &schema)?;
        let context = self.allocate_context();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            context,
            Pending::Single {
                reply: reply_name,
                tx,
            },
        );

        debug!(message, context, "Sending request");
        if let Err(e) = self
            .transport
            .transmit(OutboundFrame {
                message: message.to_string(),
                context,
                multipart: false,
                payload,
            })
            .await
        {
            lock(&self.pending).remove(&context);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                // A reply landing after this point finds no pending
                // entry and is dropped by the demux task
                lock(&self.pending).remove(&context);
                Err(ChannelError::Timeout {
                    message: message.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Streaming exchange with the default dump deadline
    pub async fn dump(&self, message: &str, body: Record) -> ChannelResult<DumpStream> {
        self.dump_with_timeout(
            message,
            body,
            Duration::from_millis(self.config.dump_timeout_ms),
        )
        .await
    }

    /// Streaming exchange: one request, a finite sequence of details
    ///
    /// The stream ends when the dataplane signals end-of-dump or the
    /// deadline elapses. It is not restartable; re-enumerating requires
    /// a fresh dump request.
    pub async fn dump_with_timeout(
        &self,
        message: &str,
        body: Record,
        timeout: Duration,
    ) -> ChannelResult<DumpStream> {
        let schema = self.request_schema(message)?;
        let base = message.strip_suffix("_dump").unwrap_or(message);
        let details_name = format!("{base}_details");
        self.expect_kind(&details_name, MessageKind::Reply)?;

        let payload = self.encode_checked(&body, &schema)?;
        let context = self.allocate_context();
        let (tx, rx) = mpsc::channel(self.config.dump_buffer);
        lock(&self.pending).insert(
            context,
            Pending::Stream {
                details: details_name,
                tx,
            },
        );

        debug!(message, context, "Sending dump request");
        if let Err(e) = self
            .transport
            .transmit(OutboundFrame {
                message: message.to_string(),
                context,
                multipart: true,
                payload,
            })
            .await
        {
            lock(&self.pending).remove(&context);
            return Err(e.into());
        }

        Ok(DumpStream {
            rx,
            deadline: tokio::time::Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
            context,
            message: message.to_string(),
            pending: Arc::clone(&self.pending),
            done: false,
        })
    }

    /// Enable and receive a class of unsolicited events
    ///
    /// The subscriber is registered before the want-toggle request goes
    /// out, so no event emitted after the toggle is missed. Delivery to
    /// one subscriber preserves dataplane emission order.
    pub async fn subscribe_events(
        &self,
        event: &str,
        toggle: &str,
        toggle_body: Record,
    ) -> ChannelResult<EventSubscription> {
        self.expect_kind(event, MessageKind::Event)?;

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        lock(&self.subscribers)
            .entry(event.to_string())
            .or_default()
            .push((id, tx));

        match self.send(toggle, toggle_body).await {
            Ok(_) => {
                debug!(event, %id, "Event subscription enabled");
                Ok(EventSubscription {
                    id,
                    event: event.to_string(),
                    rx,
                    subscribers: Arc::clone(&self.subscribers),
                })
            }
            Err(e) => {
                remove_subscriber(&self.subscribers, event, id);
                Err(e)
            }
        }
    }

    fn request_schema(&self, message: &str) -> ChannelResult<Arc<MessageSchema>> {
        let schema = self
            .registry
            .lookup_by_name(message)
            .ok_or_else(|| ChannelError::UnknownMessage(message.to_string()))?;
        if schema.kind != MessageKind::Request {
            return Err(ChannelError::WrongKind {
                message: message.to_string(),
                kind: schema.kind,
                expected: MessageKind::Request,
            });
        }
        if let Some(module) = self.registry.module_of(message) {
            if self.blocked.contains(module) {
                return Err(ChannelError::VersionMismatch {
                    module: module.to_string(),
                });
            }
        }
        Ok(Arc::clone(schema))
    }

    fn expect_kind(&self, message: &str, expected: MessageKind) -> ChannelResult<()> {
        let schema = self
            .registry
            .lookup_by_name(message)
            .ok_or_else(|| ChannelError::UnknownMessage(message.to_string()))?;
        if schema.kind != expected {
            return Err(ChannelError::WrongKind {
                message: message.to_string(),
                kind: schema.kind,
                expected,
            });
        }
        Ok(())
    }

    fn encode_checked(
        &self,
        body: &Record,
        schema: &MessageSchema,
    ) -> ChannelResult<bytes::Bytes> {
        let payload = codec::encode(body, schema)?;
        if payload.len() > self.config.max_payload {
            return Err(ChannelError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload,
            });
        }
        Ok(payload)
    }

    fn allocate_context(&self) -> u32 {
        // Context zero is reserved for unsolicited events
        loop {
            let context = self.next_context.fetch_add(1, Ordering::Relaxed);
            if context != 0 {
                return context;
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// Finite, non-restartable sequence of dump detail records
pub struct DumpStream {
    rx: mpsc::Receiver<ChannelResult<Record>>,
    deadline: tokio::time::Instant,
    timeout_ms: u64,
    context: u32,
    message: String,
    pending: PendingMap,
    done: bool,
}

impl DumpStream {
    /// Next detail item; `None` once the dump completed
    ///
    /// A malformed individual item is yielded as an `Err` without
    /// ending the stream - inbound frames delimit items, so one bad
    /// payload does not obscure the next item's boundary.
    pub async fn next(&mut self) -> Option<ChannelResult<Record>> {
        if self.done {
            return None;
        }
        match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
            Ok(Some(item)) => Some(item),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(_) => {
                self.done = true;
                lock(&self.pending).remove(&self.context);
                Some(Err(ChannelError::Timeout {
                    message: self.message.clone(),
                    timeout_ms: self.timeout_ms,
                }))
            }
        }
    }

    /// Drain the stream, failing on the first error item
    pub async fn collect(mut self) -> ChannelResult<Vec<Record>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl Drop for DumpStream {
    fn drop(&mut self) {
        // Cancellation: release the pending record so a late detail or
        // terminator is dropped instead of delivered
        lock(&self.pending).remove(&self.context);
    }
}

/// Live event subscription; dropping it stops local delivery
pub struct EventSubscription {
    id: Uuid,
    event: String,
    rx: mpsc::Receiver<Record>,
    subscribers: SubscriberMap,
}

impl EventSubscription {
    /// Event message name this subscription receives
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Next event record, in dataplane emission order
    pub async fn next(&mut self) -> Option<Record> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        remove_subscriber(&self.subscribers, &self.event, self.id);
    }
}

fn remove_subscriber(subscribers: &SubscriberMap, event: &str, id: Uuid) {
    let mut map = lock(subscribers);
    if let Some(list) = map.get_mut(event) {
        list.retain(|(existing, _)| *existing != id);
        if list.is_empty() {
            map.remove(event);
        }
    }
}

/// Compare registered modules against the dataplane's announced table
fn verify_modules(registry: &Registry, announced: &[ModuleVersion]) -> HashSet<String> {
    let table: HashMap<&str, &ModuleVersion> = announced
        .iter()
        .map(|version| (version.module.as_str(), version))
        .collect();

    let mut blocked = HashSet::new();
    for module in registry.modules() {
        match table.get(module.name.as_str()) {
            None => {
                warn!(
                    module = %module.name,
                    "Dataplane does not announce module, blocking its messages"
                );
                blocked.insert(module.name.clone());
            }
            Some(peer) if peer.crc != module.module_crc => {
                warn!(
                    module = %module.name,
                    local_crc = %format_args!("{:#010x}", module.module_crc),
                    peer_crc = %format_args!("{:#010x}", peer.crc),
                    local_version = %module.api_version,
                    peer_version = %peer.api_version,
                    "Module CRC mismatch, blocking its messages"
                );
                blocked.insert(module.name.clone());
            }
            Some(peer) => {
                debug!(
                    module = %module.name,
                    version = %peer.api_version,
                    "Module version verified"
                );
            }
        }
    }
    blocked
}

async fn demux_loop(
    mut inbound: mpsc::Receiver<InboundFrame>,
    pending: PendingMap,
    subscribers: SubscriberMap,
    registry: Arc<Registry>,
) {
    while let Some(frame) = inbound.recv().await {
        if frame.context != 0 {
            route_exchange(frame, &pending, &registry).await;
        } else {
            route_event(frame, &subscribers, &registry);
        }
    }

    // Transport gone: resolve whatever is still in flight
    let drained: Vec<Pending> = lock(&pending).drain().map(|(_, entry)| entry).collect();
    for entry in drained {
        if let Pending::Single { tx, .. } = entry {
            let _ = tx.send(Err(ChannelError::Closed));
        }
        // Dropping a Stream sender ends its dump stream
    }
}

async fn route_exchange(frame: InboundFrame, pending: &PendingMap, registry: &Arc<Registry>) {
    let entry = lock(pending).remove(&frame.context);
    let Some(entry) = entry else {
        trace!(
            context = frame.context,
            message = %frame.message,
            "Reply for unknown or timed-out exchange, dropping"
        );
        return;
    };

    match entry {
        Pending::Single { reply, tx } => {
            let result = if frame.message == reply {
                decode_reply(&frame, registry)
            } else {
                Err(ChannelError::UnexpectedReply {
                    expected: reply,
                    got: frame.message.clone(),
                })
            };
            if tx.send(result).is_err() {
                trace!(context = frame.context, "Caller gone before reply delivery");
            }
        }
        Pending::Stream { details, tx } => {
            if frame.end_of_dump {
                debug!(context = frame.context, "Dump complete");
                return; // dropping tx closes the stream
            }
            if frame.message != details {
                trace!(
                    got = %frame.message,
                    expected = %details,
                    "Unexpected message inside dump, dropping"
                );
                lock(pending).insert(frame.context, Pending::Stream { details, tx });
                return;
            }
            let item = decode_reply(&frame, registry);
            if tx.send(item).await.is_err() || tx.is_closed() {
                debug!(context = frame.context, "Dump consumer gone, discarding stream");
                return;
            }
            lock(pending).insert(frame.context, Pending::Stream { details, tx });
        }
    }
}

fn route_event(frame: InboundFrame, subscribers: &SubscriberMap, registry: &Arc<Registry>) {
    let Some(schema) = registry.lookup_by_name(&frame.message) else {
        trace!(message = %frame.message, "Unregistered event, dropping");
        return;
    };
    if schema.kind != MessageKind::Event {
        trace!(message = %frame.message, "Zero-context frame is not an event, dropping");
        return;
    }

    let senders: Vec<mpsc::Sender<Record>> = lock(subscribers)
        .get(&frame.message)
        .map(|list| list.iter().map(|(_, tx)| tx.clone()).collect())
        .unwrap_or_default();
    if senders.is_empty() {
        trace!(message = %frame.message, "No subscriber for event, dropping");
        return;
    }

    let record = match codec::decode(&frame.payload, schema) {
        Ok(record) => record,
        Err(e) => {
            warn!(message = %frame.message, error = %e, "Malformed event payload, dropping");
            return;
        }
    };
    for tx in senders {
        if tx.try_send(record.clone()).is_err() {
            warn!(message = %frame.message, "Subscriber lagging or gone, dropping event");
        }
    }
}

/// Decode an inbound reply or detail frame and interpret its result
/// field: non-zero means the transport exchange succeeded but the
/// logical operation failed
fn decode_reply(frame: &InboundFrame, registry: &Arc<Registry>) -> ChannelResult<Record> {
    let schema = registry
        .lookup_by_name(&frame.message)
        .ok_or_else(|| ChannelError::UnknownMessage(frame.message.clone()))?;
    let record = codec::decode(&frame.payload, schema)?;
    if let Some(code) = record.get("retval").and_then(Value::as_i64) {
        if code != 0 {
            return Err(ChannelError::Application {
                message: frame.message.clone(),
                code: code as i32,
            });
        }
    }
    Ok(record)
}

/// Poison-tolerant lock: a panicked holder cannot leave exchanges stuck
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
