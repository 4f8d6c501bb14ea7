//! Transport seam
//!
//! Byte delivery is out of scope here; the exchange layer only needs a
//! way to hand frames to the dataplane and a stream of inbound frames
//! back. Frames carry the message name and correlation context
//! out-of-band - the payload itself has no type tag.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Frame handed to the transport for delivery
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Registered message name
    pub message: String,
    /// Correlation token for the exchange
    pub context: u32,
    /// Whether a stream of detail replies is expected
    pub multipart: bool,
    /// Encoded message body
    pub payload: Bytes,
}

/// Frame delivered by the transport
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Registered message name; empty on a bare end-of-dump sentinel
    pub message: String,
    /// Correlation token of the originating request, zero for events
    pub context: u32,
    /// Terminates the dump stream for `context`
    pub end_of_dump: bool,
    /// Encoded message body
    pub payload: Bytes,
}

impl InboundFrame {
    /// A reply or detail frame for an in-flight exchange
    pub fn reply(message: impl Into<String>, context: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            message: message.into(),
            context,
            end_of_dump: false,
            payload: payload.into(),
        }
    }

    /// An unsolicited event frame
    pub fn event(message: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            message: message.into(),
            context: 0,
            end_of_dump: false,
            payload: payload.into(),
        }
    }

    /// The end-of-dump sentinel for a streaming exchange
    pub fn end_of_dump(context: u32) -> Self {
        Self {
            message: String::new(),
            context,
            end_of_dump: true,
            payload: Bytes::new(),
        }
    }
}

/// Module version announced by the dataplane at connection setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleVersion {
    pub module: String,
    pub api_version: String,
    pub crc: u32,
}

/// Outbound half of the wire
///
/// Implementations queue frames for delivery and expose the module
/// table the dataplane announced during connection setup. Inbound
/// frames arrive on the mpsc receiver given to the channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue one frame for delivery to the dataplane
    async fn transmit(&self, frame: OutboundFrame) -> std::io::Result<()>;

    /// Module table announced by the dataplane
    fn module_versions(&self) -> Vec<ModuleVersion>;
}

/// In-memory transport for tests and demos
///
/// The peer half plays the dataplane: it receives whatever the channel
/// transmits and injects replies, details and events.
pub struct LoopbackTransport {
    versions: Vec<ModuleVersion>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl LoopbackTransport {
    /// Create a loopback pair announcing the given module table
    pub fn new(versions: Vec<ModuleVersion>) -> (std::sync::Arc<Self>, LoopbackPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let transport = std::sync::Arc::new(Self {
            versions,
            outbound: outbound_tx,
        });
        let peer = LoopbackPeer {
            requests: outbound_rx,
            replies: inbound_tx,
            inbound: Some(inbound_rx),
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn transmit(&self, frame: OutboundFrame) -> std::io::Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed"))
    }

    fn module_versions(&self) -> Vec<ModuleVersion> {
        self.versions.clone()
    }
}

/// The dataplane half of a loopback pair
pub struct LoopbackPeer {
    /// Frames the channel transmitted
    pub requests: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Sender for frames going back to the channel
    pub replies: mpsc::Sender<InboundFrame>,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
}

impl LoopbackPeer {
    /// Take the inbound receiver to hand to the channel (once)
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound.take()
    }
}
