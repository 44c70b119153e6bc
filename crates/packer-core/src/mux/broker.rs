//! Stream broker over one physical connection.
//!
//! A reader task decodes inbound frames and routes them through the stream
//! table; a writer task serialises every outbound frame. Frames queued before
//! the broker closes or is dropped are still written. Each logical stream
//! goes through `Dial`/`Accept`:
//!
//! ```text
//! dialer                       acceptor
//!   Syn(id) ------------------->  (pending until accept(id))
//!           <------------------- Ack(id)
//!   Data/Fin <================> Data/Fin
//!   Window   <================> Window
//! ```
//!
//! `Window` frames return send credit as the reading side consumes data, so a
//! stream never has more than [`MuxConfig::STREAM_WINDOW`](crate::config::MuxConfig::STREAM_WINDOW) bytes in flight.

use super::frame::{read_frame, write_frame, Frame, FrameKind};
use super::stream::{MuxStream, SendWindow};
use crate::{PluginError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which end of the physical connection this broker sits on.
///
/// The roles split the id space so that nested ids allocated concurrently by
/// the two peers never collide: the client allocates odd ids, the server even.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    /// The side that dialed the physical connection (the core).
    Client,
    /// The side that accepted it (the plugin process).
    Server,
}

/// Multiplexes logical duplex streams over a single connection.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct MuxBroker {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    table: Mutex<StreamTable>,
    outbound: mpsc::UnboundedSender<Outbound>,
    next_id: AtomicU32,
    next_token: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    role: BrokerRole,
}

/// Work for the writer task.
enum Outbound {
    Frame(Frame),
    /// Write nothing further and shut the connection down.
    Shutdown,
}

#[derive(Default)]
struct StreamTable {
    closed: bool,
    slots: HashMap<u32, Slot>,
}

struct Slot {
    token: u64,
    window: Arc<SendWindow>,
    state: SlotState,
}

enum SlotState {
    Dialing {
        ack: oneshot::Sender<()>,
        data: mpsc::UnboundedSender<Bytes>,
    },
    Listening {
        syn: oneshot::Sender<()>,
        data: mpsc::UnboundedSender<Bytes>,
    },
    SynReceived,
    Established {
        data: mpsc::UnboundedSender<Bytes>,
    },
}

impl MuxBroker {
    /// Wrap a connected transport and start the reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T>(conn: T, role: BrokerRole) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(conn);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let first_id = match role {
            BrokerRole::Client => 1,
            BrokerRole::Server => 2,
        };

        let shared = Arc::new(Shared {
            table: Mutex::new(StreamTable::default()),
            outbound,
            next_id: AtomicU32::new(first_id),
            next_token: AtomicU64::new(1),
            reader: Mutex::new(None),
            role,
        });

        let reader_task = tokio::spawn(read_loop(reader, Arc::downgrade(&shared)));
        *shared.reader.lock() = Some(reader_task);
        // The writer owns the receiving end and exits once every sender is
        // gone or a shutdown is queued, so it is never aborted.
        tokio::spawn(write_loop(writer, outbound_rx, Arc::downgrade(&shared)));

        debug!("Mux broker started ({:?} role)", role);
        Self { shared }
    }

    /// Open stream `id` and wait for the peer to accept it.
    pub async fn dial(&self, id: u32) -> Result<MuxStream> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let window = SendWindow::new();

        let token = {
            let mut table = self.shared.table.lock();
            if table.closed {
                return Err(PluginError::BrokerClosed);
            }
            if table.slots.contains_key(&id) {
                return Err(PluginError::StreamExists(id));
            }
            let token = self.shared.new_token();
            table.slots.insert(
                id,
                Slot {
                    token,
                    window: window.clone(),
                    state: SlotState::Dialing {
                        ack: ack_tx,
                        data: data_tx,
                    },
                },
            );
            if let Err(e) = self.shared.send(Frame::control(id, FrameKind::Syn)) {
                table.slots.remove(&id);
                return Err(e);
            }
            token
        };

        let half_open = HalfOpen::new(&self.shared, id, token);
        match ack_rx.await {
            Ok(()) => {
                half_open.disarm();
                debug!("Dialed mux stream {}", id);
                Ok(MuxStream::new(id, token, data_rx, window, self.shared.clone()))
            }
            Err(_) if self.is_closed() => Err(PluginError::BrokerClosed),
            Err(_) => Err(PluginError::transport(format!(
                "peer refused stream {id}"
            ))),
        }
    }

    /// Wait for the peer to dial stream `id`, consuming an early `Syn` if one
    /// already arrived.
    pub async fn accept(&self, id: u32) -> Result<MuxStream> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let (waiter, token, window) = {
            let mut table = self.shared.table.lock();
            if table.closed {
                return Err(PluginError::BrokerClosed);
            }
            match table.slots.remove(&id) {
                Some(Slot {
                    token,
                    window,
                    state: SlotState::SynReceived,
                }) => {
                    table.slots.insert(
                        id,
                        Slot {
                            token,
                            window: window.clone(),
                            state: SlotState::Established { data: data_tx },
                        },
                    );
                    (None, token, window)
                }
                Some(slot) => {
                    table.slots.insert(id, slot);
                    return Err(PluginError::StreamExists(id));
                }
                None => {
                    let (syn_tx, syn_rx) = oneshot::channel();
                    let token = self.shared.new_token();
                    let window = SendWindow::new();
                    table.slots.insert(
                        id,
                        Slot {
                            token,
                            window: window.clone(),
                            state: SlotState::Listening {
                                syn: syn_tx,
                                data: data_tx,
                            },
                        },
                    );
                    (Some(syn_rx), token, window)
                }
            }
        };

        if let Some(syn_rx) = waiter {
            let half_open = HalfOpen::new(&self.shared, id, token);
            if syn_rx.await.is_err() {
                return Err(if self.is_closed() {
                    PluginError::BrokerClosed
                } else {
                    PluginError::transport(format!("stream {id} was abandoned"))
                });
            }
            half_open.disarm();
        }

        self.shared.send(Frame::control(id, FrameKind::Ack))?;
        debug!("Accepted mux stream {}", id);
        Ok(MuxStream::new(id, token, data_rx, window, self.shared.clone()))
    }

    /// Allocate a fresh stream id for a nested session.
    pub fn next_id(&self) -> u32 {
        self.shared.next_id.fetch_add(2, Ordering::SeqCst)
    }

    /// Close the physical connection and every logical stream.
    ///
    /// Pending `dial`/`accept` calls fail with `BrokerClosed` and open
    /// streams read EOF. Frames already queued are written before the
    /// connection shuts down. Calling this more than once is harmless.
    pub fn close(&self) {
        self.shared.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.table.lock().closed
    }

    /// Streams that are open or still waiting in `dial`/`accept`.
    pub fn open_streams(&self) -> usize {
        self.shared.table.lock().slots.len()
    }

    pub fn role(&self) -> BrokerRole {
        self.shared.role
    }
}

impl fmt::Debug for MuxBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.shared.table.lock();
        f.debug_struct("MuxBroker")
            .field("role", &self.shared.role)
            .field("closed", &table.closed)
            .field("streams", &table.slots.len())
            .finish()
    }
}

impl Shared {
    fn new_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| PluginError::BrokerClosed)
    }

    /// Whether the stream identified by `(id, token)` is still open.
    pub(crate) fn is_live(&self, id: u32, token: u64) -> bool {
        let table = self.table.lock();
        !table.closed
            && matches!(
                table.slots.get(&id),
                Some(Slot { token: t, state: SlotState::Established { .. }, .. }) if *t == token
            )
    }

    /// Local close of one stream: drop its slot and tell the peer.
    pub(crate) fn release(&self, id: u32, token: u64) {
        let mut table = self.table.lock();
        let owned = matches!(table.slots.get(&id), Some(slot) if slot.token == token);
        if owned {
            if let Some(slot) = table.slots.remove(&id) {
                slot.window.close();
            }
            if !table.closed {
                let _ = self.send(Frame::control(id, FrameKind::Fin));
            }
        }
    }

    /// Drop the slot of a `dial`/`accept` that gave up before returning a
    /// stream. The peer is told unless it never dialed.
    fn abandon(&self, id: u32, token: u64) {
        let mut table = self.table.lock();
        let owned = matches!(table.slots.get(&id), Some(slot) if slot.token == token);
        if !owned {
            return;
        }
        if let Some(slot) = table.slots.remove(&id) {
            slot.window.close();
            let listening = matches!(slot.state, SlotState::Listening { .. });
            if !listening && !table.closed {
                let _ = self.send(Frame::control(id, FrameKind::Fin));
            }
            debug!("Abandoned mux stream {}", id);
        }
    }

    /// Return `credit` consumed bytes of stream `(id, token)` to the peer.
    pub(crate) fn grant(&self, id: u32, token: u64, credit: usize) {
        if self.is_live(id, token) {
            let credit = u32::try_from(credit).unwrap_or(u32::MAX);
            let _ = self.send(Frame::window(id, credit));
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let id = frame.stream_id;
        let mut table = self.table.lock();
        if table.closed {
            return;
        }

        match frame.kind {
            FrameKind::Syn => match table.slots.remove(&id) {
                None => {
                    let token = self.new_token();
                    table.slots.insert(
                        id,
                        Slot {
                            token,
                            window: SendWindow::new(),
                            state: SlotState::SynReceived,
                        },
                    );
                }
                Some(Slot {
                    token,
                    window,
                    state: SlotState::Listening { syn, data },
                }) => {
                    table.slots.insert(
                        id,
                        Slot {
                            token,
                            window,
                            state: SlotState::Established { data },
                        },
                    );
                    let _ = syn.send(());
                }
                Some(slot) => {
                    table.slots.insert(id, slot);
                    warn!("Refusing Syn for live mux stream {}", id);
                    let _ = self.send(Frame::control(id, FrameKind::Fin));
                }
            },
            FrameKind::Ack => match table.slots.remove(&id) {
                Some(Slot {
                    token,
                    window,
                    state: SlotState::Dialing { ack, data },
                }) => {
                    table.slots.insert(
                        id,
                        Slot {
                            token,
                            window,
                            state: SlotState::Established { data },
                        },
                    );
                    let _ = ack.send(());
                }
                Some(slot) => {
                    table.slots.insert(id, slot);
                    warn!("Unexpected Ack for mux stream {}", id);
                }
                None => debug!("Ack for unknown mux stream {}", id),
            },
            FrameKind::Fin => {
                if let Some(slot) = table.slots.remove(&id) {
                    slot.window.close();
                    debug!("Peer closed mux stream {}", id);
                }
            }
            FrameKind::Window => match (table.slots.get(&id), frame.credit()) {
                (Some(slot), Some(credit)) => slot.window.grant(credit as usize),
                (Some(_), None) => warn!("Malformed Window frame for mux stream {}", id),
                (None, _) => debug!("Window for unknown mux stream {}", id),
            },
            FrameKind::Data => match table.slots.get(&id) {
                Some(Slot {
                    state: SlotState::Established { data },
                    ..
                }) => {
                    let _ = data.send(frame.payload);
                }
                _ => debug!(
                    "Dropping {} bytes for mux stream {} that is not open",
                    frame.payload.len(),
                    id
                ),
            },
        }
    }

    fn teardown(&self) {
        let slots = {
            let mut table = self.table.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            std::mem::take(&mut table.slots)
        };
        debug!("Mux broker closing {} open streams", slots.len());
        for slot in slots.values() {
            slot.window.close();
        }
        // Dropping the slots drops every pending oneshot and data sender.
        drop(slots);

        let _ = self.outbound.send(Outbound::Shutdown);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Dropping `outbound` lets the writer drain what is queued and exit.
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Clears the slot of a `dial`/`accept` whose future is dropped or fails
/// before handing out a stream.
struct HalfOpen<'a> {
    shared: &'a Shared,
    id: u32,
    token: u64,
    armed: bool,
}

impl<'a> HalfOpen<'a> {
    fn new(shared: &'a Shared, id: u32, token: u64) -> Self {
        Self {
            shared,
            id,
            token,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for HalfOpen<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandon(self.id, self.token);
        }
    }
}

async fn read_loop<R>(mut reader: R, shared: Weak<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Mux connection closed by peer");
                break;
            }
            Err(e) => {
                warn!("Mux connection read failed: {}", e);
                break;
            }
        };
        match shared.upgrade() {
            Some(shared) => shared.handle_frame(frame),
            None => return,
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.teardown();
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<Outbound>, shared: Weak<Shared>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let frame = match item {
            Outbound::Frame(frame) => frame,
            Outbound::Shutdown => break,
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Mux connection write failed: {}", e);
            if let Some(shared) = shared.upgrade() {
                shared.teardown();
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}
