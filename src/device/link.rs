//! link.rs
//! Device link contract and the connection state machine every transport shares.
//!
//! - `DeviceLink`: the capability set (scan / connect / stream / disconnect + events)
//! - `LinkCore`: state machine, scan de-duplication, streaming gate and event fan-out
//!
//! Events are fanned out to every subscriber through bounded tokio channels using
//! `try_send`, so the vendor I/O thread never blocks on a slow consumer.

use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::model::{ChannelKind, DeviceModel, DeviceStatus};

pub type LinkEvents = mpsc::Receiver<LinkEvent>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Error(reason) => write!(f, "error({})", reason),
        }
    }
}

/// A wearable found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceInfo {
    /// Hardware address; identity used for de-duplication.
    pub id: String,
    pub name: String,
    pub model: DeviceModel,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            model: DeviceModel::infer_from_name(&name),
            name,
        }
    }
}

/// One raw data unit received while streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: ChannelKind,
    pub values: Vec<f64>,
    pub quality: Option<f64>,
    pub device_status: Option<DeviceStatus>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    DeviceDiscovered(DeviceInfo),
    ConnectionChanged(ConnectionState),
    Frame(Frame),
}

/// Capability set of one wearable link. Completion of `connect`/`disconnect`
/// is observed through `ConnectionChanged` events, never through return values.
pub trait DeviceLink: Send + Sync {
    fn start_scan(&self);
    fn stop_scan(&self);
    fn connect(&self, device: &DeviceInfo);
    fn disconnect(&self);
    fn start_streaming(&self);
    fn stop_streaming(&self);

    /// Registers a new subscriber. Every event published afterwards is delivered
    /// to it in order until the receiver is dropped.
    fn subscribe(&self) -> LinkEvents;

    fn connection_state(&self) -> ConnectionState;
    fn is_scanning(&self) -> bool;
    fn is_streaming(&self) -> bool;
}

#[derive(Default)]
struct CoreState {
    connection: ConnectionState,
    scanning: bool,
    streaming: bool,
    discovered: HashSet<String>,
    target: Option<DeviceInfo>,
    subscribers: Vec<Subscriber>,
    next_subscriber: usize,
}

struct Subscriber {
    id: usize,
    tx: mpsc::Sender<LinkEvent>,
    dropped: u64,
}

/// Transport-independent half of a device link.
///
/// Transitions: disconnected → connecting → connected → disconnected, with
/// error(reason) reachable from connecting/connected and always followed by
/// disconnected. Rejected transitions return `false` and publish nothing.
pub struct LinkCore {
    inner: Mutex<CoreState>,
    capacity: usize,
    dropped_events: AtomicU64,
    discarded_frames: AtomicU64,
}

impl LinkCore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CoreState::default()),
            capacity: capacity.max(1),
            dropped_events: AtomicU64::new(0),
            discarded_frames: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> LinkEvents {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.inner.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(Subscriber { id, tx, dropped: 0 });
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().connection.clone()
    }

    pub fn target(&self) -> Option<DeviceInfo> {
        self.inner.lock().target.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scanning
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().streaming
    }

    /// Events that could not be queued because a subscriber was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Live subscribers that have lost at least one event.
    pub fn lagging_subscribers(&self) -> usize {
        self.inner
            .lock()
            .subscribers
            .iter()
            .filter(|sub| sub.dropped > 0)
            .count()
    }

    /// Frames that arrived while streaming was stopped.
    pub fn discarded_frames(&self) -> u64 {
        self.discarded_frames.load(Ordering::Relaxed)
    }

    /// Starts a discovery round; the de-duplication set is reset per round.
    pub fn begin_scan(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.scanning {
            return false;
        }
        inner.scanning = true;
        inner.discovered.clear();
        true
    }

    pub fn end_scan(&self) -> bool {
        std::mem::replace(&mut self.inner.lock().scanning, false)
    }

    /// Publishes `DeviceDiscovered` once per device identity while scanning.
    pub fn report_discovered(&self, device: DeviceInfo) -> bool {
        let mut inner = self.inner.lock();
        if !inner.scanning || !inner.discovered.insert(device.id.clone()) {
            return false;
        }
        debug!("[Link] discovered {} ({})", device.name, device.id);
        self.publish(&mut inner, LinkEvent::DeviceDiscovered(device));
        true
    }

    /// Only one attempt may be outstanding; connect while connecting or connected is a no-op.
    pub fn begin_connect(&self, device: &DeviceInfo) -> bool {
        let mut inner = self.inner.lock();
        match inner.connection {
            ConnectionState::Disconnected => {}
            ref other => {
                debug!("[Link] connect to {} ignored while {}", device.name, other);
                return false;
            }
        }
        info!("[Link] connecting to {}", device.name);
        inner.target = Some(device.clone());
        self.transition(&mut inner, ConnectionState::Connecting);
        true
    }

    pub fn mark_connected(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.connection != ConnectionState::Connecting {
            return false;
        }
        self.transition(&mut inner, ConnectionState::Connected);
        true
    }

    /// Surfaces `error(reason)` and settles in `disconnected`.
    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        match inner.connection {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            _ => return false,
        }
        let reason = reason.into();
        warn!("[Link] connection error: {}", reason);
        inner.streaming = false;
        self.transition(&mut inner, ConnectionState::Error(reason));
        self.transition(&mut inner, ConnectionState::Disconnected);
        true
    }

    /// Idempotent: returns `false` and publishes nothing when already disconnected.
    pub fn mark_disconnected(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.connection == ConnectionState::Disconnected {
            return false;
        }
        inner.streaming = false;
        self.transition(&mut inner, ConnectionState::Disconnected);
        true
    }

    pub fn set_streaming(&self, on: bool) -> bool {
        std::mem::replace(&mut self.inner.lock().streaming, on)
    }

    /// Forwards a frame to subscribers, or discards it when streaming is stopped.
    pub fn publish_frame(&self, frame: Frame) -> bool {
        let mut inner = self.inner.lock();
        if !inner.streaming {
            self.discarded_frames.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.publish(&mut inner, LinkEvent::Frame(frame));
        true
    }

    fn transition(&self, inner: &mut CoreState, next: ConnectionState) {
        debug!("[Link] {} -> {}", inner.connection, next);
        inner.connection = next.clone();
        self.publish(inner, LinkEvent::ConnectionChanged(next));
    }

    // Closed subscribers are pruned; full ones lose this event only.
    fn publish(&self, inner: &mut CoreState, event: LinkEvent) {
        let capacity = self.capacity;
        inner.subscribers.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                if sub.dropped == 0 {
                    warn!(
                        "[Link] subscriber {} is full ({} queued), dropping its events",
                        sub.id, capacity
                    );
                }
                sub.dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
}
