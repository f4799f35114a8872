//! Protocol manager: the façade wiring codec, transport, address,
//! diagnostics, queue, congestion, bandwidth, and router together into one
//! running engine (spec.md §4.9, §5, §6, §9).
//!
//! The subscribe/notify split is generalized from the teacher's
//! `AddressService`/`AddressHandle`/`AddressRunner`
//! (`protocol/managment/address_supervisor.rs`), which races a command
//! channel against inbound frames with `futures_util::future::select`
//! inside an embassy-sync `Channel`; this crate has no embedded
//! constraint, so the same shape is expressed with `tokio::sync::{mpsc,
//! broadcast}` channels and `tokio::select!`, and "command channel" is
//! replaced by the cooperative cancellation flag spec.md §5 calls for
//! ("each background task is cancelable; on cancel it completes its
//! current iteration, releases locks, and exits").
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::{ArbitrationPolicy, ConflictEvent, IsoName, Registry};
use crate::bandwidth::BandwidthAllocator;
use crate::codec::catalog::{self, PGN_ADDRESS_CLAIM, PGN_DM1, PGN_DM2, PGN_ISO_REQUEST, PGN_TRANSPORT_CM, PGN_TRANSPORT_DT};
use crate::codec::decoder::SpnValue;
use crate::codec::frame::Frame;
use crate::codec::identifier::Identifier;
use crate::codec::{count_omitted, decode, encode};
use crate::config::Config;
use crate::congestion::{CongestionDetector, CongestionLevel, CongestionMetrics, TrafficThrottler};
use crate::diagnostics::{DiagnosticsTracker, Dtc, LampStatus};
use crate::metrics::Metrics;
use crate::queue::{OperationContext, PriorityClass, PriorityQueue, QueuedMessage};
use crate::router::Router;
use crate::transport::engine::{OutboundFrame, TransportEngine, TransportEvent};
use crate::transport::session::AbortReason;

const ADDRESS_LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// A decoded application-layer message, handed to [`DecodedSink`]s.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub pgn: u32,
    pub source: u8,
    pub destination: Option<u8>,
    pub spns: HashMap<u32, SpnValue>,
    pub raw: Vec<u8>,
}

/// Receives fully decoded messages. Implementors are called independently
/// of one another; one sink's failure never blocks or skips another
/// (spec.md §6 "isolated failures").
#[async_trait]
pub trait DecodedSink: Send + Sync {
    async fn accept(&self, message: &DecodedMessage, interface: &str) -> std::io::Result<()>;
}

/// Delivers a drained batch of outbound frames in order, reporting
/// overall success; the manager retries a failed batch once (requeued at
/// the head of its source priority class) and drops it on a second
/// failure (spec.md §6).
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn send_batch(&self, frames: &[OutboundFrame]) -> bool;
}

/// Transmits one raw CAN frame on the network, keyed by the opaque
/// interface id it should go out on (spec.md §6).
#[async_trait]
pub trait RawFrameSink: Send + Sync {
    async fn send(&self, destination_interface: &str, frame: Frame) -> std::io::Result<()>;
}

/// Events callers can subscribe to instead of polling manager state
/// (spec.md §4.9).
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    AddressConflict(ConflictEvent),
    TransportComplete { pgn: u32, source: u8, destination: u8, payload: Vec<u8> },
    TransportAborted { source: u8, destination: u8, reason: AbortReason },
    DiagnosticsChanged { source: u8, active: Vec<Dtc>, lamp_status: LampStatus },
}

struct DedupEntry {
    payload: Vec<u8>,
    seen_at: Instant,
}

/// Point-in-time view of network health (spec.md §4.9 "network-status
/// snapshot").
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    pub known_devices: usize,
    pub active_transport_sessions: usize,
    pub congestion_level: CongestionLevel,
    pub bandwidth_utilization_percent: f64,
    pub queue_depth: usize,
}

/// Small enum of handler capabilities keyed by PF/PGN (spec.md §9), used
/// to route an inbound frame to the right subsystem without a
/// heterogeneous dispatch map.
enum Handler {
    AddressClaim,
    IsoRequest,
    TransportControl,
    TransportData,
    Diagnostics1,
    Diagnostics2,
    Catalog,
    Unhandled,
}

fn classify(pgn: u32) -> Handler {
    match pgn {
        PGN_ADDRESS_CLAIM => Handler::AddressClaim,
        PGN_ISO_REQUEST => Handler::IsoRequest,
        PGN_TRANSPORT_CM => Handler::TransportControl,
        PGN_TRANSPORT_DT => Handler::TransportData,
        PGN_DM1 => Handler::Diagnostics1,
        PGN_DM2 => Handler::Diagnostics2,
        pgn if catalog::lookup(pgn).is_some() => Handler::Catalog,
        _ => Handler::Unhandled,
    }
}

pub struct ProtocolManager {
    config: Config,
    source_address: u8,
    transport: TransportEngine,
    registry: Registry,
    diagnostics: DiagnosticsTracker,
    queue: PriorityQueue,
    congestion: CongestionDetector,
    throttler: TrafficThrottler,
    bandwidth: BandwidthAllocator,
    router: Router,
    pub metrics: Arc<Metrics>,
    events: broadcast::Sender<ManagerEvent>,
    dedup: Mutex<HashMap<(u32, u8), DedupEntry>>,
    decoded_sink: Arc<dyn DecodedSink>,
    raw_sink: Arc<dyn RawFrameSink>,
    cancel: Arc<Notify>,
    shut_down: AtomicBool,
}

impl ProtocolManager {
    pub fn new(
        config: Config,
        source_address: u8,
        active_interfaces: Vec<String>,
        decoded_sink: Arc<dyn DecodedSink>,
        raw_sink: Arc<dyn RawFrameSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            transport: TransportEngine::new(config.transport_config()),
            registry: Registry::new(ArbitrationPolicy::FirstWriterWins, ADDRESS_LIVENESS_TIMEOUT),
            diagnostics: DiagnosticsTracker::new(),
            queue: PriorityQueue::new(config.queue_config()),
            congestion: CongestionDetector::new(config.congestion.history_size),
            throttler: TrafficThrottler::new(true),
            bandwidth: BandwidthAllocator::new(config.bandwidth.total_kbps),
            router: Router::new(active_interfaces),
            metrics: Arc::new(Metrics::new()),
            events,
            dedup: Mutex::new(HashMap::new()),
            decoded_sink,
            raw_sink,
            cancel: Arc::new(Notify::new()),
            shut_down: AtomicBool::new(false),
            config,
            source_address,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ManagerEvent) {
        // No subscribers is a normal, not an error, condition.
        let _ = self.events.send(event);
    }

    async fn is_duplicate(&self, pgn: u32, source: u8, payload: &[u8], now: Instant) -> bool {
        if !self.config.dedup.enabled {
            return false;
        }
        let window = Duration::from_millis(self.config.dedup.window_ms);
        let mut dedup = self.dedup.lock().await;
        let duplicate = match dedup.get(&(pgn, source)) {
            Some(entry) => entry.payload == payload && now.duration_since(entry.seen_at) < window,
            None => false,
        };
        dedup.insert((pgn, source), DedupEntry { payload: payload.to_vec(), seen_at: now });
        duplicate
    }

    /// Process one inbound frame: decode, update address/diagnostics
    /// state, and drive transport reassembly. Ingress errors never
    /// propagate to the caller (spec.md §7); they are only ever visible
    /// as a `metrics` counter.
    pub async fn ingress(&self, frame: Frame) {
        let now = Instant::now();
        let Some(id) = frame.identifier() else {
            Metrics::incr(&self.metrics.frame_malformed);
            return;
        };
        self.registry.note_activity(id.source_address, now).await;

        match classify(id.pgn()) {
            Handler::AddressClaim => self.handle_address_claim(id, &frame, now).await,
            Handler::IsoRequest => {
                // Re-announcement requests carry no state of their own;
                // the embedding application decides whether/how to answer.
                debug!(source = id.source_address, "received ISO request");
            }
            Handler::TransportControl => self.handle_transport_control(id, &frame).await,
            Handler::TransportData => self.handle_transport_data(id, &frame).await,
            Handler::Diagnostics1 => self.handle_diagnostics(id, &frame, true).await,
            Handler::Diagnostics2 => self.handle_diagnostics(id, &frame, false).await,
            Handler::Catalog => self.handle_catalog(id, &frame, now).await,
            Handler::Unhandled => {
                Metrics::incr(&self.metrics.unknown_pgn);
            }
        }
    }

    async fn handle_address_claim(&self, id: Identifier, frame: &Frame, now: Instant) {
        if frame.data.len() != 8 {
            Metrics::incr(&self.metrics.frame_malformed);
            return;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&frame.data);
        let name = IsoName::from_raw(u64::from_le_bytes(raw));
        let outcome = self.registry.on_address_claim(id.source_address, name, now).await;
        if matches!(outcome, crate::address::ClaimOutcome::ConflictRetained | crate::address::ClaimOutcome::ConflictReplaced) {
            Metrics::incr(&self.metrics.address_conflict);
            if let Some(conflict) = self.registry.conflicts().await.last().copied() {
                self.publish(ManagerEvent::AddressConflict(conflict));
            }
        }
    }

    async fn handle_transport_control(&self, id: Identifier, frame: &Frame) {
        if frame.data.len() != 8 {
            Metrics::incr(&self.metrics.frame_malformed);
            return;
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.data);
        let (events, outbound) = self.transport.handle_control(id.source_address, id.destination(), data).await;
        self.send_outbound(&frame.interface, outbound).await;
        for event in events {
            self.handle_transport_event(event).await;
        }
    }

    async fn handle_transport_data(&self, id: Identifier, frame: &Frame) {
        if frame.data.len() != 8 {
            Metrics::incr(&self.metrics.frame_malformed);
            return;
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&frame.data);
        let (events, outbound) = self.transport.handle_data(id.source_address, id.destination(), data).await;
        self.send_outbound(&frame.interface, outbound).await;
        for event in events {
            self.handle_transport_event(event).await;
        }
    }

    async fn send_outbound(&self, interface: &str, frames: Vec<OutboundFrame>) {
        for out in frames {
            // Every control-response frame the engine hands back from
            // ingress (CTS, EOM_ACK, ABORT) targets the peer explicitly;
            // BAM has no control response to send.
            let raw_id = match Identifier::build(out.pgn, self.source_address, 7, out.destination) {
                Ok(identifier) => identifier.to_raw(),
                Err(_) => continue,
            };
            let frame = Frame::new(raw_id, true, out.data.to_vec(), interface.to_string());
            if self.raw_sink.send(interface, frame).await.is_err() {
                Metrics::incr(&self.metrics.sink_failure);
            }
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessageComplete { pgn, source, destination, payload } => {
                self.publish(ManagerEvent::TransportComplete { pgn, source, destination, payload: payload.clone() });
                // Transport carries whatever PGN the sender chose, including
                // ones outside the scaled-SPN catalog (e.g. object pool
                // transfers); those still reach the sink, just with no SPNs.
                let spns = match decode(pgn, &payload) {
                    Ok(spns) => {
                        if count_omitted(pgn, &spns) > 0 {
                            Metrics::incr(&self.metrics.spn_extraction_failure);
                        }
                        spns
                    }
                    Err(_) => HashMap::new(),
                };
                let message = DecodedMessage { pgn, source, destination: Some(destination), spns, raw: payload };
                if self.decoded_sink.accept(&message, "transport").await.is_err() {
                    Metrics::incr(&self.metrics.sink_failure);
                }
            }
            TransportEvent::Aborted { source, destination, reason } => {
                Metrics::incr(&self.metrics.session_abort);
                self.publish(ManagerEvent::TransportAborted { source, destination, reason });
            }
            TransportEvent::IgnoredUnknownControl => {
                Metrics::incr(&self.metrics.transport_control_ignored);
            }
            TransportEvent::IgnoredOrphanData => {
                Metrics::incr(&self.metrics.transport_orphan_data);
            }
            TransportEvent::FragmentConsumed | TransportEvent::SendAcknowledged { .. } | TransportEvent::Ignored => {}
        }
    }

    async fn handle_diagnostics(&self, id: Identifier, frame: &Frame, active: bool) {
        let result = if active {
            self.diagnostics.apply_dm1(id.source_address, &frame.data).await
        } else {
            self.diagnostics.apply_dm2(id.source_address, &frame.data).await
        };
        match result {
            Ok(changed) if changed => {
                if let Some(snapshot) = self.diagnostics.snapshot(id.source_address).await {
                    self.publish(ManagerEvent::DiagnosticsChanged {
                        source: id.source_address,
                        active: snapshot.active,
                        lamp_status: snapshot.lamp_status,
                    });
                }
            }
            Ok(_) => {}
            Err(_) => Metrics::incr(&self.metrics.spn_extraction_failure),
        }
    }

    async fn handle_catalog(&self, id: Identifier, frame: &Frame, now: Instant) {
        if self.is_duplicate(id.pgn(), id.source_address, &frame.data, now).await {
            return;
        }
        match decode(id.pgn(), &frame.data) {
            Ok(spns) => {
                if count_omitted(id.pgn(), &spns) > 0 {
                    Metrics::incr(&self.metrics.spn_extraction_failure);
                }
                let message = DecodedMessage {
                    pgn: id.pgn(),
                    source: id.source_address,
                    destination: if id.is_pdu2() { None } else { Some(id.destination()) },
                    spns,
                    raw: frame.data.clone(),
                };
                if self.decoded_sink.accept(&message, &frame.interface).await.is_err() {
                    Metrics::incr(&self.metrics.sink_failure);
                }
            }
            Err(_) => Metrics::incr(&self.metrics.spn_extraction_failure),
        }
    }

    /// Enqueue an application message for egress (spec.md §4.5).
    pub async fn enqueue_outbound(&self, message: QueuedMessage) {
        if self.queue.enqueue(message).await.is_err() {
            Metrics::incr(&self.metrics.queue_overflow);
        }
    }

    /// Drain one priority class's worth of work per the queue's
    /// configured (or, under `Adaptive`, dynamically selected) processing
    /// mode and hand it to the batch sink, routed and bandwidth-checked
    /// per message (spec.md §4.5/§4.7/§4.8).
    pub async fn drain_once(&self, operation_context: OperationContext, sink: &dyn BatchSink) {
        let now = Instant::now();
        let level = self.congestion_level().await;
        let effective_mode = match self.queue.mode() {
            crate::queue::ProcessingMode::Adaptive => crate::queue::select_adaptive_mode(operation_context, level),
            other => other,
        };

        let batch = match effective_mode {
            crate::queue::ProcessingMode::Batch => {
                self.queue.stage_eligible(now).await;
                match self.queue.try_flush_batch(now).await {
                    Some(batch) => batch,
                    None => match self.queue.dequeue_next(now).await {
                        Some(message) => vec![message],
                        None => return,
                    },
                }
            }
            crate::queue::ProcessingMode::Emergency => {
                self.queue.drop_backlog_below_high().await;
                match self.queue.dequeue_next(now).await {
                    Some(message) => vec![message],
                    None => return,
                }
            }
            crate::queue::ProcessingMode::RealTime | crate::queue::ProcessingMode::Adaptive => {
                match self.queue.dequeue_next(now).await {
                    Some(message) => vec![message],
                    None => return,
                }
            }
        };

        self.deliver_batch(batch, sink).await;
    }

    async fn deliver_batch(&self, batch: Vec<QueuedMessage>, sink: &dyn BatchSink) {
        let mut outbound = Vec::with_capacity(batch.len());
        for message in &batch {
            let route = self.router.route(message.pgn, self.source_address, message.destination).await;
            let _ = self
                .bandwidth
                .allocate(&format!("pgn-{:#06X}", message.pgn), OperationContext::FieldWork, message.payload.len() as f64, route.priority)
                .await;
            let mut data = [0xFFu8; 8];
            let len = message.payload.len().min(8);
            data[..len].copy_from_slice(&message.payload[..len]);
            outbound.push(OutboundFrame { pgn: message.pgn, destination: message.destination, data });
        }

        if sink.send_batch(&outbound).await {
            return;
        }
        Metrics::incr(&self.metrics.sink_failure);
        for message in batch {
            self.queue.retry_or_drop(message).await.ok();
        }
    }

    async fn congestion_level(&self) -> CongestionLevel {
        let metrics = CongestionMetrics {
            queue_depth: self.queue_depth().await,
            ..Default::default()
        };
        self.congestion.record(metrics).await
    }

    async fn queue_depth(&self) -> usize {
        let mut total = 0;
        for class in [PriorityClass::Critical, PriorityClass::High, PriorityClass::Normal, PriorityClass::Low, PriorityClass::Background] {
            total += self.queue.len(class).await;
        }
        total
    }

    /// Run one congestion/bandwidth monitor tick: score the current
    /// state, throttle if warranted, and reallocate bandwidth under
    /// sustained congestion (spec.md §4.6/§4.7, §5 "congestion and
    /// bandwidth control task").
    pub async fn monitor_tick(&self, operation_context: Option<OperationContext>) {
        let metrics = CongestionMetrics { queue_depth: self.queue_depth().await, ..Default::default() };
        let level = self.congestion.record(metrics).await;
        let decision = self.throttler.make_decision(level, operation_context).await;
        if decision.action != crate::congestion::ThrottleAction::None {
            Metrics::incr(&self.metrics.backpressure_throttle);
        }
        self.throttler.apply(decision).await;
        self.bandwidth.reallocate_for_congestion(level, metrics).await;
    }

    /// Expire idle transport sessions and sweep stale address claims.
    /// Intended to be called periodically from a background task (spec.md
    /// §5 "cleanup task").
    pub async fn cleanup_tick(&self, now: Instant) {
        for (key, _reorder_errors) in self.transport.expire_stale_sessions().await {
            Metrics::incr(&self.metrics.session_timeout);
            self.publish(ManagerEvent::TransportAborted {
                source: key.source,
                destination: key.destination,
                reason: AbortReason::Timeout,
            });
        }
        self.registry.sweep_offline(now).await;
    }

    pub async fn network_status(&self) -> NetworkStatus {
        NetworkStatus {
            known_devices: self.registry.devices().await.len(),
            active_transport_sessions: self.transport.active_session_count().await,
            congestion_level: self.congestion_level().await,
            bandwidth_utilization_percent: self.bandwidth.utilization_percentage().await,
            queue_depth: self.queue_depth().await,
        }
    }

    /// Spawn the cancelable cleanup and congestion/bandwidth monitor
    /// tasks. Each loop iteration runs to completion (so a cancel signal
    /// never interrupts mid-lock) before checking for cancellation
    /// (spec.md §5).
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let cleanup_manager = Arc::clone(self);
        let cleanup_cancel = Arc::clone(&self.cancel);
        let cleanup = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cleanup_cancel.notified() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {
                        cleanup_manager.cleanup_tick(Instant::now()).await;
                    }
                }
            }
        });

        let monitor_manager = Arc::clone(self);
        let monitor_cancel = Arc::clone(&self.cancel);
        let interval = self.config.congestion_interval();
        let monitor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor_cancel.notified() => break,
                    _ = tokio::time::sleep(interval) => {
                        monitor_manager.monitor_tick(None).await;
                    }
                }
            }
        });

        vec![cleanup, monitor]
    }

    /// Stop background tasks, discard queued work (counting it as
    /// dropped), and abort any in-flight transport sessions. Sinks are
    /// the caller's to close; this only stops generating work for them.
    ///
    /// Propagates the first background task's [`JoinError`](tokio::task::JoinError)
    /// if one panicked instead of exiting cleanly; the remaining handles are
    /// still awaited so a panic in one task never leaves another detached.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) -> Result<(), crate::error::ProtocolError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.notify_waiters();
        let mut first_err = None;
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task did not exit cleanly");
                first_err.get_or_insert(err);
            }
        }
        let dropped = self.queue.drain_all().await;
        if dropped > 0 {
            info!(dropped, "dropped queued messages during shutdown");
        }
        for (key, _) in self.transport.abort_all_sessions().await {
            Metrics::incr(&self.metrics.session_abort);
            warn!(source = key.source, destination = key.destination, "aborted transport session during shutdown");
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// Build the 3-byte encode-side helper: re-exported so applications
/// responding to an ISO request don't need to reach into `codec` directly.
pub fn encode_catalog_message(pgn: u32, values: &HashMap<u32, f64>) -> Result<Vec<u8>, crate::codec::EncodeError> {
    encode(pgn, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct NullDecodedSink;
    #[async_trait]
    impl DecodedSink for NullDecodedSink {
        async fn accept(&self, _message: &DecodedMessage, _interface: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct RecordingDecodedSink {
        seen: StdMutex<Vec<u32>>,
    }
    #[async_trait]
    impl DecodedSink for RecordingDecodedSink {
        async fn accept(&self, message: &DecodedMessage, _interface: &str) -> std::io::Result<()> {
            self.seen.lock().unwrap().push(message.pgn);
            Ok(())
        }
    }

    struct NullRawSink;
    #[async_trait]
    impl RawFrameSink for NullRawSink {
        async fn send(&self, _interface: &str, _frame: Frame) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct AlwaysSucceedsBatchSink {
        delivered: StdMutex<usize>,
    }
    #[async_trait]
    impl BatchSink for AlwaysSucceedsBatchSink {
        async fn send_batch(&self, frames: &[OutboundFrame]) -> bool {
            *self.delivered.lock().unwrap() += frames.len();
            true
        }
    }

    struct AlwaysFailsBatchSink;
    #[async_trait]
    impl BatchSink for AlwaysFailsBatchSink {
        async fn send_batch(&self, _frames: &[OutboundFrame]) -> bool {
            false
        }
    }

    fn eec1_frame(source: u8, engine_speed_raw: u16) -> Frame {
        let mut data = [0xFFu8; 8];
        data[3] = (engine_speed_raw & 0xFF) as u8;
        data[4] = (engine_speed_raw >> 8) as u8;
        let id = Identifier::build(0xF004, source, 3, None).unwrap();
        Frame::new(id.to_raw(), true, data.to_vec(), "can0")
    }

    fn manager(decoded: Arc<dyn DecodedSink>) -> ProtocolManager {
        ProtocolManager::new(Config::default(), 0x10, vec!["can0".into()], decoded, Arc::new(NullRawSink))
    }

    #[tokio::test]
    async fn ingress_decodes_catalog_message_and_notifies_sink() {
        let sink = Arc::new(RecordingDecodedSink { seen: StdMutex::new(Vec::new()) });
        let mgr = manager(sink.clone());
        mgr.ingress(eec1_frame(0x20, 4000)).await;
        assert_eq!(sink.seen.lock().unwrap().as_slice(), &[0xF004]);
    }

    #[tokio::test]
    async fn duplicate_frame_within_window_is_suppressed() {
        let sink = Arc::new(RecordingDecodedSink { seen: StdMutex::new(Vec::new()) });
        let mgr = manager(sink.clone());
        mgr.ingress(eec1_frame(0x20, 4000)).await;
        mgr.ingress(eec1_frame(0x20, 4000)).await;
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn address_claim_conflict_is_published_and_counted() {
        let mgr = manager(Arc::new(NullDecodedSink));
        let mut rx = mgr.subscribe();
        let claim = |source: u8, raw: u64| {
            let id = Identifier::build(PGN_ADDRESS_CLAIM, source, 6, Some(0xFF)).unwrap();
            Frame::new(id.to_raw(), true, raw.to_le_bytes().to_vec(), "can0")
        };
        mgr.ingress(claim(0x20, 100)).await;
        mgr.ingress(claim(0x20, 50)).await;
        assert_eq!(mgr.metrics.address_conflict.load(Ordering::Relaxed), 1);
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ManagerEvent::AddressConflict(_)));
    }

    #[tokio::test]
    async fn unknown_pgn_is_counted_and_does_not_panic() {
        let mgr = manager(Arc::new(NullDecodedSink));
        let id = Identifier::build(0xFFFF00, 0x20, 6, None).unwrap();
        mgr.ingress(Frame::new(id.to_raw(), true, vec![0xFF; 8], "can0")).await;
        assert_eq!(mgr.metrics.unknown_pgn.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn drain_once_delivers_queued_message_through_batch_sink() {
        let mgr = manager(Arc::new(NullDecodedSink));
        mgr.enqueue_outbound(QueuedMessage {
            pgn: 0xF004,
            priority: PriorityClass::Critical,
            destination: None,
            payload: vec![1, 2, 3],
            enqueued_at: Instant::now(),
            deadline: None,
            batch_eligible: false,
            safety_critical: true,
            retry_count: 0,
            max_retries: 2,
        })
        .await;

        let sink = AlwaysSucceedsBatchSink { delivered: StdMutex::new(0) };
        mgr.drain_once(OperationContext::FieldWork, &sink).await;
        assert_eq!(*sink.delivered.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_batch_delivery_requeues_message_for_retry() {
        let mgr = manager(Arc::new(NullDecodedSink));
        mgr.enqueue_outbound(QueuedMessage {
            pgn: 0xF004,
            priority: PriorityClass::Normal,
            destination: None,
            payload: vec![1],
            enqueued_at: Instant::now(),
            deadline: None,
            batch_eligible: false,
            safety_critical: false,
            retry_count: 0,
            max_retries: 1,
        })
        .await;

        mgr.drain_once(OperationContext::FieldWork, &AlwaysFailsBatchSink).await;
        assert_eq!(mgr.metrics.sink_failure.load(Ordering::Relaxed), 1);
        assert_eq!(mgr.queue_depth().await, 1);
    }

    #[tokio::test]
    async fn critical_and_high_priority_messages_are_dropped_not_retried_on_failure() {
        let mgr = manager(Arc::new(NullDecodedSink));
        mgr.enqueue_outbound(QueuedMessage {
            pgn: 0xF004,
            priority: PriorityClass::Critical,
            destination: None,
            payload: vec![1],
            enqueued_at: Instant::now(),
            deadline: None,
            batch_eligible: false,
            safety_critical: true,
            retry_count: 0,
            max_retries: 5,
        })
        .await;

        mgr.drain_once(OperationContext::FieldWork, &AlwaysFailsBatchSink).await;
        assert_eq!(mgr.queue_depth().await, 0);
    }

    #[tokio::test]
    async fn network_status_reports_known_devices() {
        let mgr = manager(Arc::new(NullDecodedSink));
        let id = Identifier::build(PGN_ADDRESS_CLAIM, 0x20, 6, Some(0xFF)).unwrap();
        mgr.ingress(Frame::new(id.to_raw(), true, 100u64.to_le_bytes().to_vec(), "can0")).await;
        let status = mgr.network_status().await;
        assert_eq!(status.known_devices, 1);
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_is_idempotent() {
        let mgr = Arc::new(manager(Arc::new(NullDecodedSink)));
        mgr.enqueue_outbound(QueuedMessage {
            pgn: 0xF004,
            priority: PriorityClass::Normal,
            destination: None,
            payload: vec![1],
            enqueued_at: Instant::now(),
            deadline: None,
            batch_eligible: false,
            safety_critical: false,
            retry_count: 0,
            max_retries: 0,
        })
        .await;

        mgr.shutdown(Vec::new()).await.unwrap();
        assert_eq!(mgr.queue_depth().await, 0);
        mgr.shutdown(Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_propagates_a_panicked_background_task() {
        let mgr = Arc::new(manager(Arc::new(NullDecodedSink)));
        let handle = tokio::spawn(async { panic!("boom") });
        let result = mgr.shutdown(vec![handle]).await;
        assert!(matches!(result, Err(crate::error::ProtocolError::BackgroundTaskFailed(_))));
    }
}
