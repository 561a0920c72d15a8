//! Frame pipeline: gateway, decoder dispatch, diff evaluation, observer
//! fan-out, and transmit scheduling
//!
//! One worker task drains the bus manager's ingress queue in batches and
//! runs each frame through gateway -> registry -> diff -> observer. Decoders
//! stay synchronous; the only suspension points are the queue boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::{BusInjector, IngressReceiver};
use crate::decoders::bap::BapDecoder;
use crate::decoders::ftcan::FtcanDecoder;
use crate::decoders::obd2::Obd2Decoder;
use crate::decoders::registry::{DecoderRegistry, DecoderStats};
use crate::decoders::Decoder;
use crate::diff::{DiffConfig, DiffEngine, DiffKey, DiffStats};
use crate::frame::Frame;
use crate::gateway::{GatewayConfig, GatewayEngine, RuleError};
use crate::observer::Observer;

/// The analyzer core: everything between bus ingress and the observer.
pub struct Analyzer {
    registry: Mutex<DecoderRegistry>,
    gateway: GatewayEngine,
    diff: Mutex<DiffEngine>,
    observer: Arc<dyn Observer>,
    /// Transmit handles for gateway forwarding, keyed by bus name.
    injectors: RwLock<HashMap<String, BusInjector>>,
    frames_processed: AtomicU64,
    forwards_dropped: AtomicU64,
}

impl Analyzer {
    pub fn new(
        gateway_config: GatewayConfig,
        diff_config: DiffConfig,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, RuleError> {
        Ok(Self {
            registry: Mutex::new(DecoderRegistry::new()),
            gateway: GatewayEngine::new(gateway_config)?,
            diff: Mutex::new(DiffEngine::new(diff_config)),
            observer,
            injectors: RwLock::new(HashMap::new()),
            frames_processed: AtomicU64::new(0),
            forwards_dropped: AtomicU64::new(0),
        })
    }

    /// Register the built-in protocol decoders.
    pub fn register_default_decoders(&self) {
        let mut registry = self.registry.lock().expect("registry lock");
        registry.register(Box::new(FtcanDecoder::new()));
        registry.register(Box::new(Obd2Decoder::new()));
        registry.register(Box::new(BapDecoder::default()));
        info!(decoders = ?registry.decoder_names(), "decoders registered");
    }

    pub fn register_decoder(&self, decoder: Box<dyn Decoder>) {
        self.registry.lock().expect("registry lock").register(decoder);
    }

    pub fn set_decoder_enabled(&self, name: &str, enabled: bool) {
        self.registry
            .lock()
            .expect("registry lock")
            .set_enabled(name, enabled);
    }

    /// Register the transmit handle the gateway forwards into.
    pub fn register_injector(&self, injector: BusInjector) {
        self.injectors
            .write()
            .expect("injector lock")
            .insert(injector.name().to_string(), injector);
    }

    pub fn gateway(&self) -> &GatewayEngine {
        &self.gateway
    }

    /// Run one frame through the pipeline. Synchronous and total: nothing
    /// here suspends or fails.
    pub fn process_frame(&self, frame: Frame) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);

        let verdict = self.gateway.process(&frame);

        // Forwarding never blocks the pipeline; a saturated destination
        // drops the copy and counts it.
        if let Some((destination, forwarded)) = verdict.forward {
            let injectors = self.injectors.read().expect("injector lock");
            match injectors.get(&destination) {
                Some(injector) => {
                    if !injector.try_inject(forwarded) {
                        self.forwards_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => {
                    debug!(destination, "no injector for route destination");
                    self.forwards_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if !verdict.display {
            return;
        }
        let frame = verdict.annotated;

        self.observer.on_frame(&frame);

        let results = self.registry.lock().expect("registry lock").decode(&frame);
        self.observer.on_decoded(&frame, &results);

        let decision = self.diff.lock().expect("diff lock").evaluate(&frame);
        self.observer.on_diff_decision(&decision);
    }

    /// Spawn the pipeline worker over the ingress queue. Exits when the
    /// queue delivers the shutdown sentinel.
    pub fn spawn_worker(self: &Arc<Self>, mut receiver: IngressReceiver) -> JoinHandle<()> {
        let analyzer = Arc::clone(self);
        tokio::spawn(async move {
            info!("pipeline worker started");
            while let Some(batch) = receiver.pop_batch().await {
                for frame in batch {
                    analyzer.process_frame(frame);
                }
            }
            info!(
                frames = analyzer.frames_processed.load(Ordering::Relaxed),
                "pipeline worker stopped"
            );
        })
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn forwards_dropped(&self) -> u64 {
        self.forwards_dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of the per-decoder statistics (coarse lock).
    pub fn decoder_stats(&self) -> HashMap<&'static str, DecoderStats> {
        self.registry.lock().expect("registry lock").stats()
    }

    pub fn reset_decoder_stats(&self) {
        self.registry.lock().expect("registry lock").reset_stats();
    }

    pub fn diff_stats(&self) -> DiffStats {
        self.diff.lock().expect("diff lock").stats()
    }

    pub fn take_diff_snapshot(&self, keys: Option<&[DiffKey]>) {
        self.diff.lock().expect("diff lock").take_snapshot(keys);
    }

    pub fn update_diff_config(&self, config: DiffConfig) {
        self.diff.lock().expect("diff lock").update_config(config);
    }

    /// Clear decoder reassembly scratch and diff state.
    pub fn reset(&self) {
        self.registry.lock().expect("registry lock").reset_decoders();
        self.diff.lock().expect("diff lock").reset();
    }
}

/// One transmit-list entry: a frame sent once, or on a period, optionally a
/// bounded number of times.
#[derive(Debug, Clone)]
pub struct TransmitEntry {
    pub frame: Frame,
    /// Zero sends once.
    pub period_ms: u64,
    /// Periodic entries stop after this many sends when set.
    pub count: Option<u64>,
}

/// Periodic transmit scheduling over bus injectors.
pub struct TransmitScheduler {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    sent: Arc<AtomicU64>,
}

impl Default for TransmitScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmitScheduler {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    fn stamped(frame: &Frame) -> Frame {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        frame.clone().with_timestamp(now)
    }

    /// Send immediately, once.
    pub async fn send_once(&self, injector: &BusInjector, frame: &Frame) -> bool {
        let ok = injector.inject(Self::stamped(frame)).await;
        if ok {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Schedule an entry. One-shot entries send right away; periodic ones
    /// get their own interval task until stopped or the count runs out.
    pub fn schedule(&mut self, injector: BusInjector, entry: TransmitEntry) {
        if entry.period_ms == 0 {
            let sent = Arc::clone(&self.sent);
            self.handles.push(tokio::spawn(async move {
                if injector.inject(Self::stamped(&entry.frame)).await {
                    sent.fetch_add(1, Ordering::Relaxed);
                }
            }));
            return;
        }

        let stop = Arc::clone(&self.stop);
        let sent = Arc::clone(&self.sent);
        self.handles.push(tokio::spawn(async move {
            let period = std::time::Duration::from_millis(entry.period_ms);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut remaining = entry.count;
            loop {
                interval.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(0) = remaining {
                    break;
                }
                if injector.inject(Self::stamped(&entry.frame)).await {
                    sent.fetch_add(1, Ordering::Relaxed);
                }
                if let Some(n) = remaining.as_mut() {
                    *n -= 1;
                }
            }
        }));
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stop all periodic tasks and wait for them to wind down.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}
