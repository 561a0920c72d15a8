//! Multi-bus manager: named bus handles, per-bus receive tasks, fan-in
//!
//! Each bus owns exactly one receive task. Incoming frames are tagged with
//! the bus name, run through the bus's software acceptance filters, and
//! pushed into the shared bounded ingress queue. Shutdown is cooperative: a
//! stop flag plus the queue sentinel, with a short poll timeout so latency
//! stays bounded.

pub mod queue;

pub use queue::{ingress_queue, IngressReceiver, IngressSender, DEFAULT_CAPACITY, MAX_BATCH};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::frame::{CanFilter, Frame};

/// Poll timeout for receive tasks; bounds shutdown latency.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Per-bus injector depth between the transport and the receive task.
const BUS_CHANNEL_CAPACITY: usize = 4096;

/// Per-(id, source) receive accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCounter {
    pub count: u64,
    pub last_timestamp: f64,
    /// Milliseconds between the two most recent frames.
    pub period_ms: f64,
}

/// Handle used by transports, replay, and tests to feed frames into a bus.
#[derive(Clone)]
pub struct BusInjector {
    name: String,
    tx: mpsc::Sender<Frame>,
}

impl BusInjector {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a raw frame to the bus's receive task. Fails only after
    /// shutdown.
    pub async fn inject(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub fn try_inject(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

struct Bus {
    name: String,
    bitrate: u32,
    filters: Arc<RwLock<Vec<CanFilter>>>,
    task: JoinHandle<()>,
}

/// Owns all bus handles and their receive tasks.
pub struct BusManager {
    buses: Vec<Bus>,
    ingress: IngressSender,
    receiver: Option<IngressReceiver>,
    stop: Arc<AtomicBool>,
    counters: Arc<Mutex<HashMap<(u32, String), FrameCounter>>>,
}

impl BusManager {
    pub fn new(queue_capacity: usize) -> Self {
        let (ingress, receiver) = ingress_queue(queue_capacity);
        Self {
            buses: Vec::new(),
            ingress,
            receiver: Some(receiver),
            stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a named bus and spawn its receive task. Returns the injector
    /// the transport feeds raw frames into.
    pub fn add_bus(&mut self, name: impl Into<String>, bitrate: u32) -> BusInjector {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel::<Frame>(BUS_CHANNEL_CAPACITY);
        let filters: Arc<RwLock<Vec<CanFilter>>> = Arc::new(RwLock::new(Vec::new()));

        let task_name = name.clone();
        let task_filters = Arc::clone(&filters);
        let ingress = self.ingress.clone();
        let stop = Arc::clone(&self.stop);
        let counters = Arc::clone(&self.counters);

        let task = tokio::spawn(async move {
            info!(bus = %task_name, "receive task started");
            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let frame = match tokio::time::timeout(RECV_POLL_TIMEOUT, rx.recv()).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    // Poll timeout: re-check the stop flag.
                    Err(_) => continue,
                };

                let accepted = {
                    let filters = task_filters.read().expect("filter lock");
                    filters.iter().all(|f| f.matches(frame.can_id()))
                };
                if !accepted {
                    continue;
                }

                let tagged = frame.with_source(task_name.clone());
                {
                    let mut counters = counters.lock().expect("counter lock");
                    let entry = counters
                        .entry((tagged.can_id(), task_name.clone()))
                        .or_default();
                    if entry.count > 0 {
                        entry.period_ms = (tagged.timestamp() - entry.last_timestamp) * 1000.0;
                    }
                    entry.count += 1;
                    entry.last_timestamp = tagged.timestamp();
                }
                ingress.push(tagged);
            }
            debug!(bus = %task_name, "receive task stopped");
        });

        self.buses.push(Bus { name: name.clone(), bitrate, filters, task });
        BusInjector { name, tx }
    }

    pub fn bus_names(&self) -> Vec<String> {
        self.buses.iter().map(|b| b.name.clone()).collect()
    }

    pub fn bitrate_of(&self, name: &str) -> Option<u32> {
        self.buses.iter().find(|b| b.name == name).map(|b| b.bitrate)
    }

    /// Replace the software acceptance filters of one bus.
    pub fn set_filters(&self, name: &str, filters: Vec<CanFilter>) {
        if let Some(bus) = self.buses.iter().find(|b| b.name == name) {
            *bus.filters.write().expect("filter lock") = filters;
        }
    }

    /// Take the ingress consumer. Single pipeline worker only.
    pub fn take_receiver(&mut self) -> Option<IngressReceiver> {
        self.receiver.take()
    }

    /// Frames dropped by the bounded queue so far.
    pub fn dropped(&self) -> u64 {
        self.ingress.dropped()
    }

    /// Snapshot of the per-(id, source) counters.
    pub fn counters(&self) -> HashMap<(u32, String), FrameCounter> {
        self.counters.lock().expect("counter lock").clone()
    }

    pub fn counter_for(&self, can_id: u32, source: &str) -> Option<FrameCounter> {
        self.counters
            .lock()
            .expect("counter lock")
            .get(&(can_id, source.to_string()))
            .copied()
    }

    pub fn clear_counters(&self) {
        self.counters.lock().expect("counter lock").clear();
    }

    /// Stop all receive tasks and wake the pipeline worker with the
    /// sentinel. Tasks drain within the poll timeout.
    pub async fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.ingress.push_shutdown().await;
        for bus in self.buses.drain(..) {
            let _ = bus.task.await;
        }
        info!("bus manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: f64, can_id: u32) -> Frame {
        Frame::new(ts, can_id, vec![1, 2], false, "raw").unwrap()
    }

    #[tokio::test]
    async fn test_frames_tagged_with_bus_name() {
        let mut manager = BusManager::new(100);
        let can1 = manager.add_bus("CAN1", 500_000);
        let mut rx = manager.take_receiver().unwrap();

        assert!(can1.inject(frame(1.0, 0x123)).await);
        let batch = rx.pop_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].source(), "CAN1");
        assert_eq!(batch[0].can_id(), 0x123);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_buses_fan_in() {
        let mut manager = BusManager::new(100);
        let can1 = manager.add_bus("CAN1", 500_000);
        let can2 = manager.add_bus("CAN2", 250_000);
        let mut rx = manager.take_receiver().unwrap();

        can1.inject(frame(1.0, 0x100)).await;
        can2.inject(frame(1.1, 0x200)).await;

        let mut seen = Vec::new();
        while seen.len() < 2 {
            for f in rx.pop_batch().await.unwrap() {
                seen.push((f.source().to_string(), f.can_id()));
            }
        }
        seen.sort();
        assert_eq!(seen, vec![("CAN1".into(), 0x100), ("CAN2".into(), 0x200)]);

        assert_eq!(manager.bitrate_of("CAN2"), Some(250_000));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_filters_drop_non_matching() {
        let mut manager = BusManager::new(100);
        let can1 = manager.add_bus("CAN1", 500_000);
        manager.set_filters(
            "CAN1",
            vec![CanFilter { filter_id: 0x100, mask: 0x700, is_extended: false, enabled: true }],
        );
        let mut rx = manager.take_receiver().unwrap();

        can1.inject(frame(1.0, 0x123)).await; // passes (0x123 & 0x700 == 0x100)
        can1.inject(frame(1.1, 0x223)).await; // filtered
        can1.inject(frame(1.2, 0x1FF)).await; // passes

        let mut ids = Vec::new();
        while ids.len() < 2 {
            for f in rx.pop_batch().await.unwrap() {
                ids.push(f.can_id());
            }
        }
        assert_eq!(ids, vec![0x123, 0x1FF]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_counters_track_period() {
        let mut manager = BusManager::new(100);
        let can1 = manager.add_bus("CAN1", 500_000);
        let mut rx = manager.take_receiver().unwrap();

        can1.inject(frame(1.0, 0x123)).await;
        can1.inject(frame(1.05, 0x123)).await;
        let mut total = 0;
        while total < 2 {
            total += rx.pop_batch().await.unwrap().len();
        }

        let counter = manager.counter_for(0x123, "CAN1").unwrap();
        assert_eq!(counter.count, 2);
        assert!((counter.period_ms - 50.0).abs() < 1.0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_consumer() {
        let mut manager = BusManager::new(100);
        let _can1 = manager.add_bus("CAN1", 500_000);
        let mut rx = manager.take_receiver().unwrap();
        manager.shutdown().await;
        assert!(rx.pop_batch().await.is_none());
    }
}
