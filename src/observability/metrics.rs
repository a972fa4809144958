//! Thread-safe metrics collection system
//!
//! Atomic counters for the connection supervisor and consumer coordinator,
//! plus a bounded window of event-loop iteration times.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Connection supervisor
    broker_reachable: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_losses: AtomicU64,
    reconnects: AtomicU64,
    connection_start_time: AtomicU64,

    // Consumer coordinator
    recovery_signals: AtomicU64,
    consumer_rebuilds: AtomicU64,
    consumer_rebuild_failures: AtomicU64,
    event_iterations: AtomicU64,
    pauses: AtomicU64,
    handle_times: Mutex<Vec<u64>>, // in microseconds

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            broker_reachable: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_losses: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            recovery_signals: AtomicU64::new(0),
            consumer_rebuilds: AtomicU64::new(0),
            consumer_rebuild_failures: AtomicU64::new(0),
            event_iterations: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
            handle_times: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connection_losses.fetch_add(1, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_broker_reachable(&self, reachable: bool) {
        self.broker_reachable.store(reachable, Ordering::Relaxed);
    }

    // Coordinator metrics
    pub fn recovery_signal_sent(&self) {
        self.recovery_signals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumers_rebuilt(&self) {
        self.consumer_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_rebuild_failed(&self) {
        self.consumer_rebuild_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_loop_paused(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_handled(&self, duration: Duration) {
        self.event_iterations.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.handle_times.lock() {
            times.push(duration.as_micros() as u64);

            // Keep a bounded window
            if times.len() > MAX_SAMPLES {
                times.remove(0);
            }
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.broker_reachable.store(false, Ordering::Relaxed);
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connections_established.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.connection_losses.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
        self.recovery_signals.store(0, Ordering::Relaxed);
        self.consumer_rebuilds.store(0, Ordering::Relaxed);
        self.consumer_rebuild_failures.store(0, Ordering::Relaxed);
        self.event_iterations.store(0, Ordering::Relaxed);
        self.pauses.store(0, Ordering::Relaxed);
        if let Ok(mut times) = self.handle_times.lock() {
            times.clear();
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Average, p50, p95 and p99 iteration time in microseconds (pure function)
    fn calculate_handle_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.handle_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        match self.connection_start_time.load(Ordering::Relaxed) {
            0 => 0,
            start => now.saturating_sub(start),
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.calculate_handle_time_statistics();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                broker_reachable: self.broker_reachable.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_losses: self.connection_losses.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            consumers: ConsumerMetrics {
                recovery_signals: self.recovery_signals.load(Ordering::Relaxed),
                consumer_rebuilds: self.consumer_rebuilds.load(Ordering::Relaxed),
                consumer_rebuild_failures: self.consumer_rebuild_failures.load(Ordering::Relaxed),
                event_iterations: self.event_iterations.load(Ordering::Relaxed),
                pauses: self.pauses.load(Ordering::Relaxed),
                avg_handle_time_us: avg,
                handle_time_p50_us: p50,
                handle_time_p95_us: p95,
                handle_time_p99_us: p99,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connection: ConnectionMetrics,
    pub consumers: ConsumerMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub broker_reachable: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_losses: u64,
    pub reconnects: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ConsumerMetrics {
    pub recovery_signals: u64,
    pub consumer_rebuilds: u64,
    pub consumer_rebuild_failures: u64,
    pub event_iterations: u64,
    pub pauses: u64,
    pub avg_handle_time_us: f64,
    pub handle_time_p50_us: f64,
    pub handle_time_p95_us: f64,
    pub handle_time_p99_us: f64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
