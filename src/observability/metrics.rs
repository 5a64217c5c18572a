//! Thread-safe metrics collection
//!
//! Process-wide atomic counters for connection lifecycle and message delivery,
//! plus a bounded window of delivery latencies for percentile reporting.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and a mutex for latencies
pub struct MetricsCollector {
    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnect_attempts: AtomicU64,
    pings_sent: AtomicU64,
    connection_start_time: AtomicU64,

    // Delivery
    messages_published: AtomicU64,
    deliveries_completed: AtomicU64,
    publish_failures: AtomicU64,
    delivery_timeouts: AtomicU64,
    retransmissions: AtomicU64,
    messages_received: AtomicU64,
    duplicates_suppressed: AtomicU64,
    acks_discarded: AtomicU64,

    // Publish to final ack, milliseconds
    delivery_latencies: Mutex<Vec<u64>>,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            deliveries_completed: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            delivery_timeouts: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            acks_discarded: AtomicU64::new(0),
            delivery_latencies: Mutex::new(Vec::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Connection metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Delivery metrics
    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_delivery_completed(&self, latency: Duration) {
        self.deliveries_completed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = self.delivery_latencies.lock() {
            latencies.push(latency.as_millis() as u64);
            if latencies.len() > MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
        }
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_delivery_timeout(&self) {
        self.delivery_timeouts.fetch_add(1, Ordering::Relaxed);
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_ack_discarded(&self) {
        self.acks_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Calculate latency statistics: (avg, p50, p95, p99)
    fn calculate_latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(latencies) = self.delivery_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
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
        if !self.connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start > 0 {
            now.saturating_sub(start)
        } else {
            0
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.reconnect_attempts,
            &self.pings_sent,
            &self.connection_start_time,
            &self.messages_published,
            &self.deliveries_completed,
            &self.publish_failures,
            &self.delivery_timeouts,
            &self.retransmissions,
            &self.messages_received,
            &self.duplicates_suppressed,
            &self.acks_discarded,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut latencies) = self.delivery_latencies.lock() {
            latencies.clear();
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.calculate_latency_statistics();

        MetricsSnapshot {
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                pings_sent: self.pings_sent.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            delivery: DeliveryMetrics {
                messages_published: self.messages_published.load(Ordering::Relaxed),
                deliveries_completed: self.deliveries_completed.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                delivery_timeouts: self.delivery_timeouts.load(Ordering::Relaxed),
                retransmissions: self.retransmissions.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
                acks_discarded: self.acks_discarded.load(Ordering::Relaxed),
                avg_latency_ms: avg,
                latency_p50_ms: p50,
                latency_p95_ms: p95,
                latency_p99_ms: p99,
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
    pub delivery: DeliveryMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub reconnect_attempts: u64,
    pub pings_sent: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct DeliveryMetrics {
    pub messages_published: u64,
    pub deliveries_completed: u64,
    pub publish_failures: u64,
    pub delivery_timeouts: u64,
    pub retransmissions: u64,
    pub messages_received: u64,
    pub duplicates_suppressed: u64,
    pub acks_discarded: u64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
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
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_ping_sent();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.connection.connection_attempts, 1);
        assert_eq!(metrics.connection.connections_established, 1);
        assert_eq!(metrics.connection.pings_sent, 1);
        assert!(metrics.connection.connected);

        collector.mqtt_connection_lost();
        let metrics = collector.get_metrics();
        assert!(!metrics.connection.connected);
        assert_eq!(metrics.connection.connections_lost, 1);
    }

    #[test]
    fn test_delivery_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_message_published();
        collector.mqtt_retransmission();
        collector.mqtt_delivery_timeout();
        collector.mqtt_duplicate_suppressed();
        collector.mqtt_delivery_completed(Duration::from_millis(40));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.delivery.messages_published, 1);
        assert_eq!(metrics.delivery.retransmissions, 1);
        assert_eq!(metrics.delivery.delivery_timeouts, 1);
        assert_eq!(metrics.delivery.publish_failures, 1);
        assert_eq!(metrics.delivery.duplicates_suppressed, 1);
        assert_eq!(metrics.delivery.deliveries_completed, 1);
        assert!((metrics.delivery.avg_latency_ms - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.mqtt_message_published();
                        collector.mqtt_message_received();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.delivery.messages_published, 1000);
        assert_eq!(metrics.delivery.messages_received, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);
        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.mqtt_delivery_completed(Duration::from_millis(i));
        }

        assert_eq!(
            collector.delivery_latencies.lock().unwrap().len(),
            MAX_LATENCY_SAMPLES
        );
        assert_eq!(collector.get_metrics().delivery.deliveries_completed, 1500);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();
        collector.mqtt_connection_established();
        collector.mqtt_message_received();

        collector.reset();

        let metrics = collector.get_metrics();
        assert!(!metrics.connection.connected);
        assert_eq!(metrics.delivery.messages_received, 0);
        assert_eq!(metrics.delivery.avg_latency_ms, 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().get_metrics()).unwrap();
        assert!(json["connection"]["connected"].is_boolean());
        assert!(json["delivery"]["retransmissions"].is_u64());
    }
}
