//! Rolling metrics, threshold alerts and event fan-out
//!
//! [`Telemetry`] is owned by a pipeline's control task. It is never touched
//! from the real-time audio callbacks.

pub mod events;
pub mod window;

pub use events::{
    Alert, AlertKind, ChannelSubscriber, DropReason, EventHub, LoggingSubscriber, SubscriberError,
    SubscriberId, TelemetryEvent, TelemetrySubscriber, UnderrunFill,
};
pub use window::MetricWindow;

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::TelemetryConfig;

/// Map RSSI (dBm) to a 0..=100 signal percentage
pub fn signal_percent(rssi_dbm: i32) -> f64 {
    (2.0 * (rssi_dbm as f64 + 100.0)).clamp(0.0, 100.0)
}

/// Score 0..=100 for how regular the inter-arrival intervals are
pub fn buffer_health(intervals: &MetricWindow, max_acceptable_stddev_ms: f64) -> f64 {
    match intervals.stddev() {
        Some(stddev) if max_acceptable_stddev_ms > 0.0 => {
            (100.0 * (1.0 - stddev / max_acceptable_stddev_ms)).clamp(0.0, 100.0)
        }
        _ => 100.0,
    }
}

/// Point-in-time view for logs and dashboards
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub audio_latency_ms: Option<f64>,
    pub transport_latency_ms: Option<f64>,
    pub processing_time_ms: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub battery_percent: Option<f64>,
    pub signal_percent: Option<f64>,
    pub buffer_health: f64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub alerts_raised: u64,
}

pub struct Telemetry {
    config: TelemetryConfig,
    audio_latency: MetricWindow,
    transport_latency: MetricWindow,
    processing_time: MetricWindow,
    cpu: MetricWindow,
    intervals: MetricWindow,
    last_arrival: Option<Instant>,
    battery_percent: Option<f64>,
    signal_percent: Option<f64>,
    frames_sent: u64,
    frames_received: u64,
    alerts_raised: u64,
}

impl Telemetry {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            audio_latency: MetricWindow::new(config.latency_window),
            transport_latency: MetricWindow::new(config.latency_window),
            processing_time: MetricWindow::new(config.latency_window),
            cpu: MetricWindow::new(config.cpu_window),
            intervals: MetricWindow::new(config.health_window),
            last_arrival: None,
            battery_percent: None,
            signal_percent: None,
            frames_sent: 0,
            frames_received: 0,
            alerts_raised: 0,
            config,
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Capture to hand-off, end to end
    pub fn record_audio_latency(&mut self, latency: Duration) {
        self.audio_latency.add(as_ms(latency));
        self.frames_sent += 1;
    }

    /// Write to acknowledgement
    pub fn record_transport_latency(&mut self, latency: Duration) {
        self.transport_latency.add(as_ms(latency));
    }

    /// Encode and chunk time for one frame
    pub fn record_processing_time(&mut self, elapsed: Duration) {
        self.processing_time.add(as_ms(elapsed));
    }

    pub fn record_cpu(&mut self, percent: f64) {
        self.cpu.add(percent.clamp(0.0, 100.0));
    }

    pub fn set_battery(&mut self, percent: Option<f64>) {
        self.battery_percent = percent.map(|p| p.clamp(0.0, 100.0));
    }

    pub fn record_rssi(&mut self, rssi_dbm: i32) {
        self.signal_percent = Some(signal_percent(rssi_dbm));
    }

    pub fn clear_signal(&mut self) {
        self.signal_percent = None;
    }

    /// Record a frame arrival on the receive side
    pub fn record_arrival(&mut self, now: Instant) {
        if let Some(previous) = self.last_arrival.replace(now) {
            self.intervals.add(as_ms(now.saturating_duration_since(previous)));
        }
        self.frames_received += 1;
    }

    pub fn buffer_health(&self) -> f64 {
        buffer_health(&self.intervals, self.config.max_acceptable_stddev_ms)
    }

    pub fn transport_latency_ms(&self) -> Option<f64> {
        self.transport_latency.average()
    }

    /// Compare every metric against its threshold.
    ///
    /// Averages alert when strictly above their threshold; battery and signal
    /// alert when strictly below. Alerts are raised on every evaluation the
    /// condition holds.
    pub fn evaluate(&mut self) -> Vec<Alert> {
        let at = Utc::now();
        let c = &self.config;
        let mut alerts = Vec::new();

        let above = [
            (AlertKind::AudioLatency, self.audio_latency.average(), c.audio_latency_threshold_ms),
            (AlertKind::TransportLatency, self.transport_latency.average(), c.transport_latency_threshold_ms),
            (AlertKind::ProcessingTime, self.processing_time.average(), c.processing_time_threshold_ms),
        ];
        for (kind, value, threshold) in above {
            if let Some(value) = value.filter(|v| *v > threshold) {
                alerts.push(Alert { kind, value, threshold, at });
            }
        }

        let below = [
            (AlertKind::LowBattery, self.battery_percent, c.battery_threshold_percent),
            (AlertKind::WeakSignal, self.signal_percent, c.signal_threshold_percent),
        ];
        for (kind, value, threshold) in below {
            if let Some(value) = value.filter(|v| *v < threshold) {
                alerts.push(Alert { kind, value, threshold, at });
            }
        }

        self.alerts_raised += alerts.len() as u64;
        alerts
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            audio_latency_ms: self.audio_latency.average(),
            transport_latency_ms: self.transport_latency.average(),
            processing_time_ms: self.processing_time.average(),
            cpu_percent: self.cpu.average(),
            battery_percent: self.battery_percent,
            signal_percent: self.signal_percent,
            buffer_health: self.buffer_health(),
            frames_sent: self.frames_sent,
            frames_received: self.frames_received,
            alerts_raised: self.alerts_raised,
        }
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry() -> Telemetry {
        Telemetry::new(TelemetryConfig::default())
    }

    fn kinds(alerts: &[Alert]) -> Vec<AlertKind> {
        alerts.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_audio_latency_alert_is_strict() {
        let mut t = telemetry();
        t.record_audio_latency(Duration::from_millis(100));
        assert!(t.evaluate().is_empty());

        let mut t = telemetry();
        t.record_audio_latency(Duration::from_millis(101));
        let alerts = t.evaluate();
        assert_eq!(kinds(&alerts), vec![AlertKind::AudioLatency]);
        assert!((alerts[0].value - 101.0).abs() < 1e-9);
        assert_eq!(alerts[0].threshold, 100.0);
    }

    #[test]
    fn test_alert_repeats_while_condition_holds() {
        let mut t = telemetry();
        t.record_transport_latency(Duration::from_millis(250));
        assert_eq!(kinds(&t.evaluate()), vec![AlertKind::TransportLatency]);
        assert_eq!(kinds(&t.evaluate()), vec![AlertKind::TransportLatency]);
        assert_eq!(t.snapshot().alerts_raised, 2);
    }

    #[test]
    fn test_window_averages_recent_samples() {
        let mut t = telemetry();
        for _ in 0..50 {
            t.record_processing_time(Duration::from_millis(80));
        }
        assert_eq!(kinds(&t.evaluate()), vec![AlertKind::ProcessingTime]);

        // Window of 50 pushes every slow sample out
        for _ in 0..50 {
            t.record_processing_time(Duration::from_millis(10));
        }
        assert!(t.evaluate().is_empty());
    }

    #[test]
    fn test_battery_and_signal_alert_below_threshold() {
        let mut t = telemetry();
        t.set_battery(Some(20.0));
        t.record_rssi(-85); // 30%
        assert!(t.evaluate().is_empty());

        t.set_battery(Some(19.0));
        t.record_rssi(-86); // 28%
        assert_eq!(
            kinds(&t.evaluate()),
            vec![AlertKind::LowBattery, AlertKind::WeakSignal]
        );
    }

    #[test]
    fn test_signal_percent_mapping() {
        assert_eq!(signal_percent(-100), 0.0);
        assert_eq!(signal_percent(-120), 0.0);
        assert_eq!(signal_percent(-75), 50.0);
        assert_eq!(signal_percent(-50), 100.0);
        assert_eq!(signal_percent(-30), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_health_tracks_jitter() {
        let mut t = telemetry();
        assert_eq!(t.buffer_health(), 100.0);

        for _ in 0..11 {
            t.record_arrival(Instant::now());
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        assert_eq!(t.buffer_health(), 100.0);

        // Alternate 0 ms and 100 ms gaps: stddev 50 ms
        for i in 0..11 {
            t.record_arrival(Instant::now());
            let gap = if i % 2 == 0 { 100 } else { 0 };
            tokio::time::advance(Duration::from_millis(gap)).await;
        }
        assert!(t.buffer_health() < 1.0);
        assert_eq!(t.snapshot().frames_received, 22);
    }
}
