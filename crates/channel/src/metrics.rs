//! Encryption metrics
//!
//! Counters plus moving averages over the last [`LATENCY_WINDOW`] samples.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

pub const LATENCY_WINDOW: usize = 100;

/// Bounded ring of latency samples with a running sum
#[derive(Debug, Clone, Default)]
struct LatencyRing {
    samples: VecDeque<f64>,
    sum: f64,
}

impl LatencyRing {
    fn push(&mut self, micros: f64) {
        if self.samples.len() == LATENCY_WINDOW {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(micros);
        self.sum += micros;
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    messages_encrypted: u64,
    messages_decrypted: u64,
    bytes_encrypted: u64,
    bytes_decrypted: u64,
    encryption_errors: u64,
    decryption_errors: u64,
    key_rotations: u64,
    handshakes: u64,
    reconnects: u64,
    encrypt_latency: LatencyRing,
    decrypt_latency: LatencyRing,
}

/// Point-in-time copy of the metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_encrypted: u64,
    pub messages_decrypted: u64,
    pub bytes_encrypted: u64,
    pub bytes_decrypted: u64,
    pub encryption_errors: u64,
    pub decryption_errors: u64,
    pub key_rotations: u64,
    pub handshakes: u64,
    pub reconnects: u64,
    pub avg_encrypt_micros: f64,
    pub avg_decrypt_micros: f64,
}

#[derive(Debug, Default)]
pub struct EncryptionMetrics {
    inner: Mutex<Counters>,
}

impl EncryptionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_encrypt(&self, bytes: usize, elapsed: Duration) {
        let mut c = self.inner.lock();
        c.messages_encrypted += 1;
        c.bytes_encrypted += bytes as u64;
        c.encrypt_latency.push(elapsed.as_secs_f64() * 1e6);
    }

    pub fn record_decrypt(&self, bytes: usize, elapsed: Duration) {
        let mut c = self.inner.lock();
        c.messages_decrypted += 1;
        c.bytes_decrypted += bytes as u64;
        c.decrypt_latency.push(elapsed.as_secs_f64() * 1e6);
    }

    pub fn record_encrypt_error(&self) {
        self.inner.lock().encryption_errors += 1;
    }

    pub fn record_decrypt_error(&self) {
        self.inner.lock().decryption_errors += 1;
    }

    pub fn record_rotation(&self) {
        self.inner.lock().key_rotations += 1;
    }

    pub fn record_handshake(&self) {
        self.inner.lock().handshakes += 1;
    }

    pub fn record_reconnect(&self) {
        self.inner.lock().reconnects += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.inner.lock();
        MetricsSnapshot {
            messages_encrypted: c.messages_encrypted,
            messages_decrypted: c.messages_decrypted,
            bytes_encrypted: c.bytes_encrypted,
            bytes_decrypted: c.bytes_decrypted,
            encryption_errors: c.encryption_errors,
            decryption_errors: c.decryption_errors,
            key_rotations: c.key_rotations,
            handshakes: c.handshakes,
            reconnects: c.reconnects,
            avg_encrypt_micros: c.encrypt_latency.average(),
            avg_decrypt_micros: c.decrypt_latency.average(),
        }
    }
}
