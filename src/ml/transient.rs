//! リクエスト単位の一時バッファ計測
//!
//! 前処理テンソルと推論時の中間活性化はリースとして登録し、
//! リースのDropで必ず解放を記録する。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TrackerState {
    live_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    live_leases: AtomicUsize,
}

/// 一時バッファの使用量（現在値・ピーク値）
#[derive(Debug, Clone, Default)]
pub struct TransientTracker {
    state: Arc<TrackerState>,
}

impl TransientTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// `bytes` 分のリースを取得
    pub fn lease(&self, bytes: u64) -> TransientLease {
        let live = self.state.live_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.state.peak_bytes.fetch_max(live, Ordering::SeqCst);
        self.state.live_leases.fetch_add(1, Ordering::SeqCst);
        TransientLease {
            tracker: self.clone(),
            bytes,
        }
    }

    pub fn live_bytes(&self) -> u64 {
        self.state.live_bytes.load(Ordering::SeqCst)
    }

    pub fn peak_bytes(&self) -> u64 {
        self.state.peak_bytes.load(Ordering::SeqCst)
    }

    pub fn live_leases(&self) -> usize {
        self.state.live_leases.load(Ordering::SeqCst)
    }

    /// ピーク値を現在値に戻す
    pub fn reset_peak(&self) {
        self.state
            .peak_bytes
            .store(self.live_bytes(), Ordering::SeqCst);
    }
}

/// 登録済みの一時バッファ（Dropで解放）
#[derive(Debug)]
pub struct TransientLease {
    tracker: TransientTracker,
    bytes: u64,
}

impl TransientLease {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for TransientLease {
    fn drop(&mut self) {
        let state = &self.tracker.state;
        state.live_bytes.fetch_sub(self.bytes, Ordering::SeqCst);
        state.live_leases.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_release_and_peak() {
        let tracker = TransientTracker::new();
        let a = tracker.lease(100);
        let b = tracker.lease(50);
        assert_eq!(tracker.live_bytes(), 150);
        assert_eq!(tracker.live_leases(), 2);

        drop(a);
        assert_eq!(tracker.live_bytes(), 50);
        assert_eq!(tracker.peak_bytes(), 150);

        drop(b);
        assert_eq!(tracker.live_bytes(), 0);
        assert_eq!(tracker.live_leases(), 0);

        tracker.reset_peak();
        assert_eq!(tracker.peak_bytes(), 0);
    }
}
