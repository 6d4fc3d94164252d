//! PCM ring buffer between capture and analysis.
//!
//! Exactly one writer (the capture worker) and one reader (the analyzer)
//! per buffer; the accounting below depends on that discipline. The writer
//! never blocks: when the reader falls behind, the oldest samples are
//! overwritten and the loss is surfaced through a monotonic counter at the
//! next read.
//!
//! Reads are positional rather than consuming so the analyzer can extract
//! overlapping windows (stride < window length).

use std::sync::Mutex;

/// Result of one window extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRead {
    pub samples: Vec<i16>,
    /// Absolute index of the first sample since capture start.
    pub start_index: u64,
}

struct RingInner {
    buf: Vec<i16>,
    /// Total samples ever written.
    written: u64,
    /// Absolute index of the next window start.
    read_pos: u64,
    /// Samples overwritten before the reader got to them.
    lost: u64,
}

/// Overwriting SPSC ring of mono s16 samples.
pub struct PcmRing {
    inner: Mutex<RingInner>,
    capacity: usize,
}

impl PcmRing {
    /// `capacity_samples` should cover at least one analysis window plus a
    /// margin; it is rounded up to one sample minimum.
    pub fn new(capacity_samples: usize) -> Self {
        let capacity = capacity_samples.max(1);
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0; capacity],
                written: 0,
                read_pos: 0,
                lost: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append samples, overwriting the oldest when full. Writer-side only.
    pub fn push(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        // Only the tail can matter when one push exceeds the capacity.
        let tail = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };
        let skipped = (samples.len() - tail.len()) as u64;
        inner.written += skipped;

        for &sample in tail {
            let idx = (inner.written % self.capacity as u64) as usize;
            inner.buf[idx] = sample;
            inner.written += 1;
        }
    }

    /// Copy the next fixed-length window and advance by `stride`.
    /// Reader-side only. Returns `None` until enough samples exist.
    pub fn next_window(&self, window_len: usize, stride: usize) -> Option<WindowRead> {
        if window_len == 0 || window_len > self.capacity {
            return None;
        }
        let mut inner = self.inner.lock().ok()?;

        // Catch up over any overwritten span before reading.
        let oldest = inner.written.saturating_sub(self.capacity as u64);
        if inner.read_pos < oldest {
            let lost_now = oldest - inner.read_pos;
            inner.lost += lost_now;
            inner.read_pos = oldest;
        }

        if inner.written - inner.read_pos < window_len as u64 {
            return None;
        }

        let start = inner.read_pos;
        let mut samples = Vec::with_capacity(window_len);
        for offset in 0..window_len as u64 {
            let idx = ((start + offset) % self.capacity as u64) as usize;
            samples.push(inner.buf[idx]);
        }
        inner.read_pos = start + stride.max(1) as u64;

        Some(WindowRead {
            samples,
            start_index: start,
        })
    }

    /// Monotonic count of samples lost to overwriting.
    pub fn lost_samples(&self) -> u64 {
        self.inner.lock().map(|i| i.lost).unwrap_or(0)
    }

    /// Total samples ever written.
    pub fn written(&self) -> u64 {
        self.inner.lock().map(|i| i.written).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_overlap_when_stride_is_shorter() {
        let ring = PcmRing::new(16);
        ring.push(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let first = ring.next_window(4, 2).expect("window");
        assert_eq!(first.samples, vec![1, 2, 3, 4]);
        assert_eq!(first.start_index, 0);

        let second = ring.next_window(4, 2).expect("window");
        assert_eq!(second.samples, vec![3, 4, 5, 6]);
        assert_eq!(second.start_index, 2);
    }

    #[test]
    fn not_enough_data_returns_none() {
        let ring = PcmRing::new(16);
        ring.push(&[1, 2, 3]);
        assert_eq!(ring.next_window(4, 2), None);
        ring.push(&[4]);
        assert!(ring.next_window(4, 2).is_some());
    }

    #[test]
    fn overwrite_counts_lost_samples_and_reader_catches_up() {
        let ring = PcmRing::new(8);
        // 12 samples through an 8-slot ring: 4 oldest are overwritten.
        ring.push(&[0, 1, 2, 3, 4, 5, 6, 7]);
        ring.push(&[8, 9, 10, 11]);

        let window = ring.next_window(4, 4).expect("window");
        assert_eq!(window.start_index, 4);
        assert_eq!(window.samples, vec![4, 5, 6, 7]);
        assert_eq!(ring.lost_samples(), 4);

        // Loss counter is monotonic and unchanged by further clean reads.
        let window = ring.next_window(4, 4).expect("window");
        assert_eq!(window.samples, vec![8, 9, 10, 11]);
        assert_eq!(ring.lost_samples(), 4);
    }

    #[test]
    fn giant_push_keeps_only_the_tail() {
        let ring = PcmRing::new(4);
        let big: Vec<i16> = (0..100).collect();
        ring.push(&big);
        assert_eq!(ring.written(), 100);

        let window = ring.next_window(4, 4).expect("window");
        assert_eq!(window.samples, vec![96, 97, 98, 99]);
        assert_eq!(ring.lost_samples(), 96);
    }

    #[test]
    fn capture_to_analyzer_order_is_fifo() {
        let ring = PcmRing::new(64);
        for chunk in (0..32).collect::<Vec<i16>>().chunks(5) {
            ring.push(chunk);
        }
        let mut seen = Vec::new();
        while let Some(w) = ring.next_window(8, 8) {
            seen.extend(w.samples);
        }
        assert_eq!(seen, (0..32).collect::<Vec<i16>>());
    }
}
