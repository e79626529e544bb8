//! Fixed-capacity PCM queue between the network and the output device
//!
//! The stream session is the only writer and the playback driver the only
//! reader. Overflow drops the oldest frames so playback stays close to the
//! newest steering intent; underflow pads with silence so the device callback
//! never waits.

use super::chunk::AudioChunk;
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Point-in-time buffer telemetry
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BufferStats {
    /// Frames currently queued
    pub fill_level: usize,
    pub capacity_frames: usize,
    pub underrun_count: u64,
    pub overflow_count: u64,
    /// Frames evicted by overflow since creation
    pub dropped_frames: u64,
}

impl BufferStats {
    pub fn fill_ratio(&self) -> f32 {
        if self.capacity_frames == 0 {
            return 0.0;
        }
        self.fill_level as f32 / self.capacity_frames as f32
    }
}

struct Counters {
    fill_samples: AtomicUsize,
    underruns: AtomicU64,
    overflows: AtomicU64,
    dropped_frames: AtomicU64,
}

/// Thread-safe ring buffer of interleaved f32 frames
///
/// Cloning shares the same storage.
#[derive(Clone)]
pub struct AudioRingBuffer {
    samples: Arc<Mutex<HeapRb<f32>>>,
    counters: Arc<Counters>,
    capacity_frames: usize,
    channels: usize,
}

impl AudioRingBuffer {
    /// Create a buffer holding `capacity_frames` frames of `channels` samples
    pub fn new(capacity_frames: usize, channels: u16) -> Self {
        let capacity_frames = capacity_frames.max(1);
        let channels = usize::from(channels.max(1));
        Self {
            samples: Arc::new(Mutex::new(HeapRb::new(capacity_frames * channels))),
            counters: Arc::new(Counters {
                fill_samples: AtomicUsize::new(0),
                underruns: AtomicU64::new(0),
                overflows: AtomicU64::new(0),
                dropped_frames: AtomicU64::new(0),
            }),
            capacity_frames,
            channels,
        }
    }

    /// Queue a decoded chunk
    pub fn push(&self, chunk: &AudioChunk) {
        self.push_samples(&chunk.frames);
    }

    /// Queue interleaved samples, evicting the oldest frames if needed
    ///
    /// A trailing partial frame is ignored. Never fails.
    pub fn push_samples(&self, samples: &[f32]) {
        let whole = samples.len() - samples.len() % self.channels;
        let mut incoming = &samples[..whole];
        if incoming.is_empty() {
            return;
        }

        let mut dropped_samples = 0usize;
        let capacity = self.capacity_frames * self.channels;
        if incoming.len() > capacity {
            // Only the newest `capacity` samples of this push can survive
            dropped_samples += incoming.len() - capacity;
            incoming = &incoming[incoming.len() - capacity..];
        }

        let mut rb = self.samples.lock();
        let vacant = rb.vacant_len();
        if incoming.len() > vacant {
            let evict = incoming.len() - vacant;
            dropped_samples += rb.skip(evict);
        }
        let written = rb.push_slice(incoming);
        let fill = rb.occupied_len();
        drop(rb);

        debug_assert_eq!(written, incoming.len());
        self.counters.fill_samples.store(fill, Ordering::Release);
        if dropped_samples > 0 {
            self.counters.overflows.fetch_add(1, Ordering::Relaxed);
            self.counters
                .dropped_frames
                .fetch_add((dropped_samples / self.channels) as u64, Ordering::Relaxed);
        }
    }

    /// Read exactly `n_frames` frames, padding with silence when short
    pub fn pull(&self, n_frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; n_frames * self.channels];
        self.pull_into(&mut out);
        out
    }

    /// Fill `out` completely, padding with silence when short
    ///
    /// Returns the number of frames that came from the queue. Only whole
    /// frames are read; a trailing partial frame in `out` is silenced. Does
    /// not allocate, so it is safe to call from a device callback.
    pub fn pull_into(&self, out: &mut [f32]) -> usize {
        let whole = out.len() - out.len() % self.channels;
        let (frames, tail) = out.split_at_mut(whole);
        tail.fill(0.0);
        if frames.is_empty() {
            return 0;
        }

        let mut rb = self.samples.lock();
        let read = rb.pop_slice(frames);
        let fill = rb.occupied_len();
        drop(rb);

        self.counters.fill_samples.store(fill, Ordering::Release);
        if read < frames.len() {
            frames[read..].fill(0.0);
            self.counters.underruns.fetch_add(1, Ordering::Relaxed);
        }
        read / self.channels
    }

    /// Drop everything queued; counters are kept
    pub fn clear(&self) {
        let mut rb = self.samples.lock();
        rb.clear();
        self.counters.fill_samples.store(0, Ordering::Release);
    }

    /// Frames currently queued
    pub fn fill_level(&self) -> usize {
        self.counters.fill_samples.load(Ordering::Acquire) / self.channels
    }

    pub fn fill_ratio(&self) -> f32 {
        self.fill_level() as f32 / self.capacity_frames as f32
    }

    pub fn is_empty(&self) -> bool {
        self.fill_level() == 0
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    pub fn underrun_count(&self) -> u64 {
        self.counters.underruns.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.counters.overflows.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.counters.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            fill_level: self.fill_level(),
            capacity_frames: self.capacity_frames,
            underrun_count: self.underrun_count(),
            overflow_count: self.overflow_count(),
            dropped_frames: self.dropped_frames(),
        }
    }
}

impl std::fmt::Debug for AudioRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRingBuffer")
            .field("capacity_frames", &self.capacity_frames)
            .field("channels", &self.channels)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(range: std::ops::Range<i32>) -> Vec<f32> {
        range.map(|i| i as f32).collect()
    }

    #[test]
    fn test_new_buffer() {
        let buffer = AudioRingBuffer::new(1024, 2);
        assert_eq!(buffer.capacity_frames(), 1024);
        assert_eq!(buffer.channels(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats(), BufferStats {
            capacity_frames: 1024,
            ..Default::default()
        });
    }

    #[test]
    fn test_push_pull() {
        let buffer = AudioRingBuffer::new(1024, 1);
        let data = ramp(0..100);
        buffer.push_samples(&data);
        assert_eq!(buffer.fill_level(), 100);

        assert_eq!(buffer.pull(100), data);
        assert!(buffer.is_empty());
        assert_eq!(buffer.underrun_count(), 0);
    }

    #[test]
    fn test_overflow_keeps_newest_frames() {
        let buffer = AudioRingBuffer::new(10, 1);
        buffer.push_samples(&ramp(0..6));
        buffer.push_samples(&ramp(6..20));

        assert_eq!(buffer.fill_level(), 10);
        assert_eq!(buffer.overflow_count(), 1);
        assert_eq!(buffer.dropped_frames(), 10);
        assert_eq!(buffer.pull(10), ramp(10..20));
    }

    #[test]
    fn test_single_push_larger_than_capacity() {
        let buffer = AudioRingBuffer::new(8, 1);
        buffer.push_samples(&ramp(0..3));
        buffer.push_samples(&ramp(100..120));

        assert_eq!(buffer.pull(8), ramp(112..120));
        assert_eq!(buffer.overflow_count(), 1);
        assert_eq!(buffer.dropped_frames(), 15);
    }

    #[test]
    fn test_overflow_evicts_whole_frames() {
        let buffer = AudioRingBuffer::new(4, 2);
        // Frames: (0,1) (2,3) (4,5) (6,7)
        buffer.push_samples(&ramp(0..8));
        buffer.push_samples(&ramp(8..12));

        assert_eq!(buffer.pull(4), ramp(4..12));
        assert_eq!(buffer.dropped_frames(), 2);
    }

    #[test]
    fn test_underrun_pads_with_silence() {
        let buffer = AudioRingBuffer::new(64, 2);
        buffer.push_samples(&[1.0, 1.0, 2.0, 2.0]);

        let out = buffer.pull(4);
        assert_eq!(out.len(), 8);
        assert_eq!(out, vec![1.0, 1.0, 2.0, 2.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(buffer.underrun_count(), 1);

        // Empty pull is still exactly n frames and counts once
        assert_eq!(buffer.pull(3), vec![0.0; 6]);
        assert_eq!(buffer.underrun_count(), 2);
    }

    #[test]
    fn test_full_pull_does_not_count_underrun() {
        let buffer = AudioRingBuffer::new(16, 1);
        buffer.push_samples(&ramp(0..8));
        let mut out = [9.0f32; 8];
        assert_eq!(buffer.pull_into(&mut out), 8);
        assert_eq!(buffer.underrun_count(), 0);
    }

    #[test]
    fn test_pull_into_misaligned_slice_keeps_frames_aligned() {
        let buffer = AudioRingBuffer::new(16, 2);
        buffer.push_samples(&[1.0, 2.0, 3.0, 4.0]);

        let mut out = [9.0f32; 3];
        assert_eq!(buffer.pull_into(&mut out), 1);
        assert_eq!(out, [1.0, 2.0, 0.0]);
        assert_eq!(buffer.underrun_count(), 0);

        // The next read still starts on a frame boundary
        assert_eq!(buffer.pull(1), vec![3.0, 4.0]);
    }

    #[test]
    fn test_partial_frame_ignored() {
        let buffer = AudioRingBuffer::new(16, 2);
        buffer.push_samples(&[1.0, 2.0, 3.0]);
        assert_eq!(buffer.fill_level(), 1);
    }

    #[test]
    fn test_clear() {
        let buffer = AudioRingBuffer::new(100, 1);
        buffer.push_samples(&[1.0, 2.0, 3.0]);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.pull(1), vec![0.0]);
    }

    #[test]
    fn test_clone_shares_buffer() {
        let writer = AudioRingBuffer::new(100, 1);
        let reader = writer.clone();

        writer.push_samples(&[1.0, 2.0, 3.0]);
        assert_eq!(reader.fill_level(), 3);
        assert_eq!(reader.pull(3), vec![1.0, 2.0, 3.0]);
        assert!(writer.is_empty());
    }

    #[test]
    fn test_concurrent_writer_reader() {
        let buffer = AudioRingBuffer::new(256, 1);
        let writer = buffer.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000 {
                writer.push_samples(&[i as f32; 16]);
            }
        });
        for _ in 0..1000 {
            assert_eq!(buffer.pull(32).len(), 32);
        }
        handle.join().unwrap();
        assert!(buffer.fill_level() <= 256);
    }
}
