//! Asynchronous frame-to-disk streaming.
//!
//! A [`FileStreamer`] owns one thread per acquisition. It chases the ring's
//! monotonic counter, locking out one frame at a time and appending it to a
//! rolling set of raw binary files. If the writer cannot keep up, the frame
//! is logged as dropped and the target snaps forward to the ring head; the
//! acquisition itself is never back-pressured.
//!
//! # File format
//!
//! Frames are concatenated with no header. Processed volumes are interleaved
//! complex32 `(re, im)` voxels in row-major A-line-major order; unprocessed
//! spectra are raw little-endian u16 samples. Files roll over at the
//! configured size limit with suffixes `_0001`, `_0002`, ...

use anyhow::{Context, Result};
use num_complex::Complex;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::data::ring::{FrameRing, LockOutError};

const BYTES_PER_GB: u64 = 1 << 30;
const WRITE_CHUNK: usize = 1 << 20;
/// Frames of headroom granted at start so the scanners settle before the
/// first frame is committed to disk.
const SETTLE_FRAMES: i64 = 5;
/// How long one lock-out waits before the streamer rechecks its run flag.
const LOCK_DEADLINE: Duration = Duration::from_millis(250);

/// On-disk layout of an acquisition stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamFormat {
    /// Processed complex-valued volumes.
    RawVolume,
    /// Unprocessed u16 spectra.
    RawSpectra,
}

/// Ring element that can be written to disk byte-for-byte.
pub trait RingElement: Copy + Default + Send + Sync + 'static {
    fn as_bytes(frame: &[Self]) -> &[u8];
}

impl RingElement for u16 {
    fn as_bytes(frame: &[Self]) -> &[u8] {
        // SAFETY: u16 is plain data with no padding; the length in bytes is
        // exact.
        unsafe {
            std::slice::from_raw_parts(frame.as_ptr().cast::<u8>(), std::mem::size_of_val(frame))
        }
    }
}

impl RingElement for Complex<f32> {
    fn as_bytes(frame: &[Self]) -> &[u8] {
        // SAFETY: Complex<f32> is repr(C) { re: f32, im: f32 } with no
        // padding, so the buffer is a contiguous run of f32 pairs.
        unsafe {
            std::slice::from_raw_parts(frame.as_ptr().cast::<u8>(), std::mem::size_of_val(frame))
        }
    }
}

/// Parameters for one acquisition stream.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Base path; `.bin` and rollover suffixes are appended.
    pub path: PathBuf,
    /// Size limit per file in gigabytes.
    pub max_gb: f64,
    /// Elements written per frame (may be less than the ring element
    /// capacity when repeat aggregation compacts frames).
    pub frame_len: usize,
    /// Stop after this many frames; `None` streams until stopped.
    pub n_frames: Option<usize>,
    /// Explicit first frame count; defaults to the ring head plus a settling
    /// margin.
    pub start_count: Option<i64>,
}

/// Chunked raw-bytes file writer.
struct RawWriter {
    file: File,
    path: PathBuf,
    bytes_written: u64,
}

impl RawWriter {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create output file {}", path.display()))?;
        info!(path = %path.display(), "opened stream file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            bytes_written: 0,
        })
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        for chunk in bytes.chunks(WRITE_CHUNK) {
            self.file
                .write_all(chunk)
                .with_context(|| format!("failed to write to {}", self.path.display()))?;
        }
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn finish(mut self, frames: usize) {
        if let Err(e) = self.file.flush() {
            warn!(error = %e, "failed to flush stream file");
        }
        info!(
            path = %self.path.display(),
            frames,
            bytes = self.bytes_written,
            "closed stream file"
        );
    }
}

/// Numbered output path: `<base>.bin`, `<base>_0001.bin`, ...
fn file_path(base: &Path, index: usize) -> PathBuf {
    let stem = base.with_extension("");
    if index == 0 {
        stem.with_extension("bin")
    } else {
        let mut name = stem.as_os_str().to_os_string();
        name.push(format!("_{index:04}.bin"));
        PathBuf::from(name)
    }
}

/// Handle to a running stream thread.
pub struct FileStreamer {
    running: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FileStreamer {
    /// Start draining `ring` to disk on a dedicated thread.
    pub fn start<T: RingElement>(ring: Arc<FrameRing<T>>, config: StreamConfig) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let finished = Arc::new(AtomicBool::new(false));
        let handle = {
            let running = Arc::clone(&running);
            let finished = Arc::clone(&finished);
            thread::Builder::new()
                .name("file-streamer".into())
                .spawn(move || {
                    if let Err(e) = stream_frames(&ring, &config, &running) {
                        warn!(error = %e, "stream ended with error");
                    }
                    finished.store(true, Ordering::Release);
                })
                .expect("failed to spawn stream thread")
        };
        Self {
            running,
            finished,
            handle: Some(handle),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.finished.load(Ordering::Acquire)
    }

    /// True once the thread has drained its final frame and closed its file,
    /// whether it stopped on request or reached its frame count.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Request a stop and join the stream thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FileStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn stream_frames<T: RingElement>(
    ring: &Arc<FrameRing<T>>,
    config: &StreamConfig,
    running: &AtomicBool,
) -> Result<()> {
    let frame_bytes = (config.frame_len * std::mem::size_of::<T>()) as u64;
    let max_frames_per_file =
        (((config.max_gb * BYTES_PER_GB as f64) as u64) / frame_bytes).max(1);
    let mut target = config
        .start_count
        .unwrap_or_else(|| ring.count() + SETTLE_FRAMES);

    info!(
        first_frame = target,
        max_frames_per_file,
        frame_bytes,
        path = %config.path.display(),
        "stream started"
    );

    let mut writer: Option<RawWriter> = None;
    let mut file_index = 0usize;
    let mut frames_in_file = 0usize;
    let mut streamed = 0usize;

    while running.load(Ordering::Acquire)
        && config.n_frames.map_or(true, |n| streamed < n)
    {
        match ring.lock_out(target, LOCK_DEADLINE) {
            Ok(frame) => {
                if frame.count() == target {
                    target += 1;
                    if writer.is_none() {
                        frames_in_file = 0;
                        writer = Some(RawWriter::create(&file_path(&config.path, file_index))?);
                    }
                    if let Some(out) = writer.as_mut() {
                        out.write_frame(T::as_bytes(&frame[..config.frame_len]))?;
                    }
                    frames_in_file += 1;
                    streamed += 1;
                    if frames_in_file as u64 >= max_frames_per_file {
                        if let Some(w) = writer.take() {
                            w.finish(frames_in_file);
                        }
                        file_index += 1;
                    }
                } else {
                    // Fell behind the producer; resume at the head.
                    warn!(
                        requested = target,
                        got = frame.count(),
                        "writer cannot keep up, dropping frames"
                    );
                    target = ring.count() + 1;
                }
            }
            Err(LockOutError::Timeout) => {
                debug!(frame = target, "lock-out timed out waiting for frame");
            }
            Err(LockOutError::Busy) => {
                warn!("another reader holds the ring lock-out");
                thread::sleep(LOCK_DEADLINE);
            }
        }
    }

    if let Some(w) = writer.take() {
        w.finish(frames_in_file);
    }
    info!(streamed, "stream finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while !cond() {
            if start.elapsed() > timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_file_path_suffixes() {
        let base = PathBuf::from("/tmp/scan");
        assert_eq!(file_path(&base, 0), PathBuf::from("/tmp/scan.bin"));
        assert_eq!(file_path(&base, 1), PathBuf::from("/tmp/scan_0001.bin"));
        assert_eq!(file_path(&base, 12), PathBuf::from("/tmp/scan_0012.bin"));
        // A supplied extension is replaced, not doubled.
        assert_eq!(
            file_path(&PathBuf::from("/tmp/scan.bin"), 0),
            PathBuf::from("/tmp/scan.bin")
        );
    }

    #[test]
    fn test_streams_requested_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("acq");
        let ring = FrameRing::<u16>::new(8, 4);

        let mut streamer = FileStreamer::start(
            Arc::clone(&ring),
            StreamConfig {
                path: base.clone(),
                max_gb: 1.0,
                frame_len: 4,
                n_frames: Some(3),
                start_count: Some(0),
            },
        );

        for i in 0..5u16 {
            ring.push(&vec![i; 4]);
            thread::sleep(Duration::from_millis(10));
        }
        assert!(wait_for(|| streamer.is_finished(), Duration::from_secs(2)));
        streamer.stop();

        let bytes = std::fs::read(base.with_extension("bin")).unwrap();
        assert_eq!(bytes.len(), 3 * 4 * 2);
        // Frame payloads 0, 1, 2 in push order.
        for (frame, expected) in bytes.chunks(8).zip(0u16..) {
            for sample in frame.chunks(2) {
                assert_eq!(u16::from_le_bytes([sample[0], sample[1]]), expected);
            }
        }
    }

    #[test]
    fn test_rollover_after_max_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("roll");
        let ring = FrameRing::<u16>::new(8, 16);
        // 32 bytes per frame; size the limit to two frames per file.
        let max_gb = (2 * 32) as f64 / BYTES_PER_GB as f64;

        let mut streamer = FileStreamer::start(
            Arc::clone(&ring),
            StreamConfig {
                path: base.clone(),
                max_gb,
                frame_len: 16,
                n_frames: Some(5),
                start_count: Some(0),
            },
        );

        for i in 0..6u16 {
            ring.push(&vec![i; 16]);
            thread::sleep(Duration::from_millis(10));
        }
        assert!(wait_for(|| streamer.is_finished(), Duration::from_secs(2)));
        streamer.stop();

        assert_eq!(
            std::fs::read(base.with_extension("bin")).unwrap().len(),
            2 * 32
        );
        assert_eq!(
            std::fs::read(dir.path().join("roll_0001.bin")).unwrap().len(),
            2 * 32
        );
        assert_eq!(
            std::fs::read(dir.path().join("roll_0002.bin")).unwrap().len(),
            32
        );
    }

    #[test]
    fn test_overrun_drops_and_resumes_at_head() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("fast");
        // Tiny ring, fast producer: the writer must drop but every written
        // frame carries a strictly increasing stamp.
        let ring = FrameRing::<u16>::new(4, 8);

        let mut streamer = FileStreamer::start(
            Arc::clone(&ring),
            StreamConfig {
                path: base.clone(),
                max_gb: 1.0,
                frame_len: 8,
                n_frames: None,
                start_count: Some(0),
            },
        );

        for i in 0..200u16 {
            ring.push(&vec![i; 8]);
            if i % 16 == 0 {
                thread::sleep(Duration::from_millis(2));
            }
        }
        thread::sleep(Duration::from_millis(100));
        streamer.stop();

        let bytes = std::fs::read(base.with_extension("bin")).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(bytes.len() % 16, 0);
        let stamps: Vec<u16> = bytes
            .chunks(16)
            .map(|f| u16::from_le_bytes([f[0], f[1]]))
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert!(stamps.len() <= 200);
    }

    #[test]
    fn test_complex_frames_interleave_components() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("vol");
        let ring = FrameRing::<Complex<f32>>::new(4, 2);

        let mut streamer = FileStreamer::start(
            Arc::clone(&ring),
            StreamConfig {
                path: base.clone(),
                max_gb: 1.0,
                frame_len: 2,
                n_frames: Some(1),
                start_count: Some(0),
            },
        );

        ring.push(&[Complex::new(1.5f32, -2.5), Complex::new(3.0, 4.0)]);
        assert!(wait_for(|| streamer.is_finished(), Duration::from_secs(2)));
        streamer.stop();

        let bytes = std::fs::read(base.with_extension("bin")).unwrap();
        assert_eq!(bytes.len(), 16);
        let vals: Vec<f32> = bytes
            .chunks(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(vals, vec![1.5, -2.5, 3.0, 4.0]);
    }
}
