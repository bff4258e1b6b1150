//! Client-facing message and state types.
//!
//! The client never calls into the controller directly: it enqueues
//! [`OctCommand`] messages into a bounded queue, polls the atomic
//! [`ScanState`], and reads display data through non-blocking
//! [`Snapshot`] slots.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::config::{ImageConfig, ProcessingConfig, ScanPattern};

/// Lifecycle state of the instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanState {
    /// Devices are not open. Terminal when open fails.
    Unopened = 0,
    /// Devices open, configuration incomplete.
    Open = 1,
    /// Image, processing and scan pattern all configured.
    Ready = 2,
    /// Galvos driven, frames grabbed and processed.
    Scanning = 3,
    /// Scanning with the file streamer attached.
    Acquiring = 4,
    /// Irrecoverable device failure; close and reopen.
    Error = 5,
}

impl ScanState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ScanState::Unopened,
            1 => ScanState::Open,
            2 => ScanState::Ready,
            3 => ScanState::Scanning,
            4 => ScanState::Acquiring,
            _ => ScanState::Error,
        }
    }
}

/// Shared atomic cell holding the current [`ScanState`].
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ScanState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ScanState {
        ScanState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ScanState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Parameters of one acquisition-to-disk run.
#[derive(Clone, Debug)]
pub struct AcquisitionRequest {
    /// Base output path; `.bin` and rollover suffixes are appended.
    pub path: PathBuf,
    /// Size limit per file in gigabytes.
    pub max_gb: f64,
    /// Stop after this many frames; `None` streams until stopped.
    pub n_frames: Option<usize>,
    /// `true` saves processed volumes, `false` saves raw spectra.
    pub save_processed: bool,
}

/// Commands accepted by the controller queue.
#[derive(Clone, Debug)]
pub enum OctCommand {
    ConfigureImage(ImageConfig),
    ConfigureProcessing(ProcessingConfig),
    SetScanPattern(ScanPattern),
    StartScan,
    StopScan,
    StartAcquisition(AcquisitionRequest),
    StopAcquisition,
    Shutdown,
}

/// Single-frame display slot with refresh-on-demand semantics.
///
/// Reading arms the refresh flag; the controller copies a frame in only when
/// the flag is armed, so display traffic never exceeds what the client
/// consumes. Reads are non-blocking: if the controller is mid-publish the
/// read simply reports empty.
pub struct Snapshot<T> {
    data: Mutex<Vec<T>>,
    len: AtomicUsize,
    armed: AtomicBool,
    fresh: AtomicBool,
}

impl<T: Copy + Default> Snapshot<T> {
    pub(crate) fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
            armed: AtomicBool::new(true),
            fresh: AtomicBool::new(false),
        }
    }

    /// Discard stale data when the frame geometry changes.
    pub(crate) fn reset(&self, len: usize) {
        let mut data = self.data.lock();
        data.clear();
        data.resize(len, T::default());
        self.len.store(len, Ordering::Release);
        self.fresh.store(false, Ordering::Release);
        self.armed.store(true, Ordering::Release);
    }

    /// Number of elements a read needs room for.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish a frame if a reader armed the slot. `fill` writes the
    /// payload; it only runs when the slot is armed.
    pub(crate) fn publish_with(&self, len: usize, fill: impl FnOnce(&mut [T])) {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut data = self.data.lock();
        data.resize(len, T::default());
        fill(&mut data);
        self.len.store(len, Ordering::Release);
        self.fresh.store(true, Ordering::Release);
    }

    /// Copy the latest frame into `dst` if one is available. Returns `false`
    /// (leaving the slot armed) when nothing new has been published or the
    /// controller holds the slot right now.
    pub fn read(&self, dst: &mut [T]) -> bool {
        let fresh = self.fresh.load(Ordering::Acquire);
        let copied = if fresh {
            match self.data.try_lock() {
                Some(data) => {
                    let n = dst.len().min(data.len());
                    dst[..n].copy_from_slice(&data[..n]);
                    self.fresh.store(false, Ordering::Release);
                    true
                }
                None => false,
            }
        } else {
            false
        };
        self.armed.store(true, Ordering::Release);
        copied
    }
}
