//! Device abstraction for the frame grabber and the scan DAC.
//!
//! The vendor camera-link and analog-output stacks are opaque drivers behind
//! these traits. The grabber rings frames internally and lends them out
//! under examine/release discipline; the DAC regenerates the uploaded scan
//! signals continuously and exposes a start-trigger line that gates
//! acquisition onset.

pub mod mock;

use crate::config::ScanPattern;
use crate::error::OctResult;

/// Analog-output channel identifiers for the scan task.
#[derive(Clone, Debug)]
pub struct DacChannels {
    pub x: String,
    pub y: String,
    pub line_trigger: String,
    pub frame_trigger: String,
    pub start_trigger: String,
}

/// A device buffer on loan from the grabber. The data stays valid until the
/// matching [`FrameGrabber::release_buffer`] call.
pub struct ExaminedBuffer<'a> {
    /// Cumulative index of the buffer actually delivered. Differs from the
    /// requested index when the driver has dropped buffers.
    pub index: i64,
    /// `alines_per_buffer × aline_size` raw spectral samples.
    pub data: &'a [u16],
}

/// Camera-link frame grabber contract.
///
/// Buffers are borrowed one at a time: every successful `examine_buffer`
/// must be balanced by `release_buffer` before the next examine.
pub trait FrameGrabber: Send {
    fn open(&mut self, camera: &str) -> OctResult<()>;

    /// Size the driver's internal ring for the configured scan.
    fn setup_buffers(
        &mut self,
        aline_size: usize,
        alines_per_buffer: usize,
        ring_depth: usize,
    ) -> OctResult<()>;

    fn start_scan(&mut self) -> OctResult<()>;

    fn stop_scan(&mut self) -> OctResult<()>;

    /// Borrow the buffer with cumulative index `requested`, or the nearest
    /// one still available.
    fn examine_buffer(&mut self, requested: i64) -> OctResult<ExaminedBuffer<'_>>;

    fn release_buffer(&mut self) -> OctResult<()>;

    fn close(&mut self) -> OctResult<()>;
}

/// Scan-pattern DAC contract.
pub trait ScanDac: Send {
    fn open(&mut self, channels: &DacChannels) -> OctResult<()>;

    /// Upload the four scan signals, concatenated and grouped by channel.
    /// May be called while the task runs; the driver restarts regeneration
    /// when the buffer size changes.
    fn set_pattern(&mut self, pattern: &ScanPattern) -> OctResult<()>;

    fn start(&mut self) -> OctResult<()>;

    fn stop(&mut self) -> OctResult<()>;

    /// Drive the start-trigger line that gates acquisition onset.
    fn set_start_trigger(&mut self, high: bool) -> OctResult<()>;

    fn close(&mut self) -> OctResult<()>;
}
