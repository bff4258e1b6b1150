//! Simulated hardware for tests and development without an instrument.
//!
//! `MockGrabber` synthesizes deterministic frames and enforces the
//! examine/release discipline of the real driver; `MockDac` records the
//! uploaded pattern and trigger state so tests can assert on them.

use std::time::Duration;
use tracing::debug;

use crate::config::ScanPattern;
use crate::error::{OctError, OctResult};
use crate::hardware::{DacChannels, ExaminedBuffer, FrameGrabber, ScanDac};

/// How the mock fills each synthesized buffer.
#[derive(Clone, Copy, Debug)]
pub enum MockFill {
    /// Every sample takes the given value.
    Constant(u16),
    /// Sample 0 of each A-line carries the buffer index (the camera's
    /// frame-counter stamp); the rest take the given value.
    StampedConstant(u16),
    /// Sample `j` of every A-line takes the value `j`.
    Ramp,
}

/// Frame grabber that synthesizes frames instead of talking to hardware.
pub struct MockGrabber {
    fill: MockFill,
    /// Simulated readout time per buffer.
    buffer_period: Duration,
    /// Deliver an index `skip` ahead every `n`-th examine, simulating driver
    /// drops.
    skip_every: Option<(u64, i64)>,

    aline_size: usize,
    alines_per_buffer: usize,
    open: bool,
    scanning: bool,
    configured: bool,
    examined: bool,
    examines: u64,
    delivered: i64,
    frame: Vec<u16>,
}

impl MockGrabber {
    pub fn new(fill: MockFill) -> Self {
        Self {
            fill,
            buffer_period: Duration::ZERO,
            skip_every: None,
            aline_size: 0,
            alines_per_buffer: 0,
            open: false,
            scanning: false,
            configured: false,
            examined: false,
            examines: 0,
            delivered: -1,
            frame: Vec::new(),
        }
    }

    /// Simulate camera pacing: each examine takes at least `period`.
    pub fn with_buffer_period(mut self, period: Duration) -> Self {
        self.buffer_period = period;
        self
    }

    /// Deliver `skip` buffers ahead of the request on every `n`-th examine.
    pub fn with_skips(mut self, every: u64, skip: i64) -> Self {
        self.skip_every = Some((every, skip));
        self
    }

    fn synthesize(&mut self, index: i64) {
        match self.fill {
            MockFill::Constant(v) => self.frame.fill(v),
            MockFill::StampedConstant(v) => {
                self.frame.fill(v);
                for a in 0..self.alines_per_buffer {
                    self.frame[a * self.aline_size] = index as u16;
                }
            }
            MockFill::Ramp => {
                for a in 0..self.alines_per_buffer {
                    for j in 0..self.aline_size {
                        self.frame[a * self.aline_size + j] = j as u16;
                    }
                }
            }
        }
    }
}

impl FrameGrabber for MockGrabber {
    fn open(&mut self, camera: &str) -> OctResult<()> {
        debug!(camera, "mock grabber opened");
        self.open = true;
        Ok(())
    }

    fn setup_buffers(
        &mut self,
        aline_size: usize,
        alines_per_buffer: usize,
        _ring_depth: usize,
    ) -> OctResult<()> {
        if !self.open {
            return Err(OctError::Device("grabber is not open".into()));
        }
        self.aline_size = aline_size;
        self.alines_per_buffer = alines_per_buffer;
        self.frame = vec![0u16; aline_size * alines_per_buffer];
        self.configured = true;
        Ok(())
    }

    fn start_scan(&mut self) -> OctResult<()> {
        if !self.configured {
            return Err(OctError::Device("buffers are not set up".into()));
        }
        self.scanning = true;
        self.delivered = -1;
        self.examines = 0;
        Ok(())
    }

    fn stop_scan(&mut self) -> OctResult<()> {
        self.scanning = false;
        Ok(())
    }

    fn examine_buffer(&mut self, requested: i64) -> OctResult<ExaminedBuffer<'_>> {
        if !self.scanning {
            return Err(OctError::Device("grabber is not scanning".into()));
        }
        if self.examined {
            return Err(OctError::Device(
                "previous buffer was not released".into(),
            ));
        }
        if !self.buffer_period.is_zero() {
            std::thread::sleep(self.buffer_period);
        }
        self.examines += 1;
        let mut index = requested.max(self.delivered + 1);
        if let Some((every, skip)) = self.skip_every {
            if self.examines % every == 0 {
                index += skip;
            }
        }
        self.synthesize(index);
        self.delivered = index;
        self.examined = true;
        Ok(ExaminedBuffer {
            index,
            data: &self.frame,
        })
    }

    fn release_buffer(&mut self) -> OctResult<()> {
        if !self.examined {
            return Err(OctError::Device("no buffer is examined".into()));
        }
        self.examined = false;
        Ok(())
    }

    fn close(&mut self) -> OctResult<()> {
        self.open = false;
        self.scanning = false;
        Ok(())
    }
}

/// Grabber whose `open` always fails, for exercising the fatal-open path.
pub struct FailingGrabber;

impl FrameGrabber for FailingGrabber {
    fn open(&mut self, camera: &str) -> OctResult<()> {
        Err(OctError::Device(format!("no such camera: {camera}")))
    }

    fn setup_buffers(&mut self, _: usize, _: usize, _: usize) -> OctResult<()> {
        Err(OctError::Device("not open".into()))
    }

    fn start_scan(&mut self) -> OctResult<()> {
        Err(OctError::Device("not open".into()))
    }

    fn stop_scan(&mut self) -> OctResult<()> {
        Err(OctError::Device("not open".into()))
    }

    fn examine_buffer(&mut self, _: i64) -> OctResult<ExaminedBuffer<'_>> {
        Err(OctError::Device("not open".into()))
    }

    fn release_buffer(&mut self) -> OctResult<()> {
        Err(OctError::Device("not open".into()))
    }

    fn close(&mut self) -> OctResult<()> {
        Ok(())
    }
}

/// DAC that records what was asked of it.
#[derive(Default)]
pub struct MockDac {
    pub open: bool,
    pub running: bool,
    pub start_trigger_high: bool,
    pub channels: Option<DacChannels>,
    /// Last uploaded signals, concatenated x | y | line | frame.
    pub uploaded: Vec<f64>,
    pub uploads: usize,
}

impl MockDac {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScanDac for MockDac {
    fn open(&mut self, channels: &DacChannels) -> OctResult<()> {
        debug!(x = %channels.x, y = %channels.y, "mock DAC opened");
        self.open = true;
        self.channels = Some(channels.clone());
        Ok(())
    }

    fn set_pattern(&mut self, pattern: &ScanPattern) -> OctResult<()> {
        if !self.open {
            return Err(OctError::Device("DAC is not open".into()));
        }
        // Group by channel, matching the on-wire layout of the real task.
        self.uploaded.clear();
        self.uploaded.extend_from_slice(&pattern.x);
        self.uploaded.extend_from_slice(&pattern.y);
        self.uploaded.extend_from_slice(&pattern.line_trigger);
        self.uploaded.extend_from_slice(&pattern.frame_trigger);
        self.uploads += 1;
        Ok(())
    }

    fn start(&mut self) -> OctResult<()> {
        if !self.open {
            return Err(OctError::Device("DAC is not open".into()));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> OctResult<()> {
        self.running = false;
        Ok(())
    }

    fn set_start_trigger(&mut self, high: bool) -> OctResult<()> {
        self.start_trigger_high = high;
        Ok(())
    }

    fn close(&mut self) -> OctResult<()> {
        self.open = false;
        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grabber() -> MockGrabber {
        let mut g = MockGrabber::new(MockFill::Constant(100));
        g.open("mock0").unwrap();
        g.setup_buffers(16, 4, 8).unwrap();
        g.start_scan().unwrap();
        g
    }

    #[test]
    fn test_examine_release_discipline() {
        let mut g = grabber();
        {
            let buf = g.examine_buffer(0).unwrap();
            assert_eq!(buf.index, 0);
            assert_eq!(buf.data.len(), 64);
        }
        // A second examine without release is a driver error.
        assert!(g.examine_buffer(1).is_err());
        g.release_buffer().unwrap();
        assert_eq!(g.examine_buffer(1).unwrap().index, 1);
    }

    #[test]
    fn test_skips_advance_delivered_index() {
        let mut g = MockGrabber::new(MockFill::Constant(1)).with_skips(3, 2);
        g.open("mock0").unwrap();
        g.setup_buffers(8, 2, 4).unwrap();
        g.start_scan().unwrap();
        let mut got = Vec::new();
        let mut next = 0i64;
        for _ in 0..4 {
            let idx = g.examine_buffer(next).unwrap().index;
            got.push(idx);
            g.release_buffer().unwrap();
            next = idx + 1;
        }
        // Third examine jumps ahead by two.
        assert_eq!(got, vec![0, 1, 4, 5]);
    }

    #[test]
    fn test_ramp_fill_varies_along_aline() {
        let mut g = MockGrabber::new(MockFill::Ramp);
        g.open("mock0").unwrap();
        g.setup_buffers(4, 2, 4).unwrap();
        g.start_scan().unwrap();
        let buf = g.examine_buffer(0).unwrap();
        for aline in buf.data.chunks(4) {
            assert_eq!(aline, &[0, 1, 2, 3]);
        }
    }

    #[test]
    fn test_stamped_fill_marks_aline_heads() {
        let mut g = MockGrabber::new(MockFill::StampedConstant(7));
        g.open("mock0").unwrap();
        g.setup_buffers(4, 3, 4).unwrap();
        g.start_scan().unwrap();
        let buf = g.examine_buffer(5).unwrap();
        assert_eq!(buf.index, 5);
        for aline in buf.data.chunks(4) {
            assert_eq!(aline[0], 5);
            assert_eq!(&aline[1..], &[7, 7, 7]);
        }
    }

    #[test]
    fn test_dac_records_pattern_grouped_by_channel() {
        let mut dac = MockDac::new();
        dac.open(&DacChannels {
            x: "ao0".into(),
            y: "ao1".into(),
            line_trigger: "ao2".into(),
            frame_trigger: "ao3".into(),
            start_trigger: "ao4".into(),
        })
        .unwrap();
        let pattern = ScanPattern {
            x: vec![1.0, 2.0],
            y: vec![3.0, 4.0],
            line_trigger: vec![5.0, 6.0],
            frame_trigger: vec![7.0, 8.0],
            sample_rate: 152_000.0,
            line_rate: 76_000.0,
        };
        dac.set_pattern(&pattern).unwrap();
        assert_eq!(
            dac.uploaded,
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
        assert_eq!(dac.uploads, 1);
    }
}
