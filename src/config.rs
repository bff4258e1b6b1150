//! Configuration types for image geometry, processing options, and scan
//! signals.
//!
//! The controller accepts these structs through the command queue and
//! validates them before rebuilding the acquisition geometry. Validation
//! failures never change state; the offending configuration is simply
//! rejected with a [`OctError::Config`](crate::error::OctError).

use serde::{Deserialize, Serialize};

use crate::error::{OctError, OctResult};

/// Repeat-aggregation mode for one scan axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatMode {
    /// Repeats are kept as-is.
    #[default]
    None,
    /// Repeats are averaged, compacting the axis by the repeat factor.
    Mean,
    /// Paired repeats are subtracted component-wise (absolute value).
    /// Only supported on the B axis with a repeat factor of 2.
    Diff,
}

/// Geometry of one camera scan and of the image extracted from it.
///
/// `alines_in_scan` A-lines arrive per scan period, delivered in
/// `alines_in_scan / alines_per_buffer` contiguous sub-buffers. The image
/// mask selects `alines_in_image` of them; flyback and turnaround lines are
/// discarded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Spectral samples per A-line.
    pub aline_size: usize,
    /// A-lines produced by the camera per scan period.
    pub alines_in_scan: usize,
    /// One flag per A-line in the scan; `true` keeps the line.
    pub image_mask: Vec<bool>,
    /// A-lines contributing to the image (number of `true` mask entries).
    pub alines_in_image: usize,
    /// A-lines per B-line, including any repeats.
    pub alines_per_bline: usize,
    /// A-lines delivered per grabber sub-buffer.
    pub alines_per_buffer: usize,
    /// Depth of the processed-frame ring.
    pub frames_to_buffer: usize,
    /// Consecutive repeats of each A-line position.
    pub n_aline_repeat: usize,
    /// Repeats of each B-line laid end to end within the B-line.
    pub n_bline_repeat: usize,
    /// First spatial voxel of the axial ROI.
    pub roi_offset: usize,
    /// Number of voxels in the axial ROI.
    pub roi_size: usize,
}

impl ImageConfig {
    /// Number of grabber sub-buffers that concatenate to one scan.
    pub fn buffers_per_frame(&self) -> usize {
        self.alines_in_scan / self.alines_per_buffer
    }

    /// Samples in one assembled raw frame (masked A-lines only).
    pub fn raw_frame_len(&self) -> usize {
        self.alines_in_image * self.aline_size
    }

    pub fn validate(&self) -> OctResult<()> {
        if self.aline_size == 0 || self.alines_in_scan == 0 || self.alines_in_image == 0 {
            return Err(OctError::Config("image dimensions must be nonzero".into()));
        }
        if self.alines_per_buffer == 0 || self.alines_in_scan % self.alines_per_buffer != 0 {
            return Err(OctError::Config(format!(
                "alines_in_scan ({}) must be a multiple of alines_per_buffer ({})",
                self.alines_in_scan, self.alines_per_buffer
            )));
        }
        if self.alines_per_bline == 0 || self.alines_in_image % self.alines_per_bline != 0 {
            return Err(OctError::Config(format!(
                "alines_in_image ({}) must be a multiple of alines_per_bline ({})",
                self.alines_in_image, self.alines_per_bline
            )));
        }
        if self.image_mask.len() != self.alines_in_scan {
            return Err(OctError::Config(format!(
                "image mask has {} entries for {} scan A-lines",
                self.image_mask.len(),
                self.alines_in_scan
            )));
        }
        let kept = self.image_mask.iter().filter(|&&m| m).count();
        if kept != self.alines_in_image {
            return Err(OctError::Config(format!(
                "image mask keeps {} A-lines, expected {}",
                kept, self.alines_in_image
            )));
        }
        let spatial = self.aline_size / 2 + 1;
        if self.roi_size == 0 || self.roi_offset + self.roi_size > spatial {
            return Err(OctError::Config(format!(
                "axial ROI [{}, {}) exceeds spatial A-line of {} voxels",
                self.roi_offset,
                self.roi_offset + self.roi_size,
                spatial
            )));
        }
        if self.frames_to_buffer == 0 {
            return Err(OctError::Config("frames_to_buffer must be nonzero".into()));
        }
        if self.n_aline_repeat == 0 || self.alines_per_bline % self.n_aline_repeat != 0 {
            return Err(OctError::Config(format!(
                "A-line repeat {} does not divide alines_per_bline {}",
                self.n_aline_repeat, self.alines_per_bline
            )));
        }
        if self.n_bline_repeat == 0 {
            return Err(OctError::Config("n_bline_repeat must be nonzero".into()));
        }
        Ok(())
    }
}

/// Per-A-line processing options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Estimate and subtract the mean spectrum of each frame.
    pub subtract_background: bool,
    /// Resample each spectrum from uniform wavelength to uniform wavenumber.
    pub interp: bool,
    /// Width coefficient of the resampling interval.
    pub interpdk: f64,
    /// Per-sample window applied before the FFT; length `aline_size`.
    pub apod_window: Vec<f32>,
    /// Aggregation of consecutive A-line repeats.
    pub aline_repeat_mode: RepeatMode,
    /// Aggregation of B-line repeats.
    pub bline_repeat_mode: RepeatMode,
    /// Running-mean depth across frames. Accepted for forward compatibility;
    /// has no effect on processing.
    pub n_frame_avg: usize,
}

impl ProcessingConfig {
    /// Validate against the image geometry the options will apply to.
    pub fn validate(&self, image: &ImageConfig) -> OctResult<()> {
        if self.apod_window.len() != image.aline_size {
            return Err(OctError::Config(format!(
                "apodization window has {} samples for A-line size {}",
                self.apod_window.len(),
                image.aline_size
            )));
        }
        if self.aline_repeat_mode == RepeatMode::Diff {
            return Err(OctError::Config(
                "A-line repeat differencing is not supported".into(),
            ));
        }
        if self.aline_repeat_mode == RepeatMode::Mean && image.n_aline_repeat < 2 {
            return Err(OctError::Config(
                "A-line repeat averaging requires n_aline_repeat > 1".into(),
            ));
        }
        if self.bline_repeat_mode == RepeatMode::Diff && image.n_bline_repeat != 2 {
            return Err(OctError::Config(
                "B-line differencing requires n_bline_repeat = 2".into(),
            ));
        }
        if self.bline_repeat_mode != RepeatMode::None {
            let bline = image.alines_per_bline / self.aline_factor(image);
            if bline % image.n_bline_repeat != 0 {
                return Err(OctError::Config(format!(
                    "B-line repeat {} does not divide the compacted B-line of {}",
                    image.n_bline_repeat, bline
                )));
            }
        }
        if self.n_frame_avg == 0 {
            return Err(OctError::Config("n_frame_avg must be at least 1".into()));
        }
        Ok(())
    }

    /// Compaction factor applied along the A axis.
    pub fn aline_factor(&self, image: &ImageConfig) -> usize {
        match self.aline_repeat_mode {
            RepeatMode::Mean => image.n_aline_repeat,
            _ => 1,
        }
    }

    /// Compaction factor applied along the B axis.
    pub fn bline_factor(&self, image: &ImageConfig) -> usize {
        match self.bline_repeat_mode {
            RepeatMode::Mean | RepeatMode::Diff => image.n_bline_repeat,
            RepeatMode::None => 1,
        }
    }
}

/// Galvanometer drive signals, one sample stream per analog-output channel.
///
/// The four signals are concatenated end to end and written to the DAC
/// grouped by channel, regenerating continuously at `sample_rate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanPattern {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub line_trigger: Vec<f64>,
    pub frame_trigger: Vec<f64>,
    /// DAC output rate in samples per second.
    pub sample_rate: f64,
    /// Camera line rate in Hz, used by callers to phase the triggers.
    pub line_rate: f64,
}

impl ScanPattern {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn validate(&self) -> OctResult<()> {
        let n = self.x.len();
        if n == 0 {
            return Err(OctError::Config("scan pattern is empty".into()));
        }
        if self.y.len() != n || self.line_trigger.len() != n || self.frame_trigger.len() != n {
            return Err(OctError::Config(
                "scan signal lengths do not match".into(),
            ));
        }
        if self.sample_rate <= 0.0 || self.line_rate <= 0.0 {
            return Err(OctError::Config("scan rates must be positive".into()));
        }
        Ok(())
    }
}

/// One contiguous run of kept A-lines inside a grabber sub-buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyBlock {
    /// First kept A-line, relative to the start of the sub-buffer.
    pub src_aline: usize,
    /// Destination A-line in the assembled raw frame.
    pub dst_aline: usize,
    /// Run length in A-lines.
    pub len: usize,
}

/// Geometry derived once per configuration and consulted every frame cycle.
#[derive(Clone, Debug)]
pub struct AcqGeometry {
    pub buffers_per_frame: usize,
    /// Copy blocks per sub-buffer, compiled from the image mask.
    pub copy_blocks: Vec<Vec<CopyBlock>>,
    pub raw_frame_len: usize,
    /// Full voxel capacity of a processed ring element.
    pub processed_capacity: usize,
    /// Voxels actually exported per frame after repeat aggregation.
    pub processed_frame_len: usize,
    pub n_blines: usize,
}

impl AcqGeometry {
    pub fn derive(image: &ImageConfig, processing: &ProcessingConfig) -> OctResult<Self> {
        image.validate()?;
        processing.validate(image)?;

        let per_buffer = image.alines_per_buffer;
        let mut copy_blocks = Vec::with_capacity(image.buffers_per_frame());
        let mut dst = 0usize;
        for chunk in image.image_mask.chunks(per_buffer) {
            let mut blocks = Vec::new();
            let mut run: Option<CopyBlock> = None;
            for (i, &keep) in chunk.iter().enumerate() {
                if keep {
                    match run.as_mut() {
                        Some(b) => b.len += 1,
                        None => {
                            run = Some(CopyBlock {
                                src_aline: i,
                                dst_aline: dst,
                                len: 1,
                            })
                        }
                    }
                    dst += 1;
                } else if let Some(b) = run.take() {
                    blocks.push(b);
                }
            }
            if let Some(b) = run.take() {
                blocks.push(b);
            }
            copy_blocks.push(blocks);
        }

        let compaction = processing.aline_factor(image) * processing.bline_factor(image);
        Ok(Self {
            buffers_per_frame: image.buffers_per_frame(),
            copy_blocks,
            raw_frame_len: image.raw_frame_len(),
            processed_capacity: image.alines_in_image * image.roi_size,
            processed_frame_len: image.alines_in_image * image.roi_size / compaction,
            n_blines: image.alines_in_image / image.alines_per_bline,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(alines_in_scan: usize, alines_in_image: usize) -> ImageConfig {
        let mut mask = vec![false; alines_in_scan];
        for m in mask.iter_mut().take(alines_in_image) {
            *m = true;
        }
        ImageConfig {
            aline_size: 64,
            alines_in_scan,
            image_mask: mask,
            alines_in_image,
            alines_per_bline: alines_in_image,
            alines_per_buffer: alines_in_scan,
            frames_to_buffer: 4,
            n_aline_repeat: 1,
            n_bline_repeat: 1,
            roi_offset: 0,
            roi_size: 16,
        }
    }

    fn processing(aline_size: usize) -> ProcessingConfig {
        ProcessingConfig {
            subtract_background: false,
            interp: false,
            interpdk: 0.0,
            apod_window: vec![1.0; aline_size],
            aline_repeat_mode: RepeatMode::None,
            bline_repeat_mode: RepeatMode::None,
            n_frame_avg: 1,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(image(16, 8).validate().is_ok());
    }

    #[test]
    fn test_indivisible_buffer_rejected() {
        let mut cfg = image(16, 8);
        cfg.alines_per_buffer = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_roi_bound_rejected() {
        let mut cfg = image(16, 8);
        cfg.roi_offset = 30;
        cfg.roi_size = 10; // 30 + 10 > 64/2 + 1
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_mask_cardinality_rejected() {
        let mut cfg = image(16, 8);
        cfg.image_mask[0] = false; // keeps 7, claims 8
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_aline_diff_rejected() {
        let cfg = image(16, 8);
        let mut proc = processing(cfg.aline_size);
        proc.aline_repeat_mode = RepeatMode::Diff;
        assert!(proc.validate(&cfg).is_err());
    }

    #[test]
    fn test_bline_diff_requires_two_repeats() {
        let mut cfg = image(16, 8);
        cfg.n_bline_repeat = 3;
        let mut proc = processing(cfg.aline_size);
        proc.bline_repeat_mode = RepeatMode::Diff;
        assert!(proc.validate(&cfg).is_err());
        cfg.n_bline_repeat = 2;
        assert!(proc.validate(&cfg).is_ok());
    }

    #[test]
    fn test_mask_compiles_to_full_image() {
        // Alternating mask across two sub-buffers.
        let mut cfg = image(16, 8);
        cfg.alines_per_buffer = 8;
        for (i, m) in cfg.image_mask.iter_mut().enumerate() {
            *m = i % 2 == 0;
        }
        let geo = AcqGeometry::derive(&cfg, &processing(cfg.aline_size)).unwrap();
        assert_eq!(geo.buffers_per_frame, 2);
        let total: usize = geo
            .copy_blocks
            .iter()
            .flat_map(|b| b.iter())
            .map(|b| b.len)
            .sum();
        assert_eq!(total, cfg.alines_in_image);
        // Destination A-lines tile the image contiguously.
        let mut dst = 0;
        for block in geo.copy_blocks.iter().flatten() {
            assert_eq!(block.dst_aline, dst);
            dst += block.len;
        }
    }

    #[test]
    fn test_straight_copy_when_mask_is_full() {
        let mut cfg = image(16, 16);
        cfg.alines_per_buffer = 4;
        let geo = AcqGeometry::derive(&cfg, &processing(cfg.aline_size)).unwrap();
        assert_eq!(geo.buffers_per_frame, 4);
        for blocks in &geo.copy_blocks {
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].len, 4);
            assert_eq!(blocks[0].src_aline, 0);
        }
    }

    #[test]
    fn test_processed_frame_len_with_repeats() {
        let mut cfg = image(16, 8);
        cfg.alines_per_bline = 8;
        cfg.n_aline_repeat = 2;
        cfg.n_bline_repeat = 2;
        let mut proc = processing(cfg.aline_size);
        proc.aline_repeat_mode = RepeatMode::Mean;
        proc.bline_repeat_mode = RepeatMode::Diff;
        let geo = AcqGeometry::derive(&cfg, &proc).unwrap();
        assert_eq!(geo.processed_capacity, 8 * 16);
        assert_eq!(geo.processed_frame_len, 8 * 16 / 4);
    }
}
