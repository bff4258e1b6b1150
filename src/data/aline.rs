//! Parallel A-line processing pool.
//!
//! Each submitted job transforms one raw frame into one complex frame:
//! every spectral A-line is background-subtracted, optionally resampled to
//! uniform wavenumber, windowed, put through a real-to-complex FFT, cropped
//! to the axial ROI, and normalized by the transform length. Work fans out
//! across workers that each own a contiguous slice of the frame's A-lines;
//! a shared atomic barrier reports completion.
//!
//! Only one job can be in flight at a time. Submission hands raw slices to
//! the workers, so [`AlinePool::submit`] is `unsafe`: the caller keeps the
//! buffers alive and untouched until the barrier reaches the worker count.

use crossbeam_queue::ArrayQueue;
use num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::ImageConfig;
use crate::data::interp::WavenumberPlan;
use crate::error::{OctError, OctResult};

/// Workers sleep this long when their queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// Spins before the barrier wait falls back to sleeping.
const BARRIER_SPIN: u32 = 1024;
const JOB_QUEUE_DEPTH: usize = 32;

/// Select the worker fan-out for an image.
///
/// Small frames run inline on the caller thread. Larger frames use the
/// largest divisor of the A-line count that fits the hardware, with a floor
/// that keeps modest frames from over-subscribing.
pub fn worker_count(alines_in_image: usize) -> usize {
    if alines_in_image <= 512 {
        return 1;
    }
    let hw = thread::available_parallelism().map(usize::from).unwrap_or(1);
    let floor = if alines_in_image <= 1024 {
        2
    } else if alines_in_image <= 4096 {
        4
    } else {
        hw
    };
    let cap = floor.min(hw).max(1);
    (1..=cap)
        .rev()
        .find(|w| alines_in_image % w == 0)
        .unwrap_or(1)
}

/// Raw slice smuggled into a job message.
///
/// The submission protocol guarantees the pointee outlives the job: the
/// caller of `submit` must not free or mutate the buffers until the barrier
/// reaches the worker count.
struct SendConst<T> {
    ptr: *const T,
    len: usize,
}

// SAFETY: per the submission protocol above, the slice is immutable and
// alive for the duration of the job.
unsafe impl<T: Send + Sync> Send for SendConst<T> {}

impl<T> SendConst<T> {
    fn new(slice: &[T]) -> Self {
        Self {
            ptr: slice.as_ptr(),
            len: slice.len(),
        }
    }

    unsafe fn as_slice(&self) -> &[T] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

struct SendMut<T> {
    ptr: *mut T,
    len: usize,
}

// SAFETY: each worker receives a disjoint destination slice, exclusive for
// the duration of the job.
unsafe impl<T: Send> Send for SendMut<T> {}

impl<T> SendMut<T> {
    fn new(slice: &mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    unsafe fn as_slice_mut(&self) -> &mut [T] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// One worker's share of a frame transform.
struct AlineJob {
    dst: SendMut<Complex<f32>>,
    src: SendConst<u16>,
    interp: Option<Arc<WavenumberPlan>>,
    apod: SendConst<f32>,
    background: SendConst<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
}

/// State shared between the pool handle and its workers.
struct PoolShared {
    running: AtomicBool,
    /// Workers that have finished their slice of the current job.
    barrier: AtomicUsize,
}

/// Per-worker owned buffers; also used for the inline path when the pool
/// runs single-threaded.
struct Scratch {
    /// Background-subtracted spectral A-line.
    line: Vec<f32>,
    fft_in: Vec<f32>,
    fft_out: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
}

impl Scratch {
    fn new(aline_size: usize, fft: &dyn RealToComplex<f32>) -> Self {
        Self {
            line: vec![0.0; aline_size],
            fft_in: fft.make_input_vec(),
            fft_out: fft.make_output_vec(),
            fft_scratch: fft.make_scratch_vec(),
        }
    }
}

/// Transform `alines` spectral A-lines from `src` into `dst`.
#[allow(clippy::too_many_arguments)]
fn process_alines(
    src: &[u16],
    dst: &mut [Complex<f32>],
    aline_size: usize,
    roi_offset: usize,
    roi_size: usize,
    background: &[f32],
    apod: &[f32],
    interp: Option<&WavenumberPlan>,
    fft: &dyn RealToComplex<f32>,
    scratch: &mut Scratch,
) {
    let alines = src.len() / aline_size;
    let norm = 1.0 / aline_size as f32;
    for i in 0..alines {
        let spectrum = &src[i * aline_size..][..aline_size];
        for (out, (&raw, &bg)) in scratch
            .line
            .iter_mut()
            .zip(spectrum.iter().zip(background.iter()))
        {
            *out = raw as f32 - bg;
        }
        match interp {
            Some(plan) => plan.execute(&scratch.line, &mut scratch.fft_in),
            None => scratch.fft_in.copy_from_slice(&scratch.line),
        }
        for (v, &w) in scratch.fft_in.iter_mut().zip(apod.iter()) {
            *v *= w;
        }
        if let Err(e) = fft.process_with_scratch(
            &mut scratch.fft_in,
            &mut scratch.fft_out,
            &mut scratch.fft_scratch,
        ) {
            error!(error = %e, "forward transform failed");
            continue;
        }
        for (out, &c) in dst[i * roi_size..][..roi_size]
            .iter_mut()
            .zip(scratch.fft_out[roi_offset..roi_offset + roi_size].iter())
        {
            *out = c * norm;
        }
    }
}

fn worker_loop(
    id: usize,
    shared: Arc<PoolShared>,
    queue: Arc<ArrayQueue<AlineJob>>,
    aline_size: usize,
    roi_offset: usize,
    roi_size: usize,
    mut scratch: Scratch,
) {
    debug!(worker = id, "A-line worker started");
    loop {
        match queue.pop() {
            Some(job) => {
                // SAFETY: the submission protocol keeps these slices alive
                // and unaliased until the barrier observes every worker.
                let (src, dst, apod, background) = unsafe {
                    (
                        job.src.as_slice(),
                        job.dst.as_slice_mut(),
                        job.apod.as_slice(),
                        job.background.as_slice(),
                    )
                };
                process_alines(
                    src,
                    dst,
                    aline_size,
                    roi_offset,
                    roi_size,
                    background,
                    apod,
                    job.interp.as_deref(),
                    job.fft.as_ref(),
                    &mut scratch,
                );
                shared.barrier.fetch_add(1, Ordering::AcqRel);
            }
            None => {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                thread::sleep(IDLE_SLEEP);
            }
        }
    }
    debug!(worker = id, "A-line worker stopped");
}

struct WorkerSeat {
    queue: Arc<ArrayQueue<AlineJob>>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Worker pool transforming raw frames into complex frames. One pool exists
/// per image configuration; reconfiguring tears it down and builds a new
/// one.
pub struct AlinePool {
    shared: Arc<PoolShared>,
    seats: Vec<WorkerSeat>,
    workers: usize,
    alines_per_worker: usize,
    aline_size: usize,
    roi_offset: usize,
    roi_size: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    /// Caller-thread buffers for the single-worker inline path.
    inline_scratch: Option<Scratch>,
}

impl AlinePool {
    /// Build a pool sized by [`worker_count`] for the given image.
    pub fn new(image: &ImageConfig) -> Self {
        Self::with_workers(image, worker_count(image.alines_in_image))
    }

    /// Build a pool with an explicit worker fan-out. `workers` must divide
    /// `alines_in_image`.
    pub fn with_workers(image: &ImageConfig, workers: usize) -> Self {
        assert!(workers >= 1 && image.alines_in_image % workers == 0);
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(image.aline_size);
        let shared = Arc::new(PoolShared {
            running: AtomicBool::new(true),
            // No job yet; report finished so the first submit goes through.
            barrier: AtomicUsize::new(workers),
        });

        let mut seats = Vec::new();
        let mut inline_scratch = None;
        if workers == 1 {
            inline_scratch = Some(Scratch::new(image.aline_size, fft.as_ref()));
        } else {
            debug!(
                workers,
                alines_per_worker = image.alines_in_image / workers,
                "spawning A-line workers"
            );
            for id in 0..workers {
                let queue = Arc::new(ArrayQueue::new(JOB_QUEUE_DEPTH));
                let scratch = Scratch::new(image.aline_size, fft.as_ref());
                let handle = thread::Builder::new()
                    .name(format!("aline-worker-{id}"))
                    .spawn({
                        let shared = Arc::clone(&shared);
                        let queue = Arc::clone(&queue);
                        let (aline_size, roi_offset, roi_size) =
                            (image.aline_size, image.roi_offset, image.roi_size);
                        move || {
                            worker_loop(
                                id, shared, queue, aline_size, roi_offset, roi_size, scratch,
                            )
                        }
                    })
                    .expect("failed to spawn A-line worker");
                seats.push(WorkerSeat {
                    queue,
                    handle: Some(handle),
                });
            }
        }

        Self {
            shared,
            seats,
            workers,
            alines_per_worker: image.alines_in_image / workers,
            aline_size: image.aline_size,
            roi_offset: image.roi_offset,
            roi_size: image.roi_size,
            fft,
            inline_scratch,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// True when no job is in flight.
    pub fn is_finished(&self) -> bool {
        self.shared.barrier.load(Ordering::Acquire) >= self.workers
    }

    /// Submit one frame transform, fanning the A-lines out across the
    /// workers. Fails with [`OctError::PipelineBusy`] if the previous job
    /// has not finished. With a single worker the transform runs
    /// synchronously on the caller thread.
    ///
    /// # Safety
    ///
    /// `dst`, `src`, `apod` and `background` must stay alive, and must not
    /// be read from (`dst`) or written to (the rest) by anyone else, until
    /// [`AlinePool::is_finished`] returns true. `dst` must hold
    /// `alines × roi_size` voxels and `src` `alines × aline_size` samples,
    /// where `alines` is the configured image height; `apod` and
    /// `background` are one A-line long.
    pub unsafe fn submit(
        &mut self,
        dst: &mut [Complex<f32>],
        src: &[u16],
        interp: Option<Arc<WavenumberPlan>>,
        apod: &[f32],
        background: &[f32],
    ) -> OctResult<()> {
        if !self.is_finished() {
            return Err(OctError::PipelineBusy);
        }
        debug_assert_eq!(src.len(), self.workers * self.alines_per_worker * self.aline_size);
        debug_assert_eq!(dst.len(), self.workers * self.alines_per_worker * self.roi_size);
        debug_assert_eq!(apod.len(), self.aline_size);
        debug_assert_eq!(background.len(), self.aline_size);

        self.shared.barrier.store(0, Ordering::Release);

        if self.workers == 1 {
            let scratch = self
                .inline_scratch
                .as_mut()
                .expect("inline scratch exists when workers == 1");
            process_alines(
                src,
                dst,
                self.aline_size,
                self.roi_offset,
                self.roi_size,
                background,
                apod,
                interp.as_deref(),
                self.fft.as_ref(),
                scratch,
            );
            self.shared.barrier.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        let src_stride = self.alines_per_worker * self.aline_size;
        let dst_stride = self.alines_per_worker * self.roi_size;
        for (w, seat) in self.seats.iter().enumerate() {
            let job = AlineJob {
                dst: SendMut::new(&mut dst[w * dst_stride..][..dst_stride]),
                src: SendConst::new(&src[w * src_stride..][..src_stride]),
                interp: interp.clone(),
                apod: SendConst::new(apod),
                background: SendConst::new(background),
                fft: Arc::clone(&self.fft),
            };
            // The queue is drained whenever the barrier reports finished, so
            // a push can only fail if the worker died; surface that loudly.
            if seat.queue.push(job).is_err() {
                error!(worker = w, "job queue full, worker unresponsive");
                return Err(OctError::PipelineBusy);
            }
        }
        Ok(())
    }

    /// Block until the in-flight job (if any) completes: bounded spin, then
    /// yield, then short sleeps.
    pub fn wait_finished(&self) {
        let mut spins = 0u32;
        while !self.is_finished() {
            if spins < BARRIER_SPIN {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::sleep(Duration::from_micros(100));
            }
        }
    }
}

impl Drop for AlinePool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for seat in &mut self.seats {
            if let Some(handle) = seat.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageConfig;

    fn image(aline_size: usize, alines: usize, roi_offset: usize, roi_size: usize) -> ImageConfig {
        ImageConfig {
            aline_size,
            alines_in_scan: alines,
            image_mask: vec![true; alines],
            alines_in_image: alines,
            alines_per_bline: alines,
            alines_per_buffer: alines,
            frames_to_buffer: 4,
            n_aline_repeat: 1,
            n_bline_repeat: 1,
            roi_offset,
            roi_size,
        }
    }

    fn run_frame(
        pool: &mut AlinePool,
        image: &ImageConfig,
        src: &[u16],
        interp: Option<Arc<WavenumberPlan>>,
        apod: &[f32],
        background: &[f32],
    ) -> Vec<Complex<f32>> {
        let mut dst = vec![Complex::new(0.0f32, 0.0); image.alines_in_image * image.roi_size];
        // SAFETY: buffers are local and we wait for the barrier before use.
        unsafe {
            pool.submit(&mut dst, src, interp, apod, background).unwrap();
        }
        pool.wait_finished();
        dst
    }

    #[test]
    fn test_constant_input_concentrates_in_dc_bin() {
        // 16-sample A-lines of constant 100: DC bin (sum / N) = 100, all
        // other bins zero.
        let cfg = image(16, 4, 0, 9);
        let mut pool = AlinePool::new(&cfg);
        assert_eq!(pool.workers(), 1);
        let src = vec![100u16; 16 * 4];
        let apod = vec![1.0f32; 16];
        let background = vec![0.0f32; 16];
        let dst = run_frame(&mut pool, &cfg, &src, None, &apod, &background);
        for aline in dst.chunks(9) {
            assert!((aline[0].re - 100.0).abs() < 1e-3);
            assert!(aline[0].im.abs() < 1e-3);
            for bin in &aline[1..] {
                assert!(bin.norm() < 1e-3);
            }
        }
    }

    #[test]
    fn test_background_subtraction_cancels_input() {
        let cfg = image(8, 2, 0, 5);
        let mut pool = AlinePool::new(&cfg);
        let spectrum: Vec<u16> = vec![10, 20, 30, 40, 50, 60, 70, 80];
        let src: Vec<u16> = spectrum
            .iter()
            .chain(spectrum.iter())
            .copied()
            .collect();
        let background: Vec<f32> = spectrum.iter().map(|&v| v as f32).collect();
        let apod = vec![1.0f32; 8];
        let dst = run_frame(&mut pool, &cfg, &src, None, &apod, &background);
        for v in dst {
            assert!(v.norm() < 1e-4);
        }
    }

    #[test]
    fn test_apodization_scales_spectrum() {
        // A half-amplitude window halves every output bin.
        let cfg = image(16, 1, 0, 9);
        let mut pool = AlinePool::new(&cfg);
        let src = vec![100u16; 16];
        let background = vec![0.0f32; 16];
        let full = run_frame(&mut pool, &cfg, &src, None, &vec![1.0f32; 16], &background);
        let half = run_frame(&mut pool, &cfg, &src, None, &vec![0.5f32; 16], &background);
        for (f, h) in full.iter().zip(half.iter()) {
            assert!((f.re * 0.5 - h.re).abs() < 1e-3);
            assert!((f.im * 0.5 - h.im).abs() < 1e-3);
        }
    }

    #[test]
    fn test_roi_crop_offsets_into_spatial_aline() {
        // One cycle of cosine on a 100 pedestal: bin 1 holds amplitude
        // N/2 x 50; a one-voxel ROI at offset 1 picks exactly that bin.
        let cfg = image(16, 1, 1, 1);
        let mut pool = AlinePool::new(&cfg);
        let src: Vec<u16> = (0..16)
            .map(|j| {
                let phase = 2.0 * std::f32::consts::PI * j as f32 / 16.0;
                (100.0 + 50.0 * phase.cos()).round() as u16
            })
            .collect();
        let dst = run_frame(
            &mut pool,
            &cfg,
            &src,
            None,
            &vec![1.0f32; 16],
            &vec![0.0f32; 16],
        );
        assert_eq!(dst.len(), 1);
        // Rounding the samples to u16 perturbs the bin slightly.
        assert!((dst[0].re - 25.0).abs() < 0.5, "bin 1: {}", dst[0].re);
        assert!(dst[0].im.abs() < 0.5);
    }

    #[test]
    fn test_identity_interpolation_matches_copy_through() {
        let cfg = image(32, 2, 0, 17);
        let mut pool = AlinePool::new(&cfg);
        let src: Vec<u16> = (0..64u16).map(|i| i * 7 % 251).collect();
        let apod = vec![1.0f32; 32];
        let background = vec![0.0f32; 32];
        let plain = run_frame(&mut pool, &cfg, &src, None, &apod, &background);
        let plan = Arc::new(WavenumberPlan::new(32, 0.0));
        let interped = run_frame(&mut pool, &cfg, &src, Some(plan), &apod, &background);
        for (a, b) in plain.iter().zip(interped.iter()) {
            assert!((a - b).norm() < 1e-3);
        }
    }

    #[test]
    fn test_parallel_workers_match_inline_result() {
        let cfg = image(16, 8, 1, 6);
        let src: Vec<u16> = (0..16 * 8u16).map(|i| (i * 13) % 997).collect();
        let apod: Vec<f32> = (0..16).map(|i| 0.5 + 0.5 * (i as f32 / 15.0)).collect();
        let background = vec![2.0f32; 16];

        let mut inline = AlinePool::with_workers(&cfg, 1);
        let expected = run_frame(&mut inline, &cfg, &src, None, &apod, &background);

        let mut parallel = AlinePool::with_workers(&cfg, 2);
        let got = run_frame(&mut parallel, &cfg, &src, None, &apod, &background);

        for (a, b) in expected.iter().zip(got.iter()) {
            assert!((a - b).norm() < 1e-3);
        }
    }

    #[test]
    fn test_submit_while_busy_is_rejected() {
        let cfg = image(16, 8, 0, 9);
        let mut pool = AlinePool::with_workers(&cfg, 2);
        // Fake an unfinished job.
        pool.shared.barrier.store(0, Ordering::Release);
        let mut dst = vec![Complex::new(0.0f32, 0.0); 8 * 9];
        let src = vec![0u16; 16 * 8];
        let apod = vec![1.0f32; 16];
        let background = vec![0.0f32; 16];
        // SAFETY: rejected before any pointer is captured.
        let err = unsafe {
            pool.submit(&mut dst, &src, None, &apod, &background)
                .unwrap_err()
        };
        assert!(matches!(err, OctError::PipelineBusy));
        pool.shared.barrier.store(2, Ordering::Release);
    }

    #[test]
    fn test_worker_count_rules() {
        assert_eq!(worker_count(64), 1);
        assert_eq!(worker_count(512), 1);
        let hw = thread::available_parallelism().map(usize::from).unwrap_or(1);
        if hw >= 2 {
            assert_eq!(worker_count(1024), 2);
        }
        if hw >= 4 {
            assert_eq!(worker_count(4096), 4);
        }
        // The fan-out always divides the A-line count.
        for n in [513, 1000, 2048, 5000] {
            assert_eq!(n % worker_count(n), 0);
        }
    }
}
