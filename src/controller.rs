//! Acquisition controller and client handle.
//!
//! [`open`] spawns the single controller thread that owns both devices and
//! every configuration buffer. The thread drains one command per loop
//! iteration and, while scanning, runs one frame cycle: it submits the
//! previously staged frame to the processing pool, assembles the next frame
//! from the grabber's sub-buffers while the pool works, then waits on the
//! pool barrier, applies repeat aggregation, and releases the processed
//! frame into the ring for the streamer and display.
//!
//! Clients talk to the thread only through the bounded command queue and the
//! atomic state/snapshot cells on [`OctHandle`].

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use num_complex::Complex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{AcqGeometry, ImageConfig, ProcessingConfig, RepeatMode, ScanPattern};
use crate::data::aggregate;
use crate::data::aline::AlinePool;
use crate::data::interp::WavenumberPlan;
use crate::data::ring::{FrameRing, HeadSlot};
use crate::data::storage::{FileStreamer, StreamConfig, StreamFormat};
use crate::error::{OctError, OctResult};
use crate::hardware::{DacChannels, FrameGrabber, ScanDac};
use crate::messages::{AcquisitionRequest, OctCommand, ScanState, Snapshot, StateCell};

const IDLE_SLEEP: Duration = Duration::from_millis(10);
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Open both devices and start the controller thread.
///
/// Device-open failure is reported immediately; no thread is spawned and
/// the instrument stays unopened.
pub fn open(
    mut grabber: Box<dyn FrameGrabber>,
    mut dac: Box<dyn ScanDac>,
    camera: &str,
    channels: &DacChannels,
) -> OctResult<OctHandle> {
    grabber.open(camera)?;
    if let Err(e) = dac.open(channels) {
        let _ = grabber.close();
        return Err(e);
    }
    info!(camera, "devices open");

    let (commands_tx, commands_rx) = bounded(COMMAND_QUEUE_DEPTH);
    let state = Arc::new(StateCell::new(ScanState::Open));
    let interrupt = Arc::new(AtomicBool::new(false));
    let frame_snapshot = Arc::new(Snapshot::new());
    let spectrum_snapshot = Arc::new(Snapshot::new());

    let controller = OctController {
        grabber,
        dac,
        commands: commands_rx,
        state: Arc::clone(&state),
        interrupt: Arc::clone(&interrupt),
        image: None,
        processing: None,
        pattern: None,
        geometry: None,
        plan: None,
        pool: None,
        processed: None,
        raw: None,
        staging: Vec::new(),
        stable: Vec::new(),
        stable_ready: false,
        background: [Vec::new(), Vec::new()],
        bg_active: 0,
        stamps: Vec::new(),
        cumulative_buffer: 0,
        dropped_buffers: 0,
        streamer: None,
        frame_snapshot: Arc::clone(&frame_snapshot),
        spectrum_snapshot: Arc::clone(&spectrum_snapshot),
    };
    let thread = thread::Builder::new()
        .name("oct-controller".into())
        .spawn(move || controller.run())
        .map_err(|e| OctError::Device(format!("failed to spawn controller: {e}")))?;

    Ok(OctHandle {
        commands: commands_tx,
        state,
        interrupt,
        frame_snapshot,
        spectrum_snapshot,
        thread: Some(thread),
    })
}

/// Client-side handle to a running controller.
pub struct OctHandle {
    commands: Sender<OctCommand>,
    state: Arc<StateCell>,
    interrupt: Arc<AtomicBool>,
    frame_snapshot: Arc<Snapshot<Complex<f32>>>,
    spectrum_snapshot: Arc<Snapshot<f32>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl OctHandle {
    fn send(&self, cmd: OctCommand) -> OctResult<()> {
        self.commands.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => OctError::ControlQueueFull,
            TrySendError::Disconnected(_) => OctError::ControllerStopped,
        })
    }

    pub fn configure_image(&self, config: ImageConfig) -> OctResult<()> {
        self.send(OctCommand::ConfigureImage(config))
    }

    pub fn configure_processing(&self, config: ProcessingConfig) -> OctResult<()> {
        self.send(OctCommand::ConfigureProcessing(config))
    }

    pub fn set_scan_pattern(&self, pattern: ScanPattern) -> OctResult<()> {
        self.send(OctCommand::SetScanPattern(pattern))
    }

    pub fn start_scan(&self) -> OctResult<()> {
        self.send(OctCommand::StartScan)
    }

    /// Arm the interrupt flag and queue the stop; the controller honors the
    /// flag at the next sub-buffer boundary.
    pub fn stop_scan(&self) -> OctResult<()> {
        self.interrupt.store(true, Ordering::Release);
        self.send(OctCommand::StopScan)
    }

    pub fn start_acquisition(&self, request: AcquisitionRequest) -> OctResult<()> {
        self.send(OctCommand::StartAcquisition(request))
    }

    pub fn stop_acquisition(&self) -> OctResult<()> {
        self.send(OctCommand::StopAcquisition)
    }

    pub fn state(&self) -> ScanState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.get() == ScanState::Ready
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self.state.get(), ScanState::Scanning | ScanState::Acquiring)
    }

    pub fn is_acquiring(&self) -> bool {
        self.state.get() == ScanState::Acquiring
    }

    /// Voxels per displayed frame under the current configuration.
    pub fn frame_len(&self) -> usize {
        self.frame_snapshot.len()
    }

    /// Samples per displayed spectrum under the current configuration.
    pub fn spectrum_len(&self) -> usize {
        self.spectrum_snapshot.len()
    }

    /// Copy the newest processed frame into `dst`. Non-blocking; returns
    /// `false` and arms a refresh when nothing new is available.
    pub fn grab_frame(&self, dst: &mut [Complex<f32>]) -> bool {
        self.frame_snapshot.read(dst)
    }

    /// Copy the newest raw spectrum into `dst`. Non-blocking.
    pub fn grab_spectrum(&self, dst: &mut [f32]) -> bool {
        self.spectrum_snapshot.read(dst)
    }

    /// Stop everything and join the controller thread.
    pub fn shutdown(mut self) {
        self.interrupt.store(true, Ordering::Release);
        let _ = self.commands.send(OctCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for OctHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.interrupt.store(true, Ordering::Release);
            let _ = self.commands.send(OctCommand::Shutdown);
            let _ = thread.join();
        }
    }
}

enum ConfigUpdate {
    Image(ImageConfig),
    Processing(ProcessingConfig),
    Pattern(ScanPattern),
}

/// Everything the controller thread owns.
struct OctController {
    grabber: Box<dyn FrameGrabber>,
    dac: Box<dyn ScanDac>,
    commands: Receiver<OctCommand>,
    state: Arc<StateCell>,
    interrupt: Arc<AtomicBool>,

    image: Option<ImageConfig>,
    processing: Option<ProcessingConfig>,
    pattern: Option<ScanPattern>,
    geometry: Option<AcqGeometry>,

    plan: Option<Arc<WavenumberPlan>>,
    pool: Option<AlinePool>,
    processed: Option<Arc<FrameRing<Complex<f32>>>>,
    raw: Option<Arc<FrameRing<u16>>>,

    /// Masked A-lines of the frame currently being assembled.
    staging: Vec<u16>,
    /// The previous frame, stable while the pool reads it.
    stable: Vec<u16>,
    stable_ready: bool,
    /// Double-buffered background spectrum; the inactive half is rebuilt
    /// each cycle and swapped in for the next submission.
    background: [Vec<f32>; 2],
    bg_active: usize,
    /// Camera frame-counter stamps captured from each A-line head.
    stamps: Vec<u16>,

    cumulative_buffer: i64,
    dropped_buffers: u64,
    streamer: Option<FileStreamer>,

    frame_snapshot: Arc<Snapshot<Complex<f32>>>,
    spectrum_snapshot: Arc<Snapshot<f32>>,
}

impl OctController {
    fn run(mut self) {
        info!("controller started");
        loop {
            match self.commands.try_recv() {
                Ok(OctCommand::Shutdown) => {
                    info!("shutdown requested");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }
            match self.state.get() {
                ScanState::Scanning | ScanState::Acquiring => {
                    if let Err(e) = self.frame_cycle() {
                        error!(error = %e, "fatal error in frame cycle");
                        self.state.set(ScanState::Error);
                        break;
                    }
                    if self.state.get() == ScanState::Acquiring
                        && self.streamer.as_ref().is_some_and(|s| s.is_finished())
                    {
                        info!("acquisition reached its frame count");
                        self.stop_acquisition();
                    }
                }
                ScanState::Error => break,
                _ => thread::sleep(IDLE_SLEEP),
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut streamer) = self.streamer.take() {
            streamer.stop();
        }
        if matches!(
            self.state.get(),
            ScanState::Scanning | ScanState::Acquiring
        ) {
            let _ = self.grabber.stop_scan();
            let _ = self.dac.stop();
        }
        if let Some(pool) = self.pool.as_ref() {
            pool.wait_finished();
        }
        self.pool = None;
        let _ = self.grabber.close();
        let _ = self.dac.close();
        info!(dropped_buffers = self.dropped_buffers, "controller stopped");
    }

    fn handle_command(&mut self, cmd: OctCommand) {
        match cmd {
            OctCommand::ConfigureImage(cfg) => self.handle_configure(ConfigUpdate::Image(cfg)),
            OctCommand::ConfigureProcessing(cfg) => {
                self.handle_configure(ConfigUpdate::Processing(cfg))
            }
            OctCommand::SetScanPattern(p) => self.handle_configure(ConfigUpdate::Pattern(p)),
            OctCommand::StartScan => self.start_scan(),
            OctCommand::StopScan => self.stop_scan(),
            OctCommand::StartAcquisition(req) => self.start_acquisition(req),
            OctCommand::StopAcquisition => self.stop_acquisition(),
            OctCommand::Shutdown => unreachable!("handled by the main loop"),
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    fn handle_configure(&mut self, update: ConfigUpdate) {
        if let Err(e) = self.try_configure(update) {
            warn!(error = %e, "configuration rejected");
        }
    }

    fn try_configure(&mut self, update: ConfigUpdate) -> OctResult<()> {
        match self.state.get() {
            ScanState::Acquiring => return Err(OctError::AcquisitionActive),
            ScanState::Unopened | ScanState::Error => {
                return Err(OctError::InvalidState(self.state.get()))
            }
            _ => {}
        }
        // A scan in progress is stopped, reconfigured, and restarted.
        let was_scanning = self.state.get() == ScanState::Scanning;
        if was_scanning {
            self.stop_scan();
        }
        let result = match update {
            ConfigUpdate::Image(cfg) => self.apply_image(cfg),
            ConfigUpdate::Processing(cfg) => self.apply_processing(cfg),
            ConfigUpdate::Pattern(p) => self.apply_pattern(p),
        };
        self.update_ready();
        if was_scanning && self.state.get() == ScanState::Ready {
            self.start_scan();
        }
        result
    }

    fn apply_image(&mut self, config: ImageConfig) -> OctResult<()> {
        config.validate()?;
        if let Err(e) = self.grabber.setup_buffers(
            config.aline_size,
            config.alines_per_buffer,
            config.frames_to_buffer,
        ) {
            // Buffer-setup failure rejects the new geometry but is not
            // fatal; the previous configuration is discarded either way.
            self.image = None;
            self.rebuild_derived();
            return Err(e);
        }
        info!(
            aline_size = config.aline_size,
            alines_in_image = config.alines_in_image,
            roi_size = config.roi_size,
            "image configured"
        );
        self.image = Some(config);
        self.rebuild_derived();
        Ok(())
    }

    fn apply_processing(&mut self, config: ProcessingConfig) -> OctResult<()> {
        if let Some(image) = self.image.as_ref() {
            config.validate(image)?;
        }
        self.processing = Some(config);
        self.rebuild_derived();
        Ok(())
    }

    fn apply_pattern(&mut self, pattern: ScanPattern) -> OctResult<()> {
        pattern.validate()?;
        if let Err(e) = self.dac.set_pattern(&pattern) {
            self.pattern = None;
            return Err(e);
        }
        debug!(samples = pattern.len(), "scan pattern uploaded");
        self.pattern = Some(pattern);
        Ok(())
    }

    /// Rebuild everything derived from the image + processing pair: copy
    /// blocks, rings, pool, staging and background buffers, display slots.
    fn rebuild_derived(&mut self) {
        self.geometry = None;
        self.plan = None;
        self.pool = None;
        self.processed = None;
        self.raw = None;
        self.stable_ready = false;
        let (Some(image), Some(processing)) = (self.image.as_ref(), self.processing.as_ref())
        else {
            return;
        };
        match AcqGeometry::derive(image, processing) {
            Ok(geometry) => {
                self.staging = vec![0u16; geometry.raw_frame_len];
                self.stable = vec![0u16; geometry.raw_frame_len];
                self.stamps = vec![0u16; image.alines_in_image];
                self.background = [
                    vec![0.0; image.aline_size],
                    vec![0.0; image.aline_size],
                ];
                self.bg_active = 0;
                self.processed = Some(FrameRing::new(
                    image.frames_to_buffer,
                    geometry.processed_capacity,
                ));
                self.raw = Some(FrameRing::new(image.frames_to_buffer, geometry.raw_frame_len));
                self.pool = Some(AlinePool::new(image));
                self.frame_snapshot.reset(geometry.processed_frame_len);
                self.spectrum_snapshot.reset(image.aline_size);
                self.geometry = Some(geometry);
            }
            Err(e) => warn!(error = %e, "image and processing configurations are incompatible"),
        }
    }

    fn update_ready(&mut self) {
        if matches!(self.state.get(), ScanState::Open | ScanState::Ready) {
            if self.geometry.is_some() && self.pattern.is_some() {
                self.state.set(ScanState::Ready);
            } else {
                self.state.set(ScanState::Open);
            }
        }
    }

    // ------------------------------------------------------------------
    // Scan lifecycle
    // ------------------------------------------------------------------

    fn start_scan(&mut self) {
        if self.state.get() != ScanState::Ready {
            warn!(state = ?self.state.get(), "start_scan ignored");
            return;
        }
        self.interrupt.store(false, Ordering::Release);
        self.stable_ready = false;
        self.cumulative_buffer = 0;
        self.dropped_buffers = 0;
        if let Some(ring) = self.processed.as_ref() {
            ring.clear();
        }
        if let Some(ring) = self.raw.as_ref() {
            ring.clear();
        }
        if let Err(e) = self.start_devices() {
            error!(error = %e, "failed to start scan");
            self.state.set(ScanState::Error);
            return;
        }
        self.state.set(ScanState::Scanning);
        info!("scanning");
    }

    fn start_devices(&mut self) -> OctResult<()> {
        self.dac.start()?;
        self.grabber.start_scan()?;
        Ok(())
    }

    fn stop_scan(&mut self) {
        match self.state.get() {
            ScanState::Acquiring => {
                self.stop_acquisition();
                self.stop_devices();
            }
            ScanState::Scanning => self.stop_devices(),
            _ => debug!("stop_scan ignored"),
        }
    }

    fn stop_devices(&mut self) {
        if let Some(pool) = self.pool.as_ref() {
            pool.wait_finished();
        }
        let grabber = self.grabber.stop_scan();
        let dac = self.dac.stop();
        self.interrupt.store(false, Ordering::Release);
        self.stable_ready = false;
        if let Err(e) = grabber.and(dac) {
            error!(error = %e, "failed to stop scan");
            self.state.set(ScanState::Error);
        } else {
            self.state.set(ScanState::Ready);
            info!("scan stopped");
        }
    }

    // ------------------------------------------------------------------
    // Acquisition lifecycle
    // ------------------------------------------------------------------

    fn start_acquisition(&mut self, request: AcquisitionRequest) {
        if self.state.get() != ScanState::Scanning {
            warn!(state = ?self.state.get(), "start_acquisition ignored");
            return;
        }
        let Some(geometry) = self.geometry.as_ref() else {
            warn!("start_acquisition without a configuration");
            return;
        };
        if let Some(parent) = request.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                warn!(path = %request.path.display(), "acquisition path does not exist");
                return;
            }
        }
        let format = if request.save_processed {
            StreamFormat::RawVolume
        } else {
            StreamFormat::RawSpectra
        };
        let streamer = match format {
            StreamFormat::RawVolume => {
                let Some(ring) = self.processed.as_ref() else {
                    return;
                };
                FileStreamer::start(
                    Arc::clone(ring),
                    StreamConfig {
                        path: request.path.clone(),
                        max_gb: request.max_gb,
                        frame_len: geometry.processed_frame_len,
                        n_frames: request.n_frames,
                        start_count: None,
                    },
                )
            }
            StreamFormat::RawSpectra => {
                let Some(ring) = self.raw.as_ref() else {
                    return;
                };
                FileStreamer::start(
                    Arc::clone(ring),
                    StreamConfig {
                        path: request.path.clone(),
                        max_gb: request.max_gb,
                        frame_len: geometry.raw_frame_len,
                        n_frames: request.n_frames,
                        start_count: None,
                    },
                )
            }
        };
        self.streamer = Some(streamer);
        if let Err(e) = self.dac.set_start_trigger(true) {
            warn!(error = %e, "failed to raise the start trigger");
        }
        self.state.set(ScanState::Acquiring);
        info!(path = %request.path.display(), ?format, "acquiring");
    }

    fn stop_acquisition(&mut self) {
        if self.state.get() != ScanState::Acquiring {
            debug!("stop_acquisition ignored");
            return;
        }
        if let Some(mut streamer) = self.streamer.take() {
            streamer.stop();
        }
        if let Err(e) = self.dac.set_start_trigger(false) {
            warn!(error = %e, "failed to drop the start trigger");
        }
        self.state.set(ScanState::Scanning);
        info!("acquisition stopped");
    }

    // ------------------------------------------------------------------
    // Frame cycle
    // ------------------------------------------------------------------

    /// One acquisition cycle: submit the previous frame, assemble the next
    /// one from the grabber while the pool works, then finish the previous
    /// frame. Recoverable conditions are absorbed here; an `Err` is fatal.
    fn frame_cycle(&mut self) -> OctResult<()> {
        let inflight = if self.stable_ready {
            self.submit_previous()?
        } else {
            None
        };

        let Some(image) = self.image.as_ref() else {
            return Err(OctError::InvalidState(self.state.get()));
        };
        let aline_size = image.aline_size;
        let alines_in_image = image.alines_in_image;
        let subtract_background = self
            .processing
            .as_ref()
            .is_some_and(|p| p.subtract_background);
        let Some(geometry) = self.geometry.as_ref() else {
            return Err(OctError::InvalidState(self.state.get()));
        };

        // The background accumulator for this frame; the pool reads the
        // other half.
        let build = 1 - self.bg_active;
        self.background[build].fill(0.0);

        let mut interrupted = false;
        for b in 0..geometry.buffers_per_frame {
            if self.interrupt.load(Ordering::Acquire) {
                interrupted = true;
                break;
            }
            let requested = self.cumulative_buffer;
            let buffer = self.grabber.examine_buffer(requested)?;
            if buffer.index != requested {
                self.dropped_buffers += 1;
                debug!(
                    requested,
                    delivered = buffer.index,
                    last_stamp = self.stamps.last().copied().unwrap_or(0),
                    "grabber dropped buffers"
                );
                self.cumulative_buffer = buffer.index;
            }
            for block in &geometry.copy_blocks[b] {
                let src = &buffer.data[block.src_aline * aline_size..][..block.len * aline_size];
                let dst =
                    &mut self.staging[block.dst_aline * aline_size..][..block.len * aline_size];
                dst.copy_from_slice(src);
            }
            self.grabber.release_buffer()?;
            // Capture the camera's frame-counter stamps, then zero them so
            // they do not leak into the spectra.
            for block in &geometry.copy_blocks[b] {
                for a in 0..block.len {
                    let aline = block.dst_aline + a;
                    self.stamps[aline] = self.staging[aline * aline_size];
                    self.staging[aline * aline_size] = 0;
                }
            }
            self.cumulative_buffer += 1;
        }

        if interrupted {
            debug!("frame cycle interrupted at a sub-buffer boundary");
        } else {
            if subtract_background {
                for aline in self.staging.chunks_exact(aline_size) {
                    for (acc, &s) in self.background[build].iter_mut().zip(aline.iter()) {
                        *acc += s as f32;
                    }
                }
                let norm = 1.0 / alines_in_image as f32;
                for acc in self.background[build].iter_mut() {
                    *acc *= norm;
                }
            }
            self.bg_active = build;

            // The pool reads the stable copy while the next frame lands in
            // the staging buffer.
            std::mem::swap(&mut self.staging, &mut self.stable);
            self.stable_ready = true;

            if let Some(raw) = self.raw.as_ref() {
                raw.push(&self.stable);
            }
            let stable = &self.stable;
            self.spectrum_snapshot.publish_with(aline_size, |dst| {
                for (d, &s) in dst.iter_mut().zip(stable[..aline_size].iter()) {
                    *d = s as f32;
                }
            });
        }

        if let Some(slot) = inflight {
            self.finalize_frame(slot)?;
        }
        Ok(())
    }

    /// Refresh the interpolation plan if `(aline_size, interpdk)` changed.
    fn ensure_plan(&mut self) {
        let (Some(image), Some(processing)) = (self.image.as_ref(), self.processing.as_ref())
        else {
            return;
        };
        if !processing.interp {
            return;
        }
        let stale = self.plan.as_ref().map_or(true, |p| {
            p.aline_size() != image.aline_size || p.interpdk() != processing.interpdk
        });
        if stale {
            debug!(interpdk = processing.interpdk, "building interpolation plan");
            self.plan = Some(Arc::new(WavenumberPlan::new(
                image.aline_size,
                processing.interpdk,
            )));
        }
    }

    /// Hand the stable frame to the pool, pipelined against the next
    /// acquisition. Returns the processed-ring slot the job writes into.
    fn submit_previous(&mut self) -> OctResult<Option<HeadSlot<Complex<f32>>>> {
        self.ensure_plan();
        let Some(processing) = self.processing.as_ref() else {
            return Ok(None);
        };
        let plan = if processing.interp {
            self.plan.clone()
        } else {
            None
        };
        let Some(processed) = self.processed.as_ref() else {
            return Ok(None);
        };
        let Some(pool) = self.pool.as_mut() else {
            return Ok(None);
        };
        if !pool.is_finished() {
            // Every cycle waits on the barrier, so this only happens if a
            // worker stalls; skip this frame and catch up.
            warn!("processing pool busy, dropping one frame");
            pool.wait_finished();
            return Ok(None);
        }
        let mut slot = processed.lock_out_head();
        // SAFETY: `slot`, `stable`, the apodization window and the active
        // background stay untouched until finalize_frame waits on the pool
        // barrier later this cycle.
        unsafe {
            pool.submit(
                &mut slot[..],
                &self.stable,
                plan,
                &processing.apod_window,
                &self.background[self.bg_active],
            )?;
        }
        Ok(Some(slot))
    }

    /// Wait for the pool, aggregate repeats in place, publish the display
    /// frame, and release the slot into the processed ring.
    fn finalize_frame(&mut self, mut slot: HeadSlot<Complex<f32>>) -> OctResult<()> {
        let (Some(image), Some(processing), Some(geometry), Some(pool)) = (
            self.image.as_ref(),
            self.processing.as_ref(),
            self.geometry.as_ref(),
            self.pool.as_ref(),
        ) else {
            return Err(OctError::InvalidState(self.state.get()));
        };
        pool.wait_finished();

        let roi = image.roi_size;
        let n_blines = geometry.n_blines;
        let mut bline_len = image.alines_per_bline;
        if processing.aline_repeat_mode == RepeatMode::Mean && image.n_aline_repeat > 1 {
            aggregate::aline_mean(&mut slot, roi, bline_len, n_blines, image.n_aline_repeat);
            bline_len /= image.n_aline_repeat;
        }
        match processing.bline_repeat_mode {
            RepeatMode::Diff => {
                aggregate::bline_diff(&mut slot, roi, bline_len, n_blines);
            }
            RepeatMode::Mean if image.n_bline_repeat > 1 => {
                aggregate::bline_mean(&mut slot, roi, bline_len, n_blines, image.n_bline_repeat);
            }
            _ => {}
        }

        let out_len = geometry.processed_frame_len;
        let frame = &slot[..out_len];
        self.frame_snapshot
            .publish_with(out_len, |dst| dst.copy_from_slice(frame));
        drop(slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{FailingGrabber, MockDac, MockFill, MockGrabber};

    fn channels() -> DacChannels {
        DacChannels {
            x: "Dev1/ao0".into(),
            y: "Dev1/ao1".into(),
            line_trigger: "Dev1/ao2".into(),
            frame_trigger: "Dev1/ao3".into(),
            start_trigger: "Dev1/ao4".into(),
        }
    }

    #[test]
    fn test_open_failure_reports_device_error() {
        let result = open(
            Box::new(FailingGrabber),
            Box::new(MockDac::new()),
            "missing",
            &channels(),
        );
        assert!(matches!(result, Err(OctError::Device(_))));
    }

    #[test]
    fn test_open_and_shutdown() {
        let handle = open(
            Box::new(MockGrabber::new(MockFill::Constant(0))),
            Box::new(MockDac::new()),
            "img0",
            &channels(),
        )
        .unwrap();
        assert_eq!(handle.state(), ScanState::Open);
        assert!(!handle.is_ready());
        handle.shutdown();
    }
}
