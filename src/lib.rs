//! Real-time acquisition and processing core for spectral-domain OCT.
//!
//! Raw 16-bit spectral frames stream from a line-scan camera, pass through a
//! data-parallel A-line transform (background subtraction, wavenumber
//! linearization, apodization, real-to-complex FFT, ROI crop), and land in
//! an overwrite-tolerant ring that feeds both the file streamer and the
//! display snapshots, while a scan pattern drives the galvanometers in
//! lockstep with camera framing.
//!
//! Open an instrument with [`open`], passing driver implementations of the
//! [`hardware`] traits, then configure and control it through the returned
//! [`OctHandle`].

pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod hardware;
pub mod messages;

pub use controller::{open, OctHandle};
pub use error::{OctError, OctResult};
