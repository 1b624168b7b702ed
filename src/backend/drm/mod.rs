//! DRM/KMS output driver.
//!
//! One device, one connector, one plane, two dumb buffers. Frames are
//! presented through atomic commits that request a page-flip event, and a
//! new commit is never issued while a previous one has not completed. The
//! blocking vsync wait has no timeout; hardware that never completes a flip
//! (say, a panel that was physically removed) hangs the caller.

mod buffers;
mod commit;
mod props;
mod scan;

use std::env;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use anyhow::{ensure, Context};
use drm::buffer::DrmFourcc;
use drm::control::atomic::AtomicModeReq;
use drm::control::{
    connector, crtc, plane, property, AtomicCommitFlags, Device as ControlDevice, Event,
};
use drm::{ClientCapability, Device, DriverCapability};
use tracing::{debug, info, trace, warn};

use buffers::FramePair;
use props::PropertyTable;

pub use commit::{CommitError, FlushPlan, PowerError, PresentState};

const CARD_ENV: &str = "DRM_CARD";
const DEFAULT_CARD: &str = "/dev/dri/card0";

const FORMAT: DrmFourcc = DrmFourcc::Xrgb8888;

const DPMS_ON: u64 = 0;
const DPMS_OFF: u64 = 3;

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub stride: u32,
    pub width: u32,
    pub height: u32,
    pub dpi: Option<u32>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlipStats {
    pub blocking_waits: u64,
    pub completions: u64,
}

pub struct DrmOutput {
    card: Card,
    connector: connector::Handle,
    crtc: crtc::Handle,
    crtc_index: u32,
    plane: plane::Handle,
    mode: drm::control::Mode,
    mode_blob: property::Value<'static>,
    size_mm: (u32, u32),
    plane_props: PropertyTable,
    crtc_props: PropertyTable,
    connector_props: PropertyTable,
    frames: FramePair,
    present: PresentState,
    stats: FlipStats,
}

impl DrmOutput {
    /// Opens the device named by `DRM_CARD` (default `/dev/dri/card0`) and
    /// brings up the whole output: capability checks, connector and plane
    /// discovery, property tables and the two frame buffers. Any failure
    /// here means the device cannot be driven at all.
    pub fn open() -> anyhow::Result<Self> {
        let path = env::var(CARD_ENV).unwrap_or_else(|_| DEFAULT_CARD.to_owned());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)
            .with_context(|| format!("error opening {path}"))?;
        let card = Card(file);

        let has_dumb = card
            .get_driver_capability(DriverCapability::DumbBuffer)
            .context("error querying the dumb buffer capability")?;
        ensure!(has_dumb != 0, "{path} has no dumb buffer support");

        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .context("error enabling universal planes")?;
        card.set_client_capability(ClientCapability::Atomic, true)
            .context("no atomic modesetting support")?;

        let scan = scan::scan_output(&card, FORMAT)?;

        let mode_blob = card
            .create_property_blob(&scan.mode)
            .context("error creating the mode blob")?;

        let plane_props =
            PropertyTable::fetch(&card, scan.plane).context("error getting plane properties")?;
        let crtc_props =
            PropertyTable::fetch(&card, scan.crtc).context("error getting CRTC properties")?;
        let connector_props = PropertyTable::fetch(&card, scan.connector)
            .context("error getting connector properties")?;

        let (width, height) = scan.mode.size();
        let frames = FramePair::allocate(&card, (width.into(), height.into()), FORMAT)?;

        let interval = refresh_interval(
            scan.mode.clock(),
            scan.mode.hsync().2.into(),
            scan.mode.vsync().2.into(),
        );
        info!(
            "{}: {width}x{height} ({} mm x {} mm) at {} Hz ({interval:?} per frame), {:?}",
            scan.connector_name,
            scan.size_mm.0,
            scan.size_mm.1,
            scan.mode.vrefresh(),
            FORMAT,
        );

        Ok(Self {
            card,
            connector: scan.connector,
            crtc: scan.crtc,
            crtc_index: scan.crtc_index,
            plane: scan.plane,
            mode: scan.mode,
            mode_blob,
            size_mm: scan.size_mm,
            plane_props,
            crtc_props,
            connector_props,
            frames,
            present: PresentState::new(),
            stats: FlipStats::default(),
        })
    }

    pub fn geometry(&self) -> Geometry {
        let (width, height) = self.mode.size();
        Geometry {
            stride: self.frames.pitch(),
            width: width.into(),
            height: height.into(),
            dpi: dpi_for(width.into(), self.size_mm.0),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.present.is_busy()
    }

    pub fn powered(&self) -> bool {
        self.present.powered()
    }

    pub fn back_buffer(&self) -> usize {
        self.present.back_buffer()
    }

    /// Bit position of the CRTC in the device's CRTC list.
    pub fn crtc_index(&self) -> u32 {
        self.crtc_index
    }

    pub fn buffer_mut(&mut self, index: usize) -> &mut [u8] {
        self.frames.frame_mut(index).data_mut()
    }

    /// A dup of the device fd for registration with the dispatch loop.
    pub fn event_source_fd(&self) -> io::Result<File> {
        self.card.0.try_clone()
    }

    pub fn take_stats(&mut self) -> FlipStats {
        std::mem::take(&mut self.stats)
    }

    /// Presents `index`. Returns `Ok(true)` when a transaction is now
    /// outstanding and `Ok(false)` when the frame was only recorded because
    /// the output is powered off.
    pub fn submit(&mut self, index: usize) -> Result<bool, CommitError> {
        match self.present.begin_flush(index)? {
            FlushPlan::SkipPoweredOff => {
                trace!("output is off, not presenting buffer {index}");
                Ok(false)
            }
            FlushPlan::Submit { modeset } => {
                self.commit(index, modeset)?;
                Ok(true)
            }
        }
    }

    fn commit(&mut self, index: usize, modeset: bool) -> Result<(), CommitError> {
        let mut req = AtomicModeReq::new();
        let mut flags = AtomicCommitFlags::PAGE_FLIP_EVENT;

        if modeset {
            req.add_property(
                self.connector,
                self.connector_prop("CRTC_ID")?,
                property::Value::CRTC(Some(self.crtc)),
            );
            req.add_property(self.crtc, self.crtc_prop("MODE_ID")?, self.mode_blob);
            req.add_property(
                self.crtc,
                self.crtc_prop("ACTIVE")?,
                property::Value::Boolean(true),
            );
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        let (width, height) = self.mode.size();
        let (width, height) = (u64::from(width), u64::from(height));
        let fb = self.frames.frame(index).fb();

        req.add_property(
            self.plane,
            self.plane_prop("FB_ID")?,
            property::Value::Framebuffer(Some(fb)),
        );
        req.add_property(
            self.plane,
            self.plane_prop("CRTC_ID")?,
            property::Value::CRTC(Some(self.crtc)),
        );
        // The source rectangle is in 16.16 fixed point.
        req.add_property(
            self.plane,
            self.plane_prop("SRC_X")?,
            property::Value::UnsignedRange(0),
        );
        req.add_property(
            self.plane,
            self.plane_prop("SRC_Y")?,
            property::Value::UnsignedRange(0),
        );
        req.add_property(
            self.plane,
            self.plane_prop("SRC_W")?,
            property::Value::UnsignedRange(width << 16),
        );
        req.add_property(
            self.plane,
            self.plane_prop("SRC_H")?,
            property::Value::UnsignedRange(height << 16),
        );
        req.add_property(
            self.plane,
            self.plane_prop("CRTC_X")?,
            property::Value::SignedRange(0),
        );
        req.add_property(
            self.plane,
            self.plane_prop("CRTC_Y")?,
            property::Value::SignedRange(0),
        );
        req.add_property(
            self.plane,
            self.plane_prop("CRTC_W")?,
            property::Value::UnsignedRange(width),
        );
        req.add_property(
            self.plane,
            self.plane_prop("CRTC_H")?,
            property::Value::UnsignedRange(height),
        );

        match self.card.atomic_commit(flags, req) {
            Ok(()) => {
                self.present.submitted(index);
                trace!("buffer {index} committed, modeset {modeset}");
                Ok(())
            }
            Err(err) => {
                self.present.submit_failed();
                Err(CommitError::Rejected(err))
            }
        }
    }

    /// Blocks until the outstanding transaction completes. Signals ready
    /// right away when nothing is outstanding. Returns the buffer index the
    /// completion freed, if any.
    pub fn wait_for_vsync(&mut self) -> io::Result<Option<usize>> {
        if !self.present.is_busy() {
            return Ok(None);
        }

        loop {
            let mut pfd = libc::pollfd {
                fd: self.card.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            let rv = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rv == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // The transaction is unrecoverable at this point; discard it
                // so the producer is not blocked forever.
                self.present.completed();
                return Err(err);
            }

            break;
        }

        self.stats.blocking_waits += 1;
        self.dispatch_events()
    }

    /// Drains completion events from the device. Returns the buffer index
    /// freed by a page-flip completion, if one arrived.
    pub fn dispatch_events(&mut self) -> io::Result<Option<usize>> {
        let mut freed = None;

        let events = match self.card.receive_events() {
            Ok(events) => events,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err),
        };

        for event in events {
            match event {
                Event::PageFlip(flip) => {
                    if flip.crtc != self.crtc {
                        continue;
                    }
                    trace!("page flip on crtc {}", u32::from(flip.crtc));
                    self.stats.completions += 1;
                    freed = self.present.completed();
                }
                _ => (),
            }
        }

        Ok(freed)
    }

    /// Switches the connector's DPMS state. On power-on the most recently
    /// presented buffer is resubmitted so the panel shows current content.
    pub fn set_power(&mut self, on: bool) -> Result<(), PowerError> {
        let prop = self
            .connector_props
            .resolve("DPMS")
            .ok_or(PowerError::Unsupported)?;

        let value = if on { DPMS_ON } else { DPMS_OFF };
        self.card.set_property(self.connector, prop, value)?;
        debug!("output power {}", if on { "on" } else { "off" });

        if on {
            if let Some(index) = self.present.power_on() {
                match self.submit(index) {
                    Ok(_) => (),
                    Err(err) => warn!("error resubmitting buffer {index} after power on: {err}"),
                }
            }
        } else {
            self.present.power_off();
        }

        Ok(())
    }

    /// Releases the hardware-side objects. The mappings stay alive until
    /// the process exits; the kernel cleans up the rest at close.
    pub fn shutdown(&mut self) {
        for index in 0..2 {
            let fb = self.frames.frame(index).fb();
            if let Err(err) = self.card.destroy_framebuffer(fb) {
                debug!("error destroying framebuffer {index}: {err}");
            }
        }

        let blob: u64 = self.mode_blob.into();
        if blob != 0 {
            if let Err(err) = self.card.destroy_property_blob(blob) {
                debug!("error destroying the mode blob: {err}");
            }
        }
    }

    fn plane_prop(&self, name: &'static str) -> Result<property::Handle, CommitError> {
        self.plane_props
            .resolve(name)
            .ok_or(CommitError::MissingProperty(name))
    }

    fn crtc_prop(&self, name: &'static str) -> Result<property::Handle, CommitError> {
        self.crtc_props
            .resolve(name)
            .ok_or(CommitError::MissingProperty(name))
    }

    fn connector_prop(&self, name: &'static str) -> Result<property::Handle, CommitError> {
        self.connector_props
            .resolve(name)
            .ok_or(CommitError::MissingProperty(name))
    }
}

/// Dots per inch from the pixel width and the physical width in
/// millimetres, rounded up. `None` when the panel does not report a size.
fn dpi_for(width: u32, mm_width: u32) -> Option<u32> {
    if mm_width == 0 {
        return None;
    }
    Some((width * 25400).div_ceil(mm_width * 1000))
}

/// Frame duration from the pixel clock (kHz) and the horizontal and
/// vertical totals.
fn refresh_interval(clock_khz: u32, htotal: u64, vtotal: u64) -> Duration {
    if clock_khz == 0 {
        return Duration::ZERO;
    }
    let numerator = htotal * vtotal * 1_000_000;
    let denominator = u64::from(clock_khz);
    Duration::from_nanos((numerator + denominator / 2) / denominator)
}
