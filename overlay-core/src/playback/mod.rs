//! playback: drive an overlay through a simulated viewing session
//!
//! A `Session` wires one `OverlayRenderer` to a `SimulatedVideo` on a
//! `SimHost` and exposes the things a viewer does: load a source, play,
//! pause, seek, resize the window, toggle fullscreen.  Each action updates
//! the video model first and then fires the matching element event, the
//! order a browser uses.  While playing, `timeupdate` fires every 250 ms of
//! virtual time.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::detection::DetectionSet;
use crate::rendering::{OverlayOptions, OverlayRenderer, PixelSize, Size, Surface};
use crate::runtime::{EventKind, SimHost, SimulatedVideo, VideoElement};
use crate::timing::{Fps, InvalidArgument};

pub const TIMEUPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound for `settle`, so a host that keeps rescheduling cannot spin.
const SETTLE_LIMIT: Duration = Duration::from_secs(5);

pub type SimOverlay<S> = OverlayRenderer<SimulatedVideo, S, SimHost>;

pub struct Session<S: Surface> {
    host: SimHost,
    video: SimulatedVideo,
    overlay: SimOverlay<S>,
    next_timeupdate: Option<Duration>,
    /// Windowed display size saved while fullscreen.
    windowed: Option<Size>,
}

impl<S: Surface> Session<S> {
    /// New session with the overlay already attached to an empty video element.
    pub fn new(surface: S, fps: Fps, options: OverlayOptions, display: Size) -> Self {
        Self::with_host(SimHost::new(), surface, fps, options, display)
    }

    pub fn with_host(
        host: SimHost,
        surface: S,
        fps: Fps,
        options: OverlayOptions,
        display: Size,
    ) -> Self {
        let video = SimulatedVideo::new(&host, display);
        let mut overlay = OverlayRenderer::new(host.clone(), surface, fps, options);
        overlay.attach(video.clone());
        Self {
            host,
            video,
            overlay,
            next_timeupdate: None,
            windowed: None,
        }
    }

    pub fn host(&self) -> &SimHost {
        &self.host
    }

    pub fn video(&self) -> &SimulatedVideo {
        &self.video
    }

    pub fn overlay(&self) -> &SimOverlay<S> {
        &self.overlay
    }

    pub fn overlay_mut(&mut self) -> &mut SimOverlay<S> {
        &mut self.overlay
    }

    pub fn now(&self) -> Duration {
        self.host.now()
    }

    pub fn current_frame(&self) -> Result<u64, InvalidArgument> {
        self.overlay.fps().frame_index(self.video.current_time())
    }

    pub fn set_detections(&mut self, set: Arc<DetectionSet>) {
        self.overlay.set_detections(set);
    }

    // ── Viewer actions ───────────────────────────────────────────────────────

    pub fn load_metadata(&mut self, natural: PixelSize, duration: f64) {
        self.video.set_source(natural, duration);
        self.next_timeupdate = None;
        self.fire(EventKind::LoadedMetadata);
    }

    /// Drop the media source, as when the `src` attribute is removed.
    pub fn unload(&mut self) {
        self.video.clear_source();
        self.next_timeupdate = None;
        self.fire(EventKind::Emptied);
    }

    /// Intrinsic size changes mid-stream (adaptive bitrate switch).
    pub fn change_resolution(&mut self, natural: PixelSize) {
        self.video.set_natural_size(natural);
        self.fire(EventKind::VideoResize);
    }

    pub fn play(&mut self) {
        self.video.play();
        if self.video.is_playing() {
            self.next_timeupdate = Some(self.host.now() + TIMEUPDATE_INTERVAL);
        }
    }

    pub fn pause(&mut self) {
        self.video.pause();
        self.next_timeupdate = None;
        self.fire(EventKind::TimeUpdate);
    }

    pub fn seek(&mut self, time: f64) {
        self.video.seek(time);
        self.fire(EventKind::Seeked);
    }

    /// Seek to the start of `frame_index`.  Floating error may land one frame
    /// early; see `timing::to_time`.
    pub fn seek_frame(&mut self, frame_index: u64) {
        let time = self.overlay.fps().time_of(frame_index);
        self.seek(time);
    }

    pub fn resize_window(&mut self, display: Size) {
        self.video.set_display_size(display);
        self.fire(EventKind::WindowResize);
    }

    /// The page layout changed the element's box without a window resize.
    pub fn resize_container(&mut self, display: Size) {
        self.video.set_display_size(display);
        self.fire(EventKind::ContainerResize);
    }

    /// Browser zoom or moving the window to another monitor.
    pub fn set_device_pixel_ratio(&mut self, dpr: f64) {
        self.host.set_device_pixel_ratio(dpr);
        self.fire(EventKind::WindowResize);
    }

    pub fn enter_fullscreen(&mut self, screen: Size) {
        if self.windowed.is_none() {
            self.windowed = Some(self.video.display_size());
        }
        self.video.set_display_size(screen);
        self.fire(EventKind::FullscreenChange);
    }

    pub fn exit_fullscreen(&mut self) {
        if let Some(windowed) = self.windowed.take() {
            self.video.set_display_size(windowed);
            self.fire(EventKind::FullscreenChange);
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        self.windowed.is_some()
    }

    // ── Clock ────────────────────────────────────────────────────────────────

    /// Advance virtual time by `duration`, delivering everything that falls due.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.host.now() + duration;
        loop {
            let step = match self.next_timeupdate {
                Some(tick) if tick <= deadline => tick,
                _ => deadline,
            };
            self.pump(step);
            self.host.advance_to(step);

            if self.next_timeupdate == Some(step) {
                if self.video.has_ended() {
                    self.video.pause();
                    self.next_timeupdate = None;
                    debug!(at = ?step, "playback ended");
                } else {
                    self.next_timeupdate = Some(step + TIMEUPDATE_INTERVAL);
                }
                self.fire(EventKind::TimeUpdate);
            }

            if step >= deadline {
                break;
            }
        }
    }

    /// Deliver pending frames and timers until none remain, advancing the
    /// clock as far as needed (bounded).
    pub fn settle(&mut self) {
        let limit = self.host.now() + SETTLE_LIMIT;
        while let Some(event) = self.host.next_event(limit) {
            self.overlay.handle(event);
        }
    }

    /// Tear the overlay down while keeping the session inspectable.
    pub fn unmount(&mut self) {
        self.overlay.unmount();
        self.next_timeupdate = None;
    }

    fn fire(&mut self, kind: EventKind) {
        self.host.emit(kind);
        self.pump(self.host.now());
    }

    fn pump(&mut self, deadline: Duration) {
        while let Some(event) = self.host.next_event(deadline) {
            self.overlay.handle(event);
        }
    }
}
