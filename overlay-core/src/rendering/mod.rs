//! rendering: keep detection boxes drawn over a playing video
//!
//! `OverlayRenderer` owns a transparent [`Surface`] stacked on a video
//! element.  Every trigger funnels into one of two operations:
//!
//! * `resync` sizes the surface buffer to `natural * dpr` device pixels, its
//!   CSS box to the element's display size, and *sets* the transform to
//!   `scale(dpr)`.
//! * `repaint(frame_index)` clears the surface and draws that frame's boxes,
//!   scaled from source pixels by `display / natural`.
//!
//! Time updates and data changes are coalesced onto a single pending
//! animation frame.  Fullscreen changes wait for a settle timer because the
//! element's layout is not final when the event fires.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::detection::{BoundingBox, BoxRect, DetectionLookup, DetectionSet};
use crate::runtime::{EventKind, Host, HostEvent, ListenerId, RequestId, VideoElement};
use crate::timing::Fps;

pub mod palette;
pub mod raster;
pub mod recording;
pub mod surface;

pub use palette::{LabelStyle, Palette};
pub use raster::RasterSurface;
pub use recording::{DrawOp, RecordingSurface};
pub use surface::{Color, Font, PixelSize, Rect, Size, Surface, Transform};

/// Settle delay after a fullscreen change before re-measuring.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

const PROFILE_EVERY: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    /// No video element.
    Unattached,
    /// Attached, but the video's natural size is unknown; nothing is drawn.
    Syncing,
    /// Surface sized and transformed; drawing proceeds.
    Ready,
    /// Torn down.  Terminal.
    Destroyed,
}

/// Surface geometry captured by the most recent resync.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub natural: PixelSize,
    pub display: Size,
    pub dpr: f64,
    pub buffer: PixelSize,
}

impl Geometry {
    /// Source-pixel → display-pixel factors.
    pub fn scale(&self) -> (f64, f64) {
        (
            self.display.width / self.natural.width as f64,
            self.display.height / self.natural.height as f64,
        )
    }
}

#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub palette: Palette,
    pub style: LabelStyle,
    pub settle_delay: Duration,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        Self {
            palette: Palette::default(),
            style: LabelStyle::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PaintStats {
    pub paints: u64,
    /// Repaints skipped because the frame and data were unchanged.
    pub suppressed: u64,
    pub boxes_drawn: u64,
    pub malformed: u64,
    pub resyncs: u64,
    pub paint_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PaintKey {
    frame_index: u64,
    generation: u64,
}

type FrameObserver = Box<dyn FnMut(u64, &[BoundingBox])>;

pub struct OverlayRenderer<V: VideoElement, S: Surface, H: Host> {
    host: H,
    surface: Option<S>,
    video: Option<V>,
    state: OverlayState,
    geometry: Option<Geometry>,
    fps: Fps,
    lookup: DetectionLookup,
    options: OverlayOptions,
    /// Every listener registered at attach time, removed together.
    listeners: Vec<ListenerId>,
    pending_frame: Option<RequestId>,
    pending_settle: Option<RequestId>,
    last_painted: Option<PaintKey>,
    observers: Vec<FrameObserver>,
    stats: PaintStats,
}

impl<V: VideoElement, S: Surface, H: Host> OverlayRenderer<V, S, H> {
    pub fn new(host: H, surface: S, fps: Fps, options: OverlayOptions) -> Self {
        Self {
            host,
            surface: Some(surface),
            video: None,
            state: OverlayState::Unattached,
            geometry: None,
            fps,
            lookup: DetectionLookup::new(),
            options,
            listeners: Vec::new(),
            pending_frame: None,
            pending_settle: None,
            last_painted: None,
            observers: Vec::new(),
            stats: PaintStats::default(),
        }
    }

    pub fn state(&self) -> OverlayState {
        self.state
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    pub fn fps(&self) -> Fps {
        self.fps
    }

    pub fn surface(&self) -> Option<&S> {
        self.surface.as_ref()
    }

    pub fn video(&self) -> Option<&V> {
        self.video.as_ref()
    }

    pub fn stats(&self) -> PaintStats {
        self.stats
    }

    pub fn detections(&self) -> Option<&Arc<DetectionSet>> {
        self.lookup.current()
    }

    /// Take the surface away.  Every later operation becomes a no-op.
    pub fn release_surface(&mut self) -> Option<S> {
        self.surface.take()
    }

    /// Subscribe to repaints.  Called with the frame index and the boxes that
    /// were drawn, after every repaint including empty ones.
    pub fn on_frame_rendered<F>(&mut self, observer: F)
    where
        F: FnMut(u64, &[BoundingBox]) + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub fn attach(&mut self, video: V) {
        if self.state == OverlayState::Destroyed {
            debug!("attach ignored: overlay is destroyed");
            return;
        }
        if self.video.is_some() {
            self.detach();
        }

        self.listeners = EventKind::ALL
            .iter()
            .map(|&kind| self.host.add_listener(kind))
            .collect();
        let metadata_loaded = video.natural_size().is_some();
        self.video = Some(video);
        self.transition(OverlayState::Syncing);

        if metadata_loaded {
            self.resync();
        }
    }

    /// Release the element and every subscription.  Returns the element.
    ///
    /// Lands in `Unattached`, not `Syncing`: with no element left there is
    /// nothing to wait for.  Losing only the media source (`emptied`) is what
    /// goes back to `Syncing`.
    pub fn detach(&mut self) -> Option<V> {
        self.teardown();
        self.geometry = None;
        self.last_painted = None;
        if let Some(surface) = self.surface.as_mut() {
            surface.clear();
        }
        let video = self.video.take();
        if self.state != OverlayState::Destroyed {
            self.transition(OverlayState::Unattached);
        }
        video
    }

    /// Terminal teardown.  After this no host callback is outstanding and
    /// every call is a no-op.
    pub fn unmount(&mut self) {
        if self.state == OverlayState::Destroyed {
            return;
        }
        self.detach();
        self.observers.clear();
        self.transition(OverlayState::Destroyed);
    }

    fn teardown(&mut self) {
        for id in self.listeners.drain(..) {
            self.host.remove_listener(id);
        }
        if let Some(id) = self.pending_frame.take() {
            self.host.cancel_animation_frame(id);
        }
        if let Some(id) = self.pending_settle.take() {
            self.host.clear_timeout(id);
        }
    }

    fn transition(&mut self, next: OverlayState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "overlay state");
            self.state = next;
        }
    }

    // ── Data ─────────────────────────────────────────────────────────────────

    /// Install a detection set.  The same `Arc` again is a no-op; a different
    /// allocation always re-indexes, even with equal contents.
    pub fn set_detections(&mut self, set: Arc<DetectionSet>) {
        if self.state == OverlayState::Destroyed {
            return;
        }
        if self.lookup.replace(set) {
            debug!(generation = self.lookup.generation(), "detections replaced");
            self.schedule_repaint();
        }
    }

    pub fn clear_detections(&mut self) {
        if self.state == OverlayState::Destroyed {
            return;
        }
        if self.lookup.clear() {
            self.schedule_repaint();
        }
    }

    pub fn set_fps(&mut self, fps: Fps) {
        if self.state == OverlayState::Destroyed || fps == self.fps {
            return;
        }
        self.fps = fps;
        self.schedule_repaint();
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn handle(&mut self, event: HostEvent) {
        if self.state == OverlayState::Destroyed {
            return;
        }
        match event {
            HostEvent::Dom(
                EventKind::LoadedMetadata
                | EventKind::VideoResize
                | EventKind::WindowResize
                | EventKind::ContainerResize,
            ) => self.resync(),
            HostEvent::Dom(EventKind::FullscreenChange) => self.arm_settle_timer(),
            HostEvent::Dom(EventKind::TimeUpdate | EventKind::Seeked) => self.schedule_repaint(),
            HostEvent::Dom(EventKind::Emptied) => self.lose_metadata(),
            HostEvent::AnimationFrame(id) if self.pending_frame == Some(id) => {
                self.pending_frame = None;
                self.paint_current();
            }
            HostEvent::Timeout(id) if self.pending_settle == Some(id) => {
                self.pending_settle = None;
                self.resync();
            }
            HostEvent::AnimationFrame(id) | HostEvent::Timeout(id) => {
                debug!(id = id.0, "ignoring stale host callback");
            }
        }
    }

    fn arm_settle_timer(&mut self) {
        if self.video.is_none() {
            return;
        }
        if let Some(id) = self.pending_settle.take() {
            self.host.clear_timeout(id);
        }
        self.pending_settle = Some(self.host.set_timeout(self.options.settle_delay));
    }

    /// Request a repaint on the next animation frame, replacing any request
    /// already pending.
    pub fn schedule_repaint(&mut self) {
        if self.state != OverlayState::Ready || self.surface.is_none() {
            return;
        }
        if let Some(id) = self.pending_frame.take() {
            self.host.cancel_animation_frame(id);
        }
        self.pending_frame = Some(self.host.request_animation_frame());
    }

    fn lose_metadata(&mut self) {
        if let Some(id) = self.pending_frame.take() {
            self.host.cancel_animation_frame(id);
        }
        self.geometry = None;
        self.last_painted = None;
        if let Some(surface) = self.surface.as_mut() {
            surface.clear();
        }
        if self.state == OverlayState::Ready {
            self.transition(OverlayState::Syncing);
        }
    }

    // ── Geometry ─────────────────────────────────────────────────────────────

    /// Re-measure the video and size the surface to match.  Idempotent.
    pub fn resync(&mut self) {
        let (Some(video), Some(surface)) = (self.video.as_ref(), self.surface.as_mut()) else {
            return;
        };
        let natural = match video.natural_size() {
            Some(size) if size.width > 0 && size.height > 0 => size,
            _ => {
                self.lose_metadata();
                return;
            }
        };
        let display_size = video.display_size();
        let dpr = sanitize_dpr(self.host.device_pixel_ratio());
        let buffer = natural.scaled(dpr);

        surface.resize(buffer, display_size);
        surface.set_transform(Transform::scale(dpr));

        let geometry = Geometry {
            natural,
            display: display_size,
            dpr,
            buffer,
        };
        if self.geometry != Some(geometry) {
            debug!(
                natural = %natural,
                buffer = %buffer,
                display_w = display_size.width,
                display_h = display_size.height,
                dpr,
                "overlay resynced"
            );
        }
        self.geometry = Some(geometry);
        self.stats.resyncs += 1;
        // Resizing wiped the surface, so whatever was painted is gone.
        self.last_painted = None;
        self.transition(OverlayState::Ready);
        self.schedule_repaint();
    }

    // ── Painting ─────────────────────────────────────────────────────────────

    fn paint_current(&mut self) {
        let Some(video) = self.video.as_ref() else {
            return;
        };
        let time = video.current_time();
        match self.fps.frame_index(time) {
            Ok(frame_index) => self.repaint(frame_index),
            Err(err) => warn!(time, %err, "cannot map playback time to a frame"),
        }
    }

    /// Clear and draw `frame_index`.  Skipped when the same frame of the same
    /// detection data is already on screen.
    pub fn repaint(&mut self, frame_index: u64) {
        if self.state != OverlayState::Ready {
            return;
        }
        let (Some(surface), Some(geometry)) = (self.surface.as_mut(), self.geometry) else {
            return;
        };
        let key = PaintKey {
            frame_index,
            generation: self.lookup.generation(),
        };
        if self.last_painted == Some(key) {
            self.stats.suppressed += 1;
            return;
        }

        let started = Instant::now();
        surface.clear();

        let boxes = self.lookup.boxes_for(frame_index);
        let (sx, sy) = geometry.scale();
        let mut malformed = 0u64;
        for bbox in boxes {
            match bbox.rect() {
                Ok(rect) => draw_box(surface, &self.options, bbox, rect.scaled(sx, sy)),
                Err(err) => {
                    malformed += 1;
                    warn!(frame_index, id = bbox.id, %err, "skipping malformed box");
                }
            }
        }

        let drawn: Cow<'_, [BoundingBox]> = if malformed == 0 {
            Cow::Borrowed(boxes)
        } else {
            Cow::Owned(boxes.iter().filter(|b| b.rect().is_ok()).cloned().collect())
        };
        for observer in &mut self.observers {
            observer(frame_index, &*drawn);
        }

        self.last_painted = Some(key);
        self.stats.paints += 1;
        self.stats.boxes_drawn += drawn.len() as u64;
        self.stats.malformed += malformed;
        self.stats.paint_time += started.elapsed();

        if self.stats.paints % PROFILE_EVERY == 0 {
            info!(
                paints = self.stats.paints,
                suppressed = self.stats.suppressed,
                boxes_drawn = self.stats.boxes_drawn,
                paint_us_per_frame = format!(
                    "{:.1}",
                    self.stats.paint_time.as_secs_f64() * 1e6 / self.stats.paints as f64
                ),
                "overlay paint timings"
            );
        }
    }
}

impl<V: VideoElement, S: Surface, H: Host> Drop for OverlayRenderer<V, S, H> {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Stroke the box, then a filled caption strip sitting on its top edge.
fn draw_box<S: Surface>(surface: &mut S, options: &OverlayOptions, bbox: &BoundingBox, rect: BoxRect) {
    let style = &options.style;
    let color = options.palette.color_for(&bbox.label);
    surface.stroke_rect(
        Rect::new(rect.x1, rect.y1, rect.width(), rect.height()),
        color,
        style.line_width,
    );

    let caption = bbox.caption();
    let text_width = surface.measure_text(&caption, &style.font);
    let strip = style.caption_height();
    surface.fill_rect(
        Rect::new(rect.x1, rect.y1 - strip, text_width + style.padding * 2.0, strip),
        color,
    );
    surface.fill_text(
        &caption,
        rect.x1 + style.padding,
        rect.y1 - style.padding,
        &style.font,
        style.text_color,
    );
}

fn sanitize_dpr(dpr: f64) -> f64 {
    if dpr.is_finite() && dpr > 0.0 {
        dpr
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionFrame, Label};
    use crate::runtime::{SimHost, SimulatedVideo};
    use std::cell::RefCell;
    use std::rc::Rc;

    type TestOverlay = OverlayRenderer<SimulatedVideo, RecordingSurface, SimHost>;

    fn overlay(host: &SimHost) -> TestOverlay {
        OverlayRenderer::new(
            host.clone(),
            RecordingSurface::new(),
            Fps::new(30.0).unwrap(),
            OverlayOptions::default(),
        )
    }

    fn set_with(frame_index: u64, boxes: Vec<BoundingBox>) -> Arc<DetectionSet> {
        Arc::new(vec![DetectionFrame {
            frame_index,
            time: None,
            boxes,
        }])
    }

    fn drain(host: &SimHost, overlay: &mut TestOverlay) {
        let deadline = host.now() + Duration::from_secs(1);
        while let Some(event) = host.next_event(deadline) {
            overlay.handle(event);
        }
    }

    #[test]
    fn test_attach_before_metadata_stays_syncing() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(400.0, 300.0));
        let mut overlay = overlay(&host);
        assert_eq!(overlay.state(), OverlayState::Unattached);

        overlay.attach(video.clone());
        assert_eq!(overlay.state(), OverlayState::Syncing);
        assert_eq!(host.listener_count(), EventKind::ALL.len());

        overlay.repaint(0);
        assert_eq!(overlay.stats().paints, 0);

        video.set_source(PixelSize::new(800, 600), 10.0);
        overlay.handle(HostEvent::Dom(EventKind::LoadedMetadata));
        assert_eq!(overlay.state(), OverlayState::Ready);
    }

    #[test]
    fn test_attach_after_metadata_is_ready_immediately() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(400.0, 300.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video);
        assert_eq!(overlay.state(), OverlayState::Ready);
        assert_eq!(host.pending_frames(), 1);
    }

    #[test]
    fn test_emptied_returns_to_syncing() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(400.0, 300.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video.clone());

        video.clear_source();
        overlay.handle(HostEvent::Dom(EventKind::Emptied));
        assert_eq!(overlay.state(), OverlayState::Syncing);
        assert_eq!(overlay.geometry(), None);
        assert_eq!(host.pending_frames(), 0);
    }

    #[test]
    fn test_detach_releases_listeners_and_returns_video() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(400.0, 300.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video);
        overlay.handle(HostEvent::Dom(EventKind::FullscreenChange));

        assert!(overlay.detach().is_some());
        assert_eq!(overlay.state(), OverlayState::Unattached);
        assert_eq!(host.listener_count(), 0);
        assert!(!host.has_pending_events());
    }

    #[test]
    fn test_resync_records_live_display_size() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(400.0, 300.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video.clone());
        assert_eq!(overlay.geometry().map(|g| g.display), Some(Size::new(400.0, 300.0)));

        video.set_display_size(Size::new(640.0, 480.0));
        overlay.resync();
        let geometry = overlay.geometry().unwrap();
        assert_eq!(geometry.display, Size::new(640.0, 480.0));
        assert_eq!(overlay.surface().unwrap().css_size(), geometry.display);
    }

    #[test]
    fn test_malformed_boxes_are_skipped_and_excluded_from_observer() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(800.0, 600.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video);

        let mut bad = BoundingBox::new(2, [0.0; 4], Label::IronPole);
        bad.xyxy = vec![1.0, 2.0, 3.0];
        overlay.set_detections(set_with(
            0,
            vec![
                BoundingBox::new(1, [10.0, 10.0, 50.0, 50.0], Label::IronPole),
                bad,
                BoundingBox::new(3, [60.0, 10.0, 90.0, 50.0], Label::ConcretePole),
            ],
        ));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        overlay.on_frame_rendered(move |_, boxes| {
            sink.borrow_mut()
                .push(boxes.iter().map(|b| b.id).collect::<Vec<_>>());
        });
        drain(&host, &mut overlay);

        let surface = overlay.surface().unwrap();
        assert_eq!(surface.strokes().len(), 2);
        assert_eq!(surface.texts(), vec!["1 iron_pole", "3 concrete_pole"]);
        assert_eq!(seen.borrow().as_slice(), &[vec![1, 3]]);
        assert_eq!(overlay.stats().malformed, 1);
    }

    #[test]
    fn test_caption_strip_sits_above_box() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(800.0, 600.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video);
        overlay.set_detections(set_with(
            0,
            vec![BoundingBox::new(1, [100.0, 200.0, 300.0, 600.0], Label::IronPole)],
        ));
        drain(&host, &mut overlay);

        let surface = overlay.surface().unwrap();
        let strip = surface
            .visible_ops()
            .iter()
            .find_map(|op| match op {
                DrawOp::FillRect { rect, color } => Some((*rect, *color)),
                _ => None,
            })
            .unwrap();
        let text_width = surface.measure_text("1 iron_pole", &Font::default());
        assert_eq!(strip.0, Rect::new(100.0, 178.0, text_width + 8.0, 22.0));
        assert_eq!(strip.1, palette::IRON_POLE);
    }

    #[test]
    fn test_invalid_dpr_falls_back_to_one() {
        let host = SimHost::new();
        host.set_device_pixel_ratio(f64::NAN);
        let video = SimulatedVideo::new(&host, Size::new(400.0, 300.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video);
        let geometry = overlay.geometry().unwrap();
        assert_eq!(geometry.dpr, 1.0);
        assert_eq!(geometry.buffer, PixelSize::new(800, 600));
    }

    #[test]
    fn test_released_surface_makes_operations_no_ops() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(400.0, 300.0));
        video.set_source(PixelSize::new(800, 600), 10.0);
        let mut overlay = overlay(&host);
        overlay.attach(video);
        drain(&host, &mut overlay);
        let painted = overlay.stats().paints;

        assert!(overlay.release_surface().is_some());
        overlay.resync();
        overlay.handle(HostEvent::Dom(EventKind::TimeUpdate));
        drain(&host, &mut overlay);
        assert_eq!(overlay.stats().paints, painted);
    }
}
