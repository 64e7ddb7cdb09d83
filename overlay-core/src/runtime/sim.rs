//! Deterministic in-process host.
//!
//! Time only moves when the driver advances it.  DOM events are queued and
//! delivered before any frame or timer that is due at the same instant;
//! events emitted while nobody listens for their kind are dropped, just as a
//! browser would not call an unregistered handler.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use super::{EventKind, Host, HostEvent, ListenerId, RequestId, VideoElement};
use crate::rendering::surface::{PixelSize, Size};

/// 60 Hz.
pub const DEFAULT_REFRESH: Duration = Duration::from_nanos(16_666_667);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub frames_requested: u64,
    pub frames_cancelled: u64,
    pub frames_fired: u64,
    pub timers_set: u64,
    pub timers_cleared: u64,
    pub timers_fired: u64,
    pub events_dropped: u64,
}

#[derive(Debug)]
struct SimState {
    now: Duration,
    refresh: Duration,
    dpr: f64,
    next_id: u64,
    listeners: BTreeMap<ListenerId, EventKind>,
    dom_queue: VecDeque<EventKind>,
    frames: BTreeMap<RequestId, Duration>,
    timers: BTreeMap<RequestId, Duration>,
    stats: SimStats,
}

impl SimState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_listening(&self, kind: EventKind) -> bool {
        self.listeners.values().any(|&k| k == kind)
    }

    fn next_vsync(&self) -> Duration {
        let refresh = self.refresh.as_nanos().max(1);
        let ticks = self.now.as_nanos() / refresh + 1;
        Duration::from_nanos((ticks * refresh) as u64)
    }

    /// Earliest scheduled frame or timer; frames win ties.
    fn earliest_due(&self) -> Option<(Duration, HostEvent)> {
        let frame = self
            .frames
            .iter()
            .min_by_key(|(id, due)| (**due, **id))
            .map(|(&id, &due)| (due, HostEvent::AnimationFrame(id)));
        let timer = self
            .timers
            .iter()
            .min_by_key(|(id, due)| (**due, **id))
            .map(|(&id, &due)| (due, HostEvent::Timeout(id)));
        match (frame, timer) {
            (Some(f), Some(t)) => Some(if t.0 < f.0 { t } else { f }),
            (f, t) => f.or(t),
        }
    }
}

/// Cheap to clone; clones share one clock and scheduler.
#[derive(Debug, Clone)]
pub struct SimHost {
    state: Rc<RefCell<SimState>>,
}

impl SimHost {
    pub fn new() -> Self {
        Self::with_refresh(DEFAULT_REFRESH)
    }

    pub fn with_refresh(refresh: Duration) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                now: Duration::ZERO,
                refresh,
                dpr: 1.0,
                next_id: 0,
                listeners: BTreeMap::new(),
                dom_queue: VecDeque::new(),
                frames: BTreeMap::new(),
                timers: BTreeMap::new(),
                stats: SimStats::default(),
            })),
        }
    }

    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    pub fn set_device_pixel_ratio(&self, dpr: f64) {
        self.state.borrow_mut().dpr = dpr;
    }

    /// Queue a DOM event for delivery at the current instant.
    pub fn emit(&self, kind: EventKind) {
        let mut state = self.state.borrow_mut();
        if state.is_listening(kind) {
            state.dom_queue.push_back(kind);
        } else {
            state.stats.events_dropped += 1;
        }
    }

    /// Pop the next event due at or before `deadline`, advancing the clock to
    /// its due time.  Returns `None` once nothing more is due; the clock is
    /// then left where the last event put it (see [`SimHost::advance_to`]).
    pub fn next_event(&self, deadline: Duration) -> Option<HostEvent> {
        let mut state = self.state.borrow_mut();

        while let Some(kind) = state.dom_queue.pop_front() {
            // Listener may have been removed after the event was queued.
            if state.is_listening(kind) {
                return Some(HostEvent::Dom(kind));
            }
            state.stats.events_dropped += 1;
        }

        let (due, event) = state.earliest_due()?;
        if due > deadline {
            return None;
        }
        state.now = state.now.max(due);
        match event {
            HostEvent::AnimationFrame(id) => {
                state.frames.remove(&id);
                state.stats.frames_fired += 1;
            }
            HostEvent::Timeout(id) => {
                state.timers.remove(&id);
                state.stats.timers_fired += 1;
            }
            HostEvent::Dom(_) => {}
        }
        Some(event)
    }

    /// Move the clock forward without delivering anything.
    pub fn advance_to(&self, instant: Duration) {
        let mut state = self.state.borrow_mut();
        state.now = state.now.max(instant);
    }

    pub fn listener_count(&self) -> usize {
        self.state.borrow().listeners.len()
    }

    pub fn pending_frames(&self) -> usize {
        self.state.borrow().frames.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    pub fn has_pending_events(&self) -> bool {
        let state = self.state.borrow();
        !state.dom_queue.is_empty() || !state.frames.is_empty() || !state.timers.is_empty()
    }

    pub fn stats(&self) -> SimStats {
        self.state.borrow().stats
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SimHost {
    fn add_listener(&self, kind: EventKind) -> ListenerId {
        let mut state = self.state.borrow_mut();
        let id = ListenerId(state.alloc_id());
        state.listeners.insert(id, kind);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.state.borrow_mut().listeners.remove(&id);
    }

    fn request_animation_frame(&self) -> RequestId {
        let mut state = self.state.borrow_mut();
        let id = RequestId(state.alloc_id());
        let due = state.next_vsync();
        state.frames.insert(id, due);
        state.stats.frames_requested += 1;
        id
    }

    fn cancel_animation_frame(&self, id: RequestId) {
        let mut state = self.state.borrow_mut();
        if state.frames.remove(&id).is_some() {
            state.stats.frames_cancelled += 1;
        }
    }

    fn set_timeout(&self, delay: Duration) -> RequestId {
        let mut state = self.state.borrow_mut();
        let id = RequestId(state.alloc_id());
        let due = state.now + delay;
        state.timers.insert(id, due);
        state.stats.timers_set += 1;
        id
    }

    fn clear_timeout(&self, id: RequestId) {
        let mut state = self.state.borrow_mut();
        if state.timers.remove(&id).is_some() {
            state.stats.timers_cleared += 1;
        }
    }

    fn device_pixel_ratio(&self) -> f64 {
        self.state.borrow().dpr
    }
}

// ── Video ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct VideoModel {
    natural: Option<PixelSize>,
    display: Size,
    duration: f64,
    /// Position at `anchor`.
    position: f64,
    anchor: Duration,
    playing: bool,
}

/// A video element whose clock follows the [`SimHost`] clock while playing.
/// Clones share one element.
#[derive(Debug, Clone)]
pub struct SimulatedVideo {
    host: SimHost,
    model: Rc<RefCell<VideoModel>>,
}

impl SimulatedVideo {
    pub fn new(host: &SimHost, display: Size) -> Self {
        Self {
            host: host.clone(),
            model: Rc::new(RefCell::new(VideoModel {
                natural: None,
                display,
                duration: 0.0,
                position: 0.0,
                anchor: Duration::ZERO,
                playing: false,
            })),
        }
    }

    pub fn set_source(&self, natural: PixelSize, duration: f64) {
        let mut model = self.model.borrow_mut();
        model.natural = Some(natural);
        model.duration = duration.max(0.0);
        model.position = 0.0;
        model.playing = false;
    }

    pub fn clear_source(&self) {
        let mut model = self.model.borrow_mut();
        model.natural = None;
        model.duration = 0.0;
        model.position = 0.0;
        model.playing = false;
    }

    /// Change the intrinsic size without resetting playback.
    pub fn set_natural_size(&self, natural: PixelSize) {
        self.model.borrow_mut().natural = Some(natural);
    }

    pub fn set_display_size(&self, display: Size) {
        self.model.borrow_mut().display = display;
    }

    pub fn duration(&self) -> f64 {
        self.model.borrow().duration
    }

    pub fn is_playing(&self) -> bool {
        self.model.borrow().playing
    }

    pub fn has_ended(&self) -> bool {
        let duration = self.duration();
        duration > 0.0 && self.current_time() >= duration
    }

    pub fn play(&self) {
        let now = self.host.now();
        let position = self.current_time();
        let mut model = self.model.borrow_mut();
        model.position = position;
        model.anchor = now;
        model.playing = model.natural.is_some();
    }

    pub fn pause(&self) {
        let position = self.current_time();
        let mut model = self.model.borrow_mut();
        model.position = position;
        model.playing = false;
    }

    pub fn seek(&self, time: f64) {
        let now = self.host.now();
        let mut model = self.model.borrow_mut();
        let upper = if model.duration > 0.0 { model.duration } else { f64::MAX };
        model.position = time.clamp(0.0, upper);
        model.anchor = now;
    }
}

impl VideoElement for SimulatedVideo {
    fn current_time(&self) -> f64 {
        let model = self.model.borrow();
        if !model.playing {
            return model.position;
        }
        let elapsed = self.host.now().saturating_sub(model.anchor).as_secs_f64();
        (model.position + elapsed).min(model.duration)
    }

    fn natural_size(&self) -> Option<PixelSize> {
        self.model.borrow().natural
    }

    fn display_size(&self) -> Size {
        self.model.borrow().display
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_without_listener_are_dropped() {
        let host = SimHost::new();
        host.emit(EventKind::TimeUpdate);
        assert_eq!(host.next_event(Duration::from_secs(1)), None);
        assert_eq!(host.stats().events_dropped, 1);

        let id = host.add_listener(EventKind::TimeUpdate);
        host.emit(EventKind::TimeUpdate);
        host.remove_listener(id);
        assert_eq!(host.next_event(Duration::from_secs(1)), None);
        assert_eq!(host.stats().events_dropped, 2);
    }

    #[test]
    fn test_frames_fire_on_next_vsync() {
        let host = SimHost::with_refresh(Duration::from_millis(10));
        host.advance_to(Duration::from_millis(3));
        let id = host.request_animation_frame();
        assert_eq!(host.next_event(Duration::from_millis(5)), None);
        assert_eq!(
            host.next_event(Duration::from_millis(20)),
            Some(HostEvent::AnimationFrame(id))
        );
        assert_eq!(host.now(), Duration::from_millis(10));
    }

    #[test]
    fn test_dom_events_precede_scheduled_work() {
        let host = SimHost::with_refresh(Duration::from_millis(10));
        host.add_listener(EventKind::Seeked);
        let timer = host.set_timeout(Duration::ZERO);
        host.emit(EventKind::Seeked);
        assert_eq!(
            host.next_event(Duration::ZERO),
            Some(HostEvent::Dom(EventKind::Seeked))
        );
        assert_eq!(host.next_event(Duration::ZERO), Some(HostEvent::Timeout(timer)));
    }

    #[test]
    fn test_cancelled_work_never_fires() {
        let host = SimHost::new();
        let frame = host.request_animation_frame();
        let timer = host.set_timeout(Duration::from_millis(100));
        host.cancel_animation_frame(frame);
        host.clear_timeout(timer);
        assert_eq!(host.next_event(Duration::from_secs(10)), None);
        let stats = host.stats();
        assert_eq!(stats.frames_cancelled, 1);
        assert_eq!(stats.timers_cleared, 1);
        assert!(!host.has_pending_events());
    }

    #[test]
    fn test_video_clock_follows_host_while_playing() {
        let host = SimHost::new();
        let video = SimulatedVideo::new(&host, Size::new(640.0, 360.0));
        video.play();
        assert!(!video.is_playing(), "no source loaded yet");

        video.set_source(PixelSize::new(1280, 720), 10.0);
        video.play();
        host.advance_to(Duration::from_millis(1500));
        assert!((video.current_time() - 1.5).abs() < 1e-9);
        video.pause();
        host.advance_to(Duration::from_secs(5));
        assert!((video.current_time() - 1.5).abs() < 1e-9);

        video.seek(99.0);
        assert_eq!(video.current_time(), 10.0);
        assert!(video.has_ended());
    }
}
