//! runtime: the host services an overlay depends on
//!
//! In a browser these are `addEventListener`, `requestAnimationFrame`,
//! `setTimeout` and `window.devicePixelRatio`, plus the `<video>` element
//! itself.  The overlay only ever talks to them through [`Host`] and
//! [`VideoElement`], and receives everything the host wants to tell it as a
//! [`HostEvent`] passed to `OverlayRenderer::handle`.

use std::time::Duration;

use crate::rendering::surface::{PixelSize, Size};

pub mod sim;

pub use sim::{SimHost, SimStats, SimulatedVideo};

/// Handle returned by [`Host::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Handle for a pending animation frame or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Element and window notifications the overlay subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    LoadedMetadata,
    TimeUpdate,
    Seeked,
    /// The video's intrinsic size changed (`resize` on the element).
    VideoResize,
    /// Media source dropped; natural size is no longer known.
    Emptied,
    FullscreenChange,
    WindowResize,
    /// Layout change of the element's container (a `ResizeObserver`).
    ContainerResize,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::LoadedMetadata,
        EventKind::TimeUpdate,
        EventKind::Seeked,
        EventKind::VideoResize,
        EventKind::Emptied,
        EventKind::FullscreenChange,
        EventKind::WindowResize,
        EventKind::ContainerResize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::LoadedMetadata => "loadedmetadata",
            EventKind::TimeUpdate => "timeupdate",
            EventKind::Seeked => "seeked",
            EventKind::VideoResize => "resize",
            EventKind::Emptied => "emptied",
            EventKind::FullscreenChange => "fullscreenchange",
            EventKind::WindowResize => "window-resize",
            EventKind::ContainerResize => "container-resize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Dom(EventKind),
    AnimationFrame(RequestId),
    Timeout(RequestId),
}

/// Scheduling and subscription services.  Methods take `&self`; hosts are
/// expected to use interior mutability, the way browser globals behave.
pub trait Host {
    fn add_listener(&self, kind: EventKind) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
    fn request_animation_frame(&self) -> RequestId;
    fn cancel_animation_frame(&self, id: RequestId);
    fn set_timeout(&self, delay: Duration) -> RequestId;
    fn clear_timeout(&self, id: RequestId);
    fn device_pixel_ratio(&self) -> f64;
}

/// Read-only view of the live video element.
pub trait VideoElement {
    /// Playback position in seconds.
    fn current_time(&self) -> f64;
    /// Intrinsic size of the decoded video, `None` until metadata has loaded.
    fn natural_size(&self) -> Option<PixelSize>;
    /// Rendered size of the element in CSS pixels.
    fn display_size(&self) -> Size;
}
