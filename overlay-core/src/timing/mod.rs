//! timing: playback clock ↔ detection frame index
//!
//! The backend samples detections per video frame while the player reports a
//! continuous `currentTime`.  `to_frame_index` floors `time * fps`;
//! `to_time` goes the other way and is only meant for seeking: many instants
//! collapse onto one index, so `to_frame_index(to_time(i))` is not
//! guaranteed to return `i` (floating error can land one frame early).

use thiserror::Error;

/// Rejected input to the mapper.  Inputs are never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum InvalidArgument {
    #[error("fps must be finite and positive, got {0}")]
    Fps(f64),
    #[error("playback time must be finite and non-negative, got {0}")]
    Time(f64),
    #[error("frame index for t={time}s at {fps} fps does not fit in u64")]
    Overflow { time: f64, fps: f64 },
}

/// A frame rate that has already been validated.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Fps(f64);

impl Fps {
    pub fn new(fps: f64) -> Result<Self, InvalidArgument> {
        check_fps(fps)?;
        Ok(Self(fps))
    }

    pub fn get(self) -> f64 {
        self.0
    }

    pub fn frame_index(self, time: f64) -> Result<u64, InvalidArgument> {
        to_frame_index(time, self.0)
    }

    /// Start time of `frame_index`, for seeking.
    pub fn time_of(self, frame_index: u64) -> f64 {
        frame_index as f64 / self.0
    }
}

impl TryFrom<f64> for Fps {
    type Error = InvalidArgument;

    fn try_from(fps: f64) -> Result<Self, Self::Error> {
        Self::new(fps)
    }
}

/// `floor(time * fps)`.
pub fn to_frame_index(time: f64, fps: f64) -> Result<u64, InvalidArgument> {
    check_fps(fps)?;
    if !time.is_finite() || time < 0.0 {
        return Err(InvalidArgument::Time(time));
    }

    let product = (time * fps).floor();
    // `u64::MAX as f64` rounds up to 2^64, so `>=` rejects everything that
    // would saturate on the cast below.
    if !product.is_finite() || product >= u64::MAX as f64 {
        return Err(InvalidArgument::Overflow { time, fps });
    }
    Ok(product as u64)
}

/// `frame_index / fps`.  Lossy inverse of [`to_frame_index`].
pub fn to_time(frame_index: u64, fps: f64) -> Result<f64, InvalidArgument> {
    check_fps(fps)?;
    Ok(frame_index as f64 / fps)
}

/// Render seconds as `MM:SS.cc` for side panels and CLI output.
pub fn format_timestamp(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "00:00.00".to_string();
    }
    let total_centis = (seconds * 100.0).floor() as u64;
    let minutes = total_centis / 6000;
    let secs = (total_centis / 100) % 60;
    let centis = total_centis % 100;
    format!("{minutes:02}:{secs:02}.{centis:02}")
}

fn check_fps(fps: f64) -> Result<(), InvalidArgument> {
    if fps.is_finite() && fps > 0.0 {
        Ok(())
    } else {
        Err(InvalidArgument::Fps(fps))
    }
}
