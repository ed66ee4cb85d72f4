//! Frame timing for encode and render measurements.

use std::time::{Duration, Instant};

/// Measures the time spent encoding and rendering frames.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    frame_start: Instant,
    last_encoding: Duration,
    frames: u64,
}

impl FrameTimer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            frame_start: now,
            last_encoding: Duration::ZERO,
            frames: 0,
        }
    }

    /// Total time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Marks the start of frame encoding.
    pub fn begin_frame(&mut self) {
        self.frame_start = Instant::now();
    }

    /// Marks the end of frame encoding and returns its duration.
    pub fn end_frame(&mut self) -> Duration {
        self.last_encoding = self.frame_start.elapsed();
        self.frames += 1;
        self.last_encoding
    }

    /// Duration of the most recently finished frame.
    pub fn last_encoding(&self) -> Duration {
        self.last_encoding
    }

    /// Number of frames measured so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Average encoding time per frame since creation.
    pub fn average_frame_secs(&self) -> f32 {
        if self.frames == 0 {
            return 0.0;
        }
        self.elapsed().as_secs_f32() / self.frames as f32
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_counting() {
        let mut timer = FrameTimer::new();
        assert_eq!(timer.frames(), 0);
        assert_eq!(timer.average_frame_secs(), 0.0);

        timer.begin_frame();
        let encoding = timer.end_frame();
        assert_eq!(timer.frames(), 1);
        assert_eq!(timer.last_encoding(), encoding);
        assert!(timer.elapsed() >= encoding);
    }
}
