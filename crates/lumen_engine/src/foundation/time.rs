//! Frame timing

use std::time::Instant;

/// High-precision timer for frame timing
pub struct Timer {
    last_frame: Instant,
    delta_time: f32,
    total_time: f32,
    frame_count: u64,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Create a new timer
    pub fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            delta_time: 0.0,
            total_time: 0.0,
            frame_count: 0,
        }
    }

    /// Advance the timer by one frame and return the elapsed seconds
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        self.advance(now.duration_since(self.last_frame).as_secs_f32());
        self.last_frame = now;
        self.delta_time
    }

    fn advance(&mut self, seconds: f32) {
        self.delta_time = seconds;
        self.total_time += seconds;
        self.frame_count += 1;
    }

    /// Seconds elapsed during the last frame
    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// Seconds elapsed since the timer was created
    pub fn total_time(&self) -> f32 {
        self.total_time
    }

    /// Number of ticks so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average frames per second since creation
    #[allow(clippy::cast_precision_loss)]
    pub fn average_fps(&self) -> f32 {
        if self.total_time > 0.0 {
            self.frame_count as f32 / self.total_time
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_advance_accumulates_time_and_frames() {
        let mut timer = Timer::new();
        timer.advance(0.5);
        timer.advance(0.25);
        assert_eq!(timer.frame_count(), 2);
        assert_relative_eq!(timer.delta_time(), 0.25);
        assert_relative_eq!(timer.total_time(), 0.75);
        assert_relative_eq!(timer.average_fps(), 2.0 / 0.75);
    }

    #[test]
    fn test_fresh_timer_reports_zero_fps() {
        assert_relative_eq!(Timer::new().average_fps(), 0.0);
    }
}
