// src/rl/command.rs
//
// Fixed velocity command that can stand in for the joystick.

use std::time::{Duration, Instant};

use crate::config::FixedCommandConfig;

/// Constant `[lin_vel_x, lin_vel_y, ang_vel_z]` command with optional expiry.
///
/// Shared between the control thread (toggle and expiry) and the policy thread
/// (observation), behind `Arc<parking_lot::Mutex<_>>`.
#[derive(Debug, Clone)]
pub struct FixedCommand {
    values: [f32; 3],
    /// Zero means no expiry.
    duration: Duration,
    active_since: Option<Instant>,
}

impl FixedCommand {
    pub fn new(values: [f32; 3], duration_s: f32) -> Self {
        Self {
            values,
            duration: Duration::from_secs_f32(duration_s.max(0.0)),
            active_since: None,
        }
    }

    pub fn from_config(cfg: &FixedCommandConfig) -> Self {
        Self::new([cfg.lin_vel_x, cfg.lin_vel_y, cfg.ang_vel_z], cfg.duration)
    }

    pub fn values(&self) -> [f32; 3] {
        self.values
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    /// The override, or `None` when the joystick command applies.
    pub fn current(&self) -> Option<[f32; 3]> {
        self.active_since.map(|_| self.values)
    }

    /// Flip on/off. Returns the new state.
    pub fn toggle(&mut self, now: Instant) -> bool {
        if self.active_since.is_some() {
            self.active_since = None;
        } else {
            self.active_since = Some(now);
        }
        self.is_active()
    }

    pub fn deactivate(&mut self) {
        self.active_since = None;
    }

    /// Deactivate once the configured duration has elapsed. Returns true if it expired now.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.active_since {
            Some(since) if !self.duration.is_zero() && now.saturating_duration_since(since) >= self.duration => {
                self.active_since = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_and_expire() {
        let t0 = Instant::now();
        let mut cmd = FixedCommand::new([0.5, 0.0, 0.1], 1.0);
        assert_eq!(cmd.current(), None);
        assert!(cmd.toggle(t0));
        assert_eq!(cmd.current(), Some([0.5, 0.0, 0.1]));
        assert!(!cmd.expire(t0 + Duration::from_millis(500)));
        assert!(cmd.expire(t0 + Duration::from_secs(1)));
        assert!(!cmd.is_active());
    }

    #[test]
    fn zero_duration_never_expires() {
        let t0 = Instant::now();
        let mut cmd = FixedCommand::new([1.0, 0.0, 0.0], 0.0);
        cmd.toggle(t0);
        assert!(!cmd.expire(t0 + Duration::from_secs(3600)));
        assert!(!cmd.toggle(t0));
    }
}
