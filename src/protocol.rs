//! Pacing protocols: trains of rectangular stimulus pulses.

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacingEvent {
    pub level: f64,
    pub start: f64,
    pub duration: f64,
    /// Repeat period; 0 for a one-off event.
    pub period: f64,
    /// Number of occurrences of a periodic event; 0 repeats forever.
    pub multiplier: u32,
}

impl PacingEvent {
    fn occurrence(&self, t: f64) -> Option<u64> {
        if t < self.start {
            return None;
        }
        if self.period <= 0.0 {
            return Some(0);
        }
        let k = ((t - self.start) / self.period).floor() as u64;
        if self.multiplier > 0 && k >= u64::from(self.multiplier) {
            return None;
        }
        Some(k)
    }

    fn is_active(&self, t: f64) -> bool {
        match self.occurrence(t) {
            Some(k) => t < self.start + k as f64 * self.period + self.duration,
            None => false,
        }
    }

    /// First pulse edge strictly after `t + eps`.
    fn next_edge(&self, t: f64, eps: f64) -> Option<f64> {
        let after = |x: f64| x > t + eps;
        if self.period <= 0.0 {
            return [self.start, self.start + self.duration].into_iter().find(|&x| after(x));
        }
        let k0 = ((t - self.start) / self.period).floor().max(0.0) as u64;
        for k in k0..=k0 + 1 {
            if self.multiplier > 0 && k >= u64::from(self.multiplier) {
                return None;
            }
            let s = self.start + k as f64 * self.period;
            if after(s) {
                return Some(s);
            }
            if after(s + self.duration) {
                return Some(s + self.duration);
            }
        }
        None
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Protocol {
    events: Vec<PacingEvent>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// A periodic pulse train with `limit` pulses (0 = unlimited).
    pub fn blocktrain(period: f64, duration: f64, offset: f64, level: f64, limit: u32) -> Result<Self> {
        let mut p = Self::new();
        p.schedule(level, offset, duration, period, limit)?;
        Ok(p)
    }

    pub fn schedule(
        &mut self,
        level: f64,
        start: f64,
        duration: f64,
        period: f64,
        multiplier: u32,
    ) -> Result<()> {
        if !(duration > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "pacing event duration must be positive, got {duration}"
            )));
        }
        if period < 0.0 || (period > 0.0 && duration > period) {
            return Err(Error::InvalidConfig(format!(
                "pacing event of {duration} ms does not fit its period {period} ms"
            )));
        }
        if !start.is_finite() || !level.is_finite() {
            return Err(Error::InvalidConfig("pacing event start and level must be finite".to_string()));
        }
        self.events.push(PacingEvent {
            level,
            start,
            duration,
            period,
            multiplier,
        });
        self.events
            .sort_by(|a, b| a.start.total_cmp(&b.start));
        Ok(())
    }

    pub fn events(&self) -> &[PacingEvent] {
        &self.events
    }

    /// First scheduled event.
    pub fn head(&self) -> Option<&PacingEvent> {
        self.events.first()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn level_at(&self, t: f64) -> f64 {
        self.events
            .iter()
            .filter(|e| e.is_active(t))
            .map(|e| e.level)
            .sum()
    }

    /// Time of the next change in pacing level after `t`.
    pub fn next_change(&self, t: f64) -> Option<f64> {
        let eps = 1e-9 * t.abs().max(1.0);
        self.events
            .iter()
            .filter_map(|e| e.next_edge(t, eps))
            .min_by(f64::total_cmp)
    }

    /// Pulse train with `period`, keeping the head event's duration and
    /// multiplying its level by `level_multiplier`.
    pub fn retimed(&self, period: f64, level_multiplier: f64) -> Result<Self> {
        let head = self.head().ok_or_else(|| {
            Error::InvalidConfig("model protocol has no pacing event to retime".to_string())
        })?;
        Self::blocktrain(period, head.duration, 0.0, head.level * level_multiplier, 0)
    }
}
