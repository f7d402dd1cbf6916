//! Dwell confirmation
//!
//! Debounces noisy presence samples into a single activation. Presence must
//! hold continuously for the dwell threshold; any absent sample drops all
//! progress.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::sample::PresenceSample;

/// Progress of the current dwell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwellState {
    /// No presence streak in progress
    Unconfirmed,
    /// Presence has held since `started_at`; the dwell timer is running
    Pending { started_at: Instant },
    /// Activation has been emitted; further samples are ignored until reset
    Confirmed,
}

/// Single-shot debounce from presence samples to one activation
#[derive(Debug)]
pub struct DwellConfirmer {
    threshold: Duration,
    state: DwellState,
}

impl DwellConfirmer {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            state: DwellState::Unconfirmed,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DwellState {
        self.state
    }

    /// Feed one sample taken at `now`
    pub fn observe(&mut self, sample: &PresenceSample, now: Instant) {
        match (self.state, sample.detected) {
            (DwellState::Confirmed, _) => {}
            (DwellState::Unconfirmed, true) => {
                debug!(locus = ?sample.locus, "presence detected, dwell started");
                self.state = DwellState::Pending { started_at: now };
            }
            // Leave a running dwell untouched so progress stays monotonic.
            (DwellState::Pending { .. }, true) => {}
            (DwellState::Pending { started_at }, false) => {
                debug!(
                    held_ms = now.saturating_duration_since(started_at).as_millis() as u64,
                    "presence lost, dwell cancelled"
                );
                self.state = DwellState::Unconfirmed;
            }
            (DwellState::Unconfirmed, false) => {}
        }
    }

    /// When the running dwell timer elapses, if one is running
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DwellState::Pending { started_at } => Some(started_at + self.threshold),
            _ => None,
        }
    }

    /// Returns true exactly once: the first call at or after the deadline
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.state = DwellState::Confirmed;
                true
            }
            _ => false,
        }
    }

    /// Drop any progress (detector disarmed or re-armed)
    pub fn reset(&mut self) {
        self.state = DwellState::Unconfirmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACING: Duration = Duration::from_millis(100);
    const THRESHOLD: Duration = Duration::from_millis(1200);

    /// Drive a confirmer the way the adapter does: timer expiry is checked
    /// before each sample is applied. Returns the sample indices after
    /// which an activation fired.
    fn run(samples: &[bool]) -> Vec<usize> {
        let base = Instant::now();
        let mut confirmer = DwellConfirmer::new(THRESHOLD);
        let mut fired = Vec::new();
        for (i, detected) in samples.iter().enumerate() {
            let now = base + SPACING * i as u32;
            if confirmer.fire_if_due(now) {
                fired.push(i);
            }
            let sample = if *detected {
                PresenceSample::present_at(0.5)
            } else {
                PresenceSample::absent()
            };
            confirmer.observe(&sample, now);
        }
        let end = base + SPACING * samples.len() as u32;
        if confirmer.fire_if_due(end) {
            fired.push(samples.len());
        }
        fired
    }

    #[test]
    fn test_sustained_presence_activates_once() {
        // 13 samples at 100ms: t=0..=1200, the dwell expires at t=1200,
        // i.e. right after the 12th sample.
        let fired = run(&[true; 13]);
        assert_eq!(fired, vec![12]);
    }

    #[test]
    fn test_activation_is_single_shot() {
        let fired = run(&[true; 40]);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_short_streak_never_activates() {
        // Absent at t=1100, before the dwell timer is due.
        let mut samples = vec![true; 11];
        samples.push(false);
        samples.extend([false; 20]);
        assert!(run(&samples).is_empty());
    }

    #[test]
    fn test_interruption_resets_progress() {
        let mut samples = vec![true; 5];
        samples.push(false);
        samples.extend([true; 13]);
        let fired = run(&samples);
        // The second streak starts at index 6 and needs its own 1200ms.
        assert_eq!(fired, vec![6 + 12]);
    }

    #[test]
    fn test_no_partial_credit_across_streaks() {
        let mut samples = Vec::new();
        for _ in 0..5 {
            samples.extend([true; 10]);
            samples.push(false);
        }
        assert!(run(&samples).is_empty());
    }

    #[test]
    fn test_running_dwell_is_not_restarted() {
        let base = Instant::now();
        let mut confirmer = DwellConfirmer::new(THRESHOLD);
        confirmer.observe(&PresenceSample::present_at(0.4), base);
        let deadline = confirmer.deadline();
        confirmer.observe(&PresenceSample::present_at(0.6), base + SPACING * 3);
        assert_eq!(confirmer.deadline(), deadline);
        assert_eq!(deadline, Some(base + THRESHOLD));
    }

    #[test]
    fn test_absence_cancels_timer() {
        let base = Instant::now();
        let mut confirmer = DwellConfirmer::new(THRESHOLD);
        confirmer.observe(&PresenceSample::present_at(0.5), base);
        assert!(confirmer.deadline().is_some());
        confirmer.observe(&PresenceSample::absent(), base + SPACING);
        assert_eq!(confirmer.deadline(), None);
        assert_eq!(confirmer.state(), DwellState::Unconfirmed);
        assert!(!confirmer.fire_if_due(base + THRESHOLD * 2));
    }

    #[test]
    fn test_reset_after_confirmation() {
        let base = Instant::now();
        let mut confirmer = DwellConfirmer::new(THRESHOLD);
        confirmer.observe(&PresenceSample::present_at(0.5), base);
        assert!(confirmer.fire_if_due(base + THRESHOLD));
        confirmer.observe(&PresenceSample::present_at(0.5), base + THRESHOLD * 2);
        assert_eq!(confirmer.state(), DwellState::Confirmed);

        confirmer.reset();
        assert_eq!(confirmer.state(), DwellState::Unconfirmed);
    }
}
