//! Transport-viability negotiation
//!
//! Before a pair relies on datagrams, each side proves the path works in
//! both directions using two probe kinds sent over the datagram endpoint:
//!
//! ```text
//!   A                                B
//!   │ ──── TEST ───────────────────► │  B: working_for_peer = true
//!   │ ◄─── CONFIRM ───────────────── │
//!   │ A: working_for_us = true       │
//!   │ ◄─── TEST ──────────────────── │
//!   │ A: working_for_peer = true     │
//!   │ ──── CONFIRM ────────────────► │  B: working_for_us = true
//! ```
//!
//! A pair is `Working` once both flags are set on a side. Until then every
//! application packet goes over the reliable transport. Probing stops after
//! `max_probe_attempts` unanswered TESTs; the pair then stays reliable.

/// Probe counters and flags for one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Viability {
    /// Our datagrams reach the peer (we received a CONFIRM)
    pub working_for_us: bool,
    /// The peer's datagrams reach us (we received a TEST)
    pub working_for_peer: bool,
    pub test_packets_sent: u32,
    pub test_packets_received: u32,
    pub confirm_packets_sent: u32,
    pub confirm_packets_received: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViabilityState {
    Probing,
    Working,
    /// Gave up; the pair stays on the reliable transport
    Exhausted,
}

/// Probes to send this tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Probes {
    pub test: bool,
    pub confirm: bool,
}

impl Viability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_working(&self) -> bool {
        self.working_for_us && self.working_for_peer
    }

    pub fn state(&self, max_attempts: u32) -> ViabilityState {
        if self.is_working() {
            ViabilityState::Working
        } else if !self.working_for_us && self.test_packets_sent >= max_attempts {
            ViabilityState::Exhausted
        } else {
            ViabilityState::Probing
        }
    }

    /// Decide which probes go out this tick and count them as sent
    pub fn tick(&mut self, max_attempts: u32) -> Probes {
        if self.is_working() {
            return Probes::default();
        }

        let test = !self.working_for_us && self.test_packets_sent < max_attempts;
        if test {
            self.test_packets_sent += 1;
        }

        let confirm = self.working_for_peer && self.confirm_packets_sent < max_attempts;
        if confirm {
            self.confirm_packets_sent += 1;
        }

        Probes { test, confirm }
    }

    /// Record a TEST from the peer
    ///
    /// Returns true when an immediate CONFIRM is owed: the pair already
    /// works for us, so `tick` will not send one, but the peer still needs it.
    pub fn on_test(&mut self) -> bool {
        self.test_packets_received += 1;
        self.working_for_peer = true;
        if self.is_working() {
            self.confirm_packets_sent += 1;
            true
        } else {
            false
        }
    }

    pub fn on_confirm(&mut self) {
        self.confirm_packets_received += 1;
        self.working_for_us = true;
    }

    /// Forget everything, e.g. after the peer reconnects
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 10_000;

    /// Run both sides for `ticks` rounds; `a_to_b`/`b_to_a` gate delivery
    fn simulate(ticks: usize, a_to_b: bool, b_to_a: bool) -> (Viability, Viability) {
        let mut a = Viability::new();
        let mut b = Viability::new();

        for _ in 0..ticks {
            let pa = a.tick(MAX);
            let pb = b.tick(MAX);

            if a_to_b {
                if pa.test && b.on_test() && b_to_a {
                    a.on_confirm();
                }
                if pa.confirm {
                    b.on_confirm();
                }
            }
            if b_to_a {
                if pb.test && a.on_test() && a_to_b {
                    b.on_confirm();
                }
                if pb.confirm {
                    a.on_confirm();
                }
            }
        }
        (a, b)
    }

    #[test]
    fn test_converges_on_lossless_path() {
        let (a, b) = simulate(3, true, true);
        assert_eq!(a.state(MAX), ViabilityState::Working);
        assert_eq!(b.state(MAX), ViabilityState::Working);
        assert!(a.test_packets_sent <= 2);
    }

    #[test]
    fn test_one_way_loss_never_converges() {
        let (a, b) = simulate(200, true, false);
        assert!(!a.is_working());
        assert!(!b.is_working());
        assert!(b.working_for_peer);
        assert!(!b.working_for_us);
        assert!(!a.working_for_peer);
    }

    #[test]
    fn test_probing_exhausts() {
        let mut v = Viability::new();
        for _ in 0..5 {
            v.tick(3);
        }
        assert_eq!(v.test_packets_sent, 3);
        assert_eq!(v.state(3), ViabilityState::Exhausted);
        assert_eq!(v.tick(3), Probes::default());
    }

    #[test]
    fn test_working_stops_probing_but_answers_tests() {
        let mut v = Viability::new();
        v.on_confirm();

        // Completing the pair owes the peer a CONFIRM, since ticks stop sending them
        assert!(v.on_test());
        assert!(v.is_working());

        assert_eq!(v.tick(MAX), Probes::default());
        assert!(v.on_test());
        assert_eq!(v.test_packets_received, 2);
        assert_eq!(v.confirm_packets_sent, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut v = Viability::new();
        v.tick(MAX);
        v.on_test();
        v.on_confirm();
        v.reset();
        assert_eq!(v, Viability::default());
    }
}
