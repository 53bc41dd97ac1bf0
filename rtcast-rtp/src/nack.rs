//! Receive-side NACK bookkeeping for one track.

use log::debug;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::seq;

/// Tuning for the NACK timer.
#[derive(Debug, Clone)]
pub struct NackOptions {
    /// A gap must be at least this old before the first NACK fires.
    pub nack_interval: Duration,
    /// Gaps older than this stop being requested and count as timed out.
    pub max_wait: Duration,
    /// Upper bound on requests per lost sequence.
    pub max_retries: u16,
    /// Largest tracked gap; wider jumps reset the tracker.
    pub max_gap: u16,
}

impl Default for NackOptions {
    fn default() -> Self {
        Self {
            nack_interval: Duration::from_millis(50),
            max_wait: Duration::from_secs(1),
            max_retries: 5,
            max_gap: 512,
        }
    }
}

struct LostSeq {
    first_seen: Instant,
    last_req: Option<Instant>,
    retries: u16,
}

/// Tracks the highest received sequence and the set of missing ones.
///
/// [NackState::on_rtp] marks a sequence received and records any gap;
/// [NackState::tick] returns the sequences a NACK should request now and
/// expires the hopeless ones.
pub struct NackState {
    opts: NackOptions,
    last_seq: Option<u16>,
    lost: BTreeMap<u16, LostSeq>,
    /// Number of lost sequences dropped after `max_wait` without recovery.
    pub timeout_nacks: u64,
}

impl NackState {
    pub fn new(opts: NackOptions) -> Self {
        Self {
            opts,
            last_seq: None,
            lost: BTreeMap::new(),
            timeout_nacks: 0,
        }
    }

    pub fn lost_count(&self) -> usize {
        self.lost.len()
    }

    pub fn on_rtp(&mut self, sn: u16, now: Instant) {
        let last = match self.last_seq {
            None => {
                self.last_seq = Some(sn);
                return;
            }
            Some(last) => last,
        };

        if sn == last {
            return;
        }

        if seq::is_newer(sn, last) {
            let gap = sn.wrapping_sub(last);
            if gap > self.opts.max_gap {
                // Stream jumped, start over instead of requesting the world.
                self.lost.clear();
                self.last_seq = Some(sn);
                return;
            }
            let mut s = last.wrapping_add(1);
            while s != sn {
                self.lost.insert(
                    s,
                    LostSeq {
                        first_seen: now,
                        last_req: None,
                        retries: 0,
                    },
                );
                s = s.wrapping_add(1);
            }
            self.last_seq = Some(sn);
        } else {
            // A retransmission or late packet fills its gap.
            self.lost.remove(&sn);
        }
    }

    /// Returns the sequences to request now. Entries past `max_wait` or the
    /// retry budget are dropped and counted into `timeout_nacks`.
    pub fn tick(&mut self, now: Instant) -> Vec<u16> {
        let opts = &self.opts;
        let mut timed_out = 0u64;
        let mut due = vec![];

        self.lost.retain(|_, l| {
            if now.duration_since(l.first_seen) >= opts.max_wait || l.retries >= opts.max_retries {
                timed_out += 1;
                return false;
            }
            true
        });

        for (&sn, l) in self.lost.iter_mut() {
            if now.duration_since(l.first_seen) < opts.nack_interval {
                continue;
            }
            // Retry pacing decays with the retry count.
            let pace = opts.nack_interval * (l.retries as u32 + 1);
            let ready = match l.last_req {
                None => true,
                Some(t) => now.duration_since(t) >= pace,
            };
            if ready {
                l.last_req = Some(now);
                l.retries += 1;
                due.push(sn);
            }
        }

        if timed_out > 0 {
            debug!("nack: {timed_out} lost seqs timed out without recovery");
        }
        self.timeout_nacks += timed_out;
        due
    }
}
