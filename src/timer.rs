//! Per-connection timer table.
//!
//! Six typed slots kept as a small sorted array: at N=6 an insertion-sorted
//! table beats a heap and keeps the earliest deadline at index zero, which is
//! what the external timer wheel is registered with.

use crate::TIMER_INFINITE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerType {
    Pacing,
    AckDelay,
    LossDetection,
    KeepAlive,
    Idle,
    Shutdown,
}

pub const TIMER_COUNT: usize = 6;

#[derive(Debug, Copy, Clone)]
struct Entry {
    ty: TimerType,
    /// Absolute microseconds; `TIMER_INFINITE` when unarmed.
    expiration: u64,
}

/// Invariant: entries with finite expirations form a sorted, non-decreasing
/// prefix; all unarmed entries sit behind them at infinity.
#[derive(Debug)]
pub struct TimerTable {
    entries: [Entry; TIMER_COUNT],
}

impl Default for TimerTable {
    fn default() -> Self {
        use self::TimerType::*;
        let order = [Pacing, AckDelay, LossDetection, KeepAlive, Idle, Shutdown];
        let mut entries = [Entry {
            ty: Pacing,
            expiration: TIMER_INFINITE,
        }; TIMER_COUNT];
        for (entry, &ty) in entries.iter_mut().zip(order.iter()) {
            entry.ty = ty;
        }
        TimerTable { entries }
    }
}

impl TimerTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Arm `ty` to fire `delay_ms` after `now_us`. Returns true when the
    /// earliest deadline changed and the timer wheel must be re-registered.
    pub fn set(&mut self, ty: TimerType, now_us: u64, delay_ms: u64) -> bool {
        let expiration = now_us.saturating_add(delay_ms.saturating_mul(1000));
        self.set_at(ty, expiration)
    }

    pub fn set_at(&mut self, ty: TimerType, expiration: u64) -> bool {
        let old_head = self.entries[0].expiration;
        let cur = self.index_of(ty);
        let entry = Entry { ty, expiration };
        // Shift the gap between the old and new position in one direction.
        let mut i = cur;
        while i > 0 && self.entries[i - 1].expiration > expiration {
            self.entries[i] = self.entries[i - 1];
            i -= 1;
        }
        while i + 1 < TIMER_COUNT && self.entries[i + 1].expiration < expiration {
            self.entries[i] = self.entries[i + 1];
            i += 1;
        }
        self.entries[i] = entry;
        self.entries[0].expiration != old_head
    }

    /// Disarm `ty`; the slot moves behind the finite prefix.
    pub fn cancel(&mut self, ty: TimerType) -> bool {
        self.set_at(ty, TIMER_INFINITE)
    }

    /// Disarm everything except the shutdown timer. Used on close.
    pub fn cancel_all_but_shutdown(&mut self) {
        for ty in [
            TimerType::Pacing,
            TimerType::AckDelay,
            TimerType::LossDetection,
            TimerType::KeepAlive,
            TimerType::Idle,
        ]
        .iter()
        {
            self.cancel(*ty);
        }
    }

    pub fn is_armed(&self, ty: TimerType) -> bool {
        self.entries[self.index_of(ty)].expiration != TIMER_INFINITE
    }

    pub fn expiration(&self, ty: TimerType) -> u64 {
        self.entries[self.index_of(ty)].expiration
    }

    /// Earliest armed deadline, if any.
    pub fn next_expiration(&self) -> Option<u64> {
        match self.entries[0].expiration {
            TIMER_INFINITE => None,
            x => Some(x),
        }
    }

    /// Sweep every leading entry with `expiration <= now`, disarming each and
    /// returning them in deadline order for dispatch.
    pub fn expired(&mut self, now: u64) -> Vec<TimerType> {
        let mut fired = Vec::new();
        while self.entries[0].expiration <= now {
            let ty = self.entries[0].ty;
            fired.push(ty);
            self.cancel(ty);
        }
        fired
    }

    fn index_of(&self, ty: TimerType) -> usize {
        self.entries
            .iter()
            .position(|e| e.ty == ty)
            .expect("timer table entry missing")
    }

    #[cfg(test)]
    fn sorted_prefix_holds(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].expiration <= w[1].expiration)
    }
}
