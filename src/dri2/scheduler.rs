//! Swap Scheduling State
//!
//! Per-drawable counters for the swap pipeline. `sbc` counts accepted swaps
//! and is handed back as a receipt; `completed_sbc` follows the backend's
//! completions. A drawable with `swap_limit` swaps outstanding accepts new
//! swaps as no-ops that return the current `sbc`.

use std::collections::VecDeque;

use crate::dix::ClientId;

/// A swap handed to the backend and not yet completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSwap {
    pub sbc: u64,
    /// Issuing client; re-resolved on completion since it may have left
    pub client: ClientId,
}

#[derive(Debug)]
pub struct DrawableSwapState {
    pub screen: usize,
    /// Scheduling parameters of the last accepted swap
    pub target_msc: u64,
    pub divisor: u64,
    pub remainder: u64,
    pub outstanding_swaps: u32,
    pub sbc: u64,
    pub completed_sbc: u64,
    pub swap_interval: u32,
    pub last_swap_target: u64,
    pub last_ust: u64,
    pub last_msc: u64,
    pending: VecDeque<PendingSwap>,
}

impl DrawableSwapState {
    pub fn new(screen: usize) -> Self {
        Self {
            screen,
            target_msc: 0,
            divisor: 0,
            remainder: 0,
            outstanding_swaps: 0,
            sbc: 0,
            completed_sbc: 0,
            swap_interval: 1,
            last_swap_target: 0,
            last_ust: 0,
            last_msc: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn throttled(&self, swap_limit: u32) -> bool {
        self.outstanding_swaps >= swap_limit
    }

    /// Target for a swap; all-zero parameters mean "one interval after the last"
    pub fn effective_target(&self, target: u64, divisor: u64, remainder: u64) -> u64 {
        if target == 0 && divisor == 0 && remainder == 0 {
            self.last_swap_target
                .wrapping_add(u64::from(self.swap_interval))
        } else {
            target
        }
    }

    /// Sbc the next accepted swap will receive
    pub fn next_sbc(&self) -> u64 {
        self.sbc.wrapping_add(1)
    }

    /// Record a swap the backend has taken; returns its sbc
    pub fn accept(
        &mut self,
        client: ClientId,
        target: u64,
        divisor: u64,
        remainder: u64,
    ) -> u64 {
        self.outstanding_swaps += 1;
        self.sbc = self.next_sbc();
        self.target_msc = target;
        self.divisor = divisor;
        self.remainder = remainder;
        self.last_swap_target = target;
        self.pending.push_back(PendingSwap {
            sbc: self.sbc,
            client,
        });
        self.sbc
    }

    /// Record a completion; returns the client that issued the swap
    pub fn complete(&mut self, sbc: u64, ust: u64, msc: u64) -> Option<ClientId> {
        self.outstanding_swaps = self.outstanding_swaps.saturating_sub(1);
        self.completed_sbc = self.completed_sbc.max(sbc);
        self.last_ust = ust;
        self.last_msc = msc;
        let index = self.pending.iter().position(|p| p.sbc == sbc)?;
        self.pending.remove(index).map(|p| p.client)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSwap> {
        self.pending.iter()
    }
}

/// First MSC at or after both `current` and `target` with
/// `msc % divisor == remainder % divisor`
///
/// With `divisor == 0` the answer is `target`. Saturates at `u64::MAX`.
pub fn next_msc(current: u64, target: u64, divisor: u64, remainder: u64) -> u64 {
    if divisor == 0 {
        return target;
    }
    let start = target.max(current);
    let wanted = remainder % divisor;
    let have = start % divisor;
    let step = if have <= wanted {
        wanted - have
    } else {
        divisor - have + wanted
    };
    start.checked_add(step).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_is_exact_at_the_limit() {
        let client = ClientId::next();
        let mut state = DrawableSwapState::new(0);
        let limit = 2;
        let mut receipts = Vec::new();
        for _ in 0..limit + 3 {
            if state.throttled(limit) {
                receipts.push(state.sbc);
            } else {
                receipts.push(state.accept(client, 0, 0, 0));
            }
        }
        assert_eq!(state.outstanding_swaps, limit);
        assert_eq!(receipts, vec![1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_completion_matches_by_sbc() {
        let a = ClientId::next();
        let b = ClientId::next();
        let mut state = DrawableSwapState::new(0);
        state.accept(a, 10, 0, 0);
        state.accept(b, 11, 0, 0);

        assert_eq!(state.complete(2, 500, 11), Some(b));
        assert_eq!(state.complete(1, 400, 10), Some(a));
        assert_eq!(state.completed_sbc, 2);
        assert_eq!(state.outstanding_swaps, 0);
        // stray completions never underflow
        assert_eq!(state.complete(9, 0, 0), None);
        assert_eq!(state.outstanding_swaps, 0);
    }

    #[test]
    fn test_interval_target() {
        let mut state = DrawableSwapState::new(0);
        state.swap_interval = 2;
        state.last_swap_target = 100;
        assert_eq!(state.effective_target(0, 0, 0), 102);
        assert_eq!(state.effective_target(0, 4, 1), 0);
        assert_eq!(state.effective_target(50, 0, 0), 50);
    }

    #[test]
    fn test_sbc_wraps_at_u64() {
        let mut state = DrawableSwapState::new(0);
        state.sbc = u64::MAX;
        assert_eq!(state.accept(ClientId::next(), 1, 0, 0), 0);
    }

    #[test]
    fn test_next_msc() {
        assert_eq!(next_msc(5, 10, 0, 0), 10);
        assert_eq!(next_msc(50, 10, 0, 0), 10);
        // at or after target
        assert_eq!(next_msc(0, 10, 4, 1), 13);
        assert_eq!(next_msc(0, 13, 4, 1), 13);
        // past target, next matching after current
        assert_eq!(next_msc(22, 10, 4, 1), 25);
        // remainder is taken modulo divisor
        assert_eq!(next_msc(0, 0, 4, 9), 1);
        assert_eq!(next_msc(u64::MAX - 1, 0, 1000, 999), u64::MAX);
    }
}
