//! Sliding-window credit shared by legacy sessions and multiplexed channels.

/// Send credit granted by the peer, in bytes.
///
/// Grants saturate at `u32::MAX` and sends are clamped at zero, so the credit
/// never wraps in either direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowWindow {
    credit: u32,
}

impl FlowWindow {
    pub fn new(credit: u32) -> Self {
        Self { credit }
    }

    pub fn credit(&self) -> u32 {
        self.credit
    }

    pub fn is_exhausted(&self) -> bool {
        self.credit == 0
    }

    /// Replaces the credit, as on open confirmation.
    pub fn reset(&mut self, credit: u32) {
        self.credit = credit;
    }

    pub fn grant(&mut self, bytes: u32) {
        self.credit = self.credit.saturating_add(bytes);
    }

    /// Deducts up to `bytes` and returns how much was actually deducted.
    pub fn consume(&mut self, bytes: u32) -> u32 {
        let taken = bytes.min(self.credit);
        self.credit -= taken;
        taken
    }

    /// Largest chunk that may go out next.
    pub fn next_chunk(&self, remaining: usize, max_frame: usize) -> usize {
        remaining.min(self.credit as usize).min(max_frame)
    }
}

/// Receive-side accounting: bytes taken in since credit was last handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveWindow {
    size: u32,
    consumed: u32,
}

impl ReceiveWindow {
    pub fn new(size: u32) -> Self {
        Self { size, consumed: 0 }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn record(&mut self, len: u32) {
        self.consumed = self.consumed.saturating_add(len);
    }

    /// Credit the peer still holds before it must stop sending.
    pub fn remaining(&self) -> u32 {
        self.size.saturating_sub(self.consumed)
    }

    /// Hands back consumed credit once at least half the window is used.
    pub fn take_credit(&mut self) -> Option<u32> {
        if self.consumed == 0 || self.consumed < self.size / 2 {
            return None;
        }
        Some(std::mem::take(&mut self.consumed))
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Grant(u32),
        Send(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..10_000u32).prop_map(Op::Grant),
            (0..20_000usize).prop_map(Op::Send),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn sent_never_exceeds_granted(initial in 0..10_000u32, ops in prop::collection::vec(op(), 0..64)) {
            let mut window = FlowWindow::new(initial);
            let mut granted = u64::from(initial);
            let mut sent = 0u64;
            for op in ops {
                match op {
                    Op::Grant(n) => {
                        window.grant(n);
                        granted += u64::from(n);
                    }
                    Op::Send(want) => {
                        let chunk = window.next_chunk(want, 4096);
                        let taken = window.consume(chunk as u32);
                        prop_assert_eq!(taken as usize, chunk);
                        sent += taken as u64;
                    }
                }
                prop_assert!(sent <= granted);
                prop_assert_eq!(u64::from(window.credit()), granted - sent);
            }
        }
    }
}
