//! Compiler-pass membership flags.
//!
//! Every node carries a [`CompileStateTracker`]: a single atomic word whose
//! bits record which compiler passes have already handled the node. Passes
//! may run on several threads at once, so every mutation except
//! [`CompileStateTracker::set_from`] is a compare-and-swap retry loop.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// A set of compile states, one bit per pass flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CompileStateSet: u32 {
        const PROCESSED = 1 << 0;
        const VALIDATED = 1 << 1;
        /// Extension-specific flags, never persisted.
        const EXTRA_STATE_1 = 1 << 2;
        const EXTRA_STATE_2 = 1 << 3;
        const EXTRA_STATE_3 = 1 << 4;
    }
}

impl CompileStateSet {
    const CORE: CompileStateSet = CompileStateSet::PROCESSED.union(CompileStateSet::VALIDATED);

    /// Drop the extension flags, keeping only the core pass flags.
    pub fn without_extra_states(self) -> Self {
        self & Self::CORE
    }
}

impl fmt::Display for CompileStateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

/// Lock-free compile-state bitset attached to a node.
///
/// Contention is expected to be short-lived (a handful of passes touching
/// the same node), so the CAS loops spin rather than park.
#[derive(Default)]
pub struct CompileStateTracker {
    bits: AtomicU32,
}

impl CompileStateTracker {
    pub fn new(initial: CompileStateSet) -> Self {
        Self { bits: AtomicU32::new(initial.bits()) }
    }

    pub fn get(&self) -> CompileStateSet {
        CompileStateSet::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    pub fn has(&self, states: CompileStateSet) -> bool {
        self.get().contains(states)
    }

    pub fn add(&self, state: CompileStateSet) {
        self.update(|current| current | state);
    }

    pub fn remove(&self, state: CompileStateSet) {
        self.update(|current| current & !state);
    }

    /// Set every flag in `states` in one CAS round.
    pub fn add_states(&self, states: impl IntoIterator<Item = CompileStateSet>) {
        let combined = states.into_iter().fold(CompileStateSet::empty(), |acc, s| acc | s);
        self.add(combined);
    }

    /// Clear every flag in `states` in one CAS round.
    pub fn remove_states(&self, states: impl IntoIterator<Item = CompileStateSet>) {
        let combined = states.into_iter().fold(CompileStateSet::empty(), |acc, s| acc | s);
        self.remove(combined);
    }

    /// Unconditional overwrite.
    ///
    /// Not a CAS: callers must ensure no other thread is updating this
    /// tracker at the same time.
    pub fn set_from(&self, snapshot: CompileStateSet) {
        self.bits.store(snapshot.bits(), Ordering::Release);
    }

    fn update(&self, f: impl Fn(CompileStateSet) -> CompileStateSet) {
        let mut current = self.bits.load(Ordering::Acquire);
        loop {
            let next = f(CompileStateSet::from_bits_retain(current)).bits();
            if next == current {
                return;
            }
            match self
                .bits
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => {
                    current = observed;
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl Clone for CompileStateTracker {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl fmt::Debug for CompileStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompileStateTracker").field(&self.get()).finish()
    }
}
