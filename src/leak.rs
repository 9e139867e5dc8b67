//! The process-wide leak-capture flag described in the entry lifecycle:
//! a reap that finds no captured stack arms this flag; subsequent borrows
//! snapshot their caller's stack until a later reap finds one and
//! disarms it again. The race between an arm and a concurrent capture is
//! benign — at worst one extra stack trace gets captured.

use std::sync::atomic::{AtomicBool, Ordering};

static ARMED: AtomicBool = AtomicBool::new(false);

/// Arms leak-stack capture for subsequent borrows, process-wide.
pub(crate) fn arm() {
    ARMED.store(true, Ordering::Release);
}

/// Returns true iff leak-stack capture is currently armed. Does not
/// consume the flag; a reap that later finds a captured stack is what
/// disarms it, via [`disarm`].
pub(crate) fn is_armed() -> bool {
    ARMED.load(Ordering::Acquire)
}

/// Disarms leak-stack capture, called when a reap consumes a captured
/// stack.
pub(crate) fn disarm() {
    ARMED.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_consume_cycle() {
        arm();
        assert!(is_armed());
        disarm();
        assert!(!is_armed());
    }
}
