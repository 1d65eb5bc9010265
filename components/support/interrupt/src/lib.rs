/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Helps manage "interruptable" things across our various crates: the
// scheduler's bulk/poll drivers and the executor's per-item loop all need a
// cheap, lock-free way to ask "should I stop now?".

mod scopes;

pub use scopes::InterruptScope;

/// Something that is interruptable. In practice, this will almost certainly
/// be Sync + Send, as it will typically be created on one thread, but
/// `.interrupt()` will be called from a different thread. However,
/// Sync + Send semantics aren't mandated here.
pub trait Interruptable {
    /// Take some action when interrupted.
    fn interrupt(&self);
}

/// Represents the state of something that may be interrupted. Decoupled from
/// Interruptable so that things which want to check if they have been
/// interrupted don't need to know about the interrupt mechanics.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> std::result::Result<(), Interrupted> {
        if self.was_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// A convenience implementation, should only be used in tests.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}

/// The error returned by err_if_interrupted.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("the operation was interrupted")]
pub struct Interrupted;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_interrupts_is_never_interrupted() {
        assert!(!NeverInterrupts.was_interrupted());
        assert!(NeverInterrupts.err_if_interrupted().is_ok());
    }

    #[test]
    fn scope_sees_interruption_only_after_it_was_created() {
        let before = InterruptScope::new();
        InterruptScope::interrupt();
        let after = InterruptScope::new();
        assert!(before.err_if_interrupted().is_err());
        assert!(after.err_if_interrupted().is_ok());
    }
}
