//! Scoped suppression of best-effort load warnings.
//!
//! Non-strict state dict overlay routinely reports keys that legacy
//! checkpoints carry but current architectures do not. While a
//! [`SilenceWarnings`] guard is alive on the current thread those notices
//! are demoted from `warn` to `debug`.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Guard that silences load notices on this thread until dropped.
///
/// Guards nest; notices come back once the outermost guard is dropped,
/// including when the guarded code returns early with an error.
pub struct SilenceWarnings {
    // Bound to the creating thread's counter.
    _not_send: PhantomData<*const ()>,
}

impl SilenceWarnings {
    pub fn new() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for SilenceWarnings {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SilenceWarnings {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

pub fn warnings_silenced() -> bool {
    DEPTH.with(|d| d.get() > 0)
}

/// `warn!` unless a [`SilenceWarnings`] guard is active, `debug!` otherwise.
macro_rules! notice {
    ($($arg:tt)*) => {
        if $crate::silence::warnings_silenced() {
            tracing::debug!($($arg)*);
        } else {
            tracing::warn!($($arg)*);
        }
    };
}

pub(crate) use notice;
