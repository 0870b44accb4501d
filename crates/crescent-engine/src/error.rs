//! Engine error signaling
//!
//! A raise is a non-local control transfer: the raising frame does not
//! return, the nearest enclosing protected call catches the transfer and
//! turns it into a status. Outside a protected call a raise is a host bug
//! and surfaces as an ordinary panic.

use std::panic::{self, panic_any};
use std::sync::Once;

use thiserror::Error;

use crate::value::Value;

/// Status reported by a failed protected call.
///
/// The error object itself is left on the value stack; this enum only
/// classifies how the raise was produced.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// A runtime error raised by an operation or a metamethod.
    #[error("runtime error raised by the engine")]
    Runtime,
    /// The simulated allocation budget was exhausted.
    #[error("memory allocation failed")]
    Memory,
}

/// Panic payload used for engine raises.
///
/// `pcall` downcasts unwind payloads to this type; anything else is a
/// foreign panic and is resumed untouched.
pub(crate) struct RaiseSignal {
    pub(crate) kind: EngineError,
    pub(crate) error: Value,
}

static HOOK: Once = Once::new();

/// Install a panic hook that stays silent for `RaiseSignal` payloads.
///
/// Raises are ordinary control flow here; printing the default panic
/// report for each one would flood stderr. All other payloads are
/// forwarded to the previously installed hook.
pub(crate) fn install_raise_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<RaiseSignal>().is_none() {
                previous(info);
            }
        }));
    });
}

/// Perform a raise. Never returns; unwinds to the nearest `pcall`.
pub(crate) fn raise(kind: EngineError, error: Value) -> ! {
    install_raise_hook();
    panic_any(RaiseSignal { kind, error });
}
