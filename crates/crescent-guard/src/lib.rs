//! Crescent guard - the embedding safety boundary
//!
//! The engine reports errors by raising: a non-local transfer that unwinds
//! to the nearest protected call. Host code that invokes a risky primitive
//! directly from its own frame hands that unwind a stack it has no
//! business traversing. This crate is the boundary that prevents it, in
//! both directions:
//! - [`protected`]: one wrapper per risky primitive, each confining the
//!   possible raise to a dedicated protected call and relaying its status.
//! - [`trampoline`]: the reverse direction, where host functions become
//!   engine callables that signal results and errors through sentinel
//!   codes instead of raising from a host frame.
//!
//! Neither side interprets error objects; a failure always leaves exactly
//! one inspectable error value on the stack and a non-success status in
//! the return value.

/// Guard library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod protected;
pub mod trampoline;

pub use protected::Protected;
pub use trampoline::{push_callback, Callback, CALLBACK_ERR, CALLBACK_STACK_ERR};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }
}
