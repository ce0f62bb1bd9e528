use crate::core::close_status::CloseStatus;
use crate::core::message::Message;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Lifecycle callbacks fired by the dispatcher on the loop thread
///
/// `on_close` fires at most once per connection, and never after `on_error`
/// reported a failed connection attempt.
pub trait EventHandler: Send {
    fn on_error(&mut self, message: &str);

    fn on_establish(&mut self);

    fn on_receive(&mut self, message: Message);

    fn on_close(&mut self, status: &CloseStatus);
}

/// Run an application callback, containing any panic
///
/// Returns `None` if the callback panicked; the panic is logged and the
/// connection carries on.
pub(crate) fn guarded<R>(what: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(callback = what, "Callback panicked: {}", detail);
            None
        }
    }
}
