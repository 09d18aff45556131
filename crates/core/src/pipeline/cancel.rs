use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Poll-able stop flag shared between a run and whoever may want to stop it.
/// Checked between stages and between dispatches; never interrupts an in-flight call.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
