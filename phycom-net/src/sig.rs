use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag used to abort blocking operations.
///
/// Blocking calls never rely on a signal interrupting the underlying
/// system call. Instead they wait in short slices and check this token in
/// between. A signal handler (e.g. one installed with `ctrlc`) should do
/// nothing else than call [`CancelToken::cancel`].
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
