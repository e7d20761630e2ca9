//! Housekeeping after each executed job, e.g. releasing connections or flushing spools that a
//! long running process would otherwise accumulate.

#[cfg_attr(test, mockall::automock)]
pub trait Cleaner: Send + Sync {
    fn clean_up(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleaner;

impl Cleaner for NoopCleaner {
    fn clean_up(&self) {}
}
