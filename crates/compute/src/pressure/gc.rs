use std::fmt;
use std::sync::Arc;

/// Manual memory-reclaim hook invoked by `trigger_gc`.
pub trait GcHook: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn collect(&self) -> anyhow::Result<()>;
}

/// Returns free heap pages to the OS with glibc's `malloc_trim(0)`.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocTrim;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
impl GcHook for MallocTrim {
    fn name(&self) -> &str {
        "malloc_trim"
    }

    fn collect(&self) -> anyhow::Result<()> {
        // SAFETY: malloc_trim only walks allocator arenas and takes no pointers.
        unsafe {
            libc::malloc_trim(0);
        }
        Ok(())
    }
}

/// Closure-backed hook, e.g. purging an application cache.
pub struct FnGcHook<F> {
    name: String,
    f: F,
}

impl<F> FnGcHook<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> GcHook for FnGcHook<F>
where
    F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self) -> anyhow::Result<()> {
        (self.f)()
    }
}

impl<F> fmt::Debug for FnGcHook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnGcHook").field("name", &self.name).finish()
    }
}

/// The platform's manual GC hook, if it has one.
pub fn default_gc_hook() -> Option<Arc<dyn GcHook>> {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        Some(Arc::new(MallocTrim))
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fn_hook_runs_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook = FnGcHook::new("purge-cache", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(hook.name(), "purge-cache");
        hook.collect().unwrap();
        hook.collect().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn glibc_has_default_hook() {
        let hook = default_gc_hook().unwrap();
        assert_eq!(hook.name(), "malloc_trim");
        hook.collect().unwrap();
    }
}
