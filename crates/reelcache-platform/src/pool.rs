//! Background disk work for cache files.
//!
//! Cache files push index writes off the download and playback threads, and
//! the cache directory scans itself here. Work is fallible and nobody waits
//! for a fire-and-forget task, so failures are logged with the path they
//! concern.

use std::{fmt, io, path::PathBuf, sync::Arc};

use futures::channel::oneshot;

/// Handle onto the threads that run blocking disk work.
///
/// Clones share one pool, so every cache file opened from the same
/// configuration funnels its background writes through the same threads.
///
/// ```
/// use reelcache_platform::ThreadPool;
///
/// let pool = ThreadPool::dedicated(1).unwrap();
/// pool.spawn_io("index flush", "/tmp/clip.idx".into(), || Ok::<_, std::io::Error>(()));
/// ```
#[derive(Clone)]
pub struct ThreadPool {
    /// `None` runs on the global rayon pool.
    inner: Option<Arc<rayon::ThreadPool>>,
}

impl ThreadPool {
    /// Share the global rayon pool with the rest of the process.
    #[must_use]
    pub fn global() -> Self {
        Self { inner: None }
    }

    /// A pool of `num_threads` threads reserved for cache I/O.
    ///
    /// A task that panics is logged and the pool keeps running.
    ///
    /// # Errors
    ///
    /// Returns an error if rayon cannot spawn the threads.
    pub fn dedicated(num_threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("reelcache-io-{i}"))
            .panic_handler(|_| tracing::error!("cache I/O task panicked"))
            .build()?;
        Ok(Self {
            inner: Some(Arc::new(pool)),
        })
    }

    fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.inner {
            Some(ref pool) => pool.spawn(f),
            None => rayon::spawn(f),
        }
    }

    /// Run `f` in the background. An error is logged as a warning naming
    /// `what` and `path`.
    pub fn spawn_io<F, E>(&self, what: &'static str, path: PathBuf, f: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Debug,
    {
        self.spawn(move || {
            if let Err(e) = f() {
                tracing::warn!(?e, path = %path.display(), "{what} failed");
            }
        });
    }

    /// Run `f` on the pool and resolve with its result.
    ///
    /// # Errors
    ///
    /// Returns an error if `f` panics on a [`dedicated`](Self::dedicated)
    /// pool. On the global pool a panic goes to rayon's global handler,
    /// which aborts the process unless the application installed its own.
    pub async fn spawn_async<F, R>(&self, f: F) -> io::Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(move || {
            let _ = tx.send(f());
        });
        rx.await
            .map_err(|_| io::Error::other("cache I/O task panicked"))
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some(ref pool) => f
                .debug_struct("ThreadPool")
                .field("num_threads", &pool.current_num_threads())
                .finish(),
            None => f.write_str("ThreadPool(global)"),
        }
    }
}
