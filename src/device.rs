/*!
Device contexts.

A [`DeviceContext`] owns the [`CodeCache`] and the [`KernelScheduler`] of a
device, and one [`CommandQueue`] per thread. Queues are created on first use
by a thread and released with [`release_thread_queue`](DeviceContext::release_thread_queue),
or when the context is dropped.

Local events returned by a context belong to the queue of the calling thread.
*/

use crate::{
    code_cache::{CodeCache, InstalledCode},
    config::RuntimeOptions,
    driver::{ComputeDriver, DeviceInfo, NativeBuffer},
    event::{Event, LocalEvent},
    future::EventFuture,
    queue::{CommandQueue, TransferElem},
    result::Result,
    scheduler::{KernelScheduler, TaskMeta},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::ThreadId,
};

/// Errors.
pub mod error {
    /// The code has no kernel, because its build failed or it was invalidated.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("kernel {entry_point:?} of task {task_id:?} is unavailable")]
    pub struct KernelUnavailable {
        pub task_id: String,
        pub entry_point: String,
    }

    /// The context was closed.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("DeviceContextClosed")]
    pub struct DeviceContextClosed;
}
use error::*;

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`DeviceContext`].
    pub struct DeviceContextBuilder {
        pub(super) driver: Arc<dyn ComputeDriver>,
        pub(super) info: DeviceInfo,
        pub(super) options: RuntimeOptions,
    }

    impl DeviceContextBuilder {
        /// Defaults to [`RuntimeOptions::default()`].
        pub fn options(self, options: RuntimeOptions) -> Self {
            Self { options, ..self }
        }
        /// Creates a device context.
        ///
        /// With caching enabled, installs all cached binaries.
        ///
        /// **errors**
        /// - The cache directories could not be resolved.
        pub fn build(self) -> Result<DeviceContext> {
            let Self {
                driver,
                info,
                options,
            } = self;
            let info = Arc::new(info);
            let options = Arc::new(options);
            let scheduler = KernelScheduler::for_device(&info, &options);
            let code_cache = CodeCache::new(driver.clone(), info.clone(), options.clone());
            if options.cache_enable {
                let installed = code_cache.load_all_cached()?;
                tracing::info!(device = %info.name, installed, "loaded code cache");
            }
            tracing::info!(
                device = %info.name,
                vendor = %info.vendor,
                class = ?info.class,
                ?scheduler,
                "created device context"
            );
            Ok(DeviceContext {
                driver,
                info,
                options,
                code_cache,
                scheduler,
                queues: Mutex::default(),
                closed: AtomicBool::new(false),
            })
        }
    }
}
use builder::DeviceContextBuilder;

/// Kind of code passed to [`DeviceContext::install_code`].
#[derive(Clone, Copy, Debug)]
pub enum CodeKind<'a> {
    /// Source built with `options`.
    Source { options: &'a str },
    /// SPIR-V or a vendor binary.
    Binary,
}

/// A buffer in device memory, released on drop.
pub struct DeviceBuffer {
    driver: Arc<dyn ComputeDriver>,
    native: NativeBuffer,
    len: usize,
}

impl DeviceBuffer {
    pub fn native(&self) -> NativeBuffer {
        self.native
    }
    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(error) = self.driver.release_buffer(self.native) {
            tracing::error!(buffer = ?self.native, %error, "failed to release buffer");
        }
    }
}

impl Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("native", &self.native)
            .field("len", &self.len)
            .finish()
    }
}

/// Runtime state of one device.
pub struct DeviceContext {
    driver: Arc<dyn ComputeDriver>,
    info: Arc<DeviceInfo>,
    options: Arc<RuntimeOptions>,
    code_cache: CodeCache,
    scheduler: KernelScheduler,
    queues: Mutex<HashMap<ThreadId, Arc<Mutex<CommandQueue>>>>,
    closed: AtomicBool,
}

impl DeviceContext {
    pub fn builder(driver: Arc<dyn ComputeDriver>, info: DeviceInfo) -> DeviceContextBuilder {
        DeviceContextBuilder {
            driver,
            info,
            options: RuntimeOptions::default(),
        }
    }
    pub fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    pub fn options(&self) -> &Arc<RuntimeOptions> {
        &self.options
    }
    pub fn scheduler(&self) -> &KernelScheduler {
        &self.scheduler
    }
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }
    /// Installs `entry_point` for `task_id`.
    ///
    /// Source is replaced by the precompiled binary of the task, when
    /// configured. A failed build is not an error, check
    /// [`InstalledCode::is_valid`].
    ///
    /// **errors**
    /// - [`DeviceContextClosed`]
    /// - The precompiled binary could not be read.
    /// - The cache directories could not be resolved.
    pub fn install_code(
        &self,
        task_id: &str,
        entry_point: &str,
        code: &[u8],
        kind: CodeKind,
    ) -> Result<Arc<InstalledCode>> {
        self.check_open()?;
        let code = match kind {
            CodeKind::Source { options } => {
                match self.code_cache.install_precompiled(task_id, entry_point)? {
                    Some(code) if code.is_valid() => code,
                    _ => self
                        .code_cache
                        .install_from_source(task_id, entry_point, code, options)?,
                }
            }
            CodeKind::Binary => self
                .code_cache
                .install_from_binary(task_id, entry_point, code, false)?,
        };
        Ok(code)
    }
    pub fn is_cached(&self, task_id: &str, entry_point: &str) -> bool {
        self.code_cache.is_cached(task_id, entry_point)
    }
    fn check_open(&self) -> Result<(), DeviceContextClosed> {
        if self.closed.load(Ordering::Acquire) {
            Err(DeviceContextClosed)
        } else {
            Ok(())
        }
    }
    /// The queue of the calling thread, created on first use.
    ///
    /// **errors**
    /// - [`DeviceContextClosed`]
    /// - The queue could not be created.
    pub fn thread_queue(&self) -> Result<Arc<Mutex<CommandQueue>>> {
        self.check_open()?;
        let id = std::thread::current().id();
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&id) {
            return Ok(queue.clone());
        }
        let queue = CommandQueue::new(self.driver.clone(), &self.info, &self.options)?;
        let queue = Arc::new(Mutex::new(queue));
        queues.insert(id, queue.clone());
        Ok(queue)
    }
    fn with_queue<R>(&self, f: impl FnOnce(&mut CommandQueue) -> R) -> Result<R> {
        let queue = self.thread_queue()?;
        let mut queue = queue.lock();
        Ok(f(&mut queue))
    }
    /// Releases the queue of the calling thread and its events.
    ///
    /// Returns false if the thread had no queue.
    pub fn release_thread_queue(&self) -> bool {
        let id = std::thread::current().id();
        self.queues.lock().remove(&id).is_some()
    }
    /// Number of thread queues.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
    /// Launches `code` for `task`.
    ///
    /// **errors**
    /// - [`KernelUnavailable`]
    /// - [`DeviceContextClosed`]
    /// - [`IntegrityViolation`](crate::event::error::IntegrityViolation)
    pub fn execute(
        &self,
        code: &InstalledCode,
        task: &mut TaskMeta,
        dependencies: &[LocalEvent],
        batch: Option<u64>,
    ) -> Result<LocalEvent> {
        let kernel = code.kernel().ok_or_else(|| KernelUnavailable {
            task_id: code.task_id().to_string(),
            entry_point: code.entry_point().to_string(),
        })?;
        let event = self.with_queue(|queue| {
            self.scheduler
                .submit(queue, kernel, task, dependencies, batch)
        })??;
        Ok(event)
    }
    /// Allocates `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<DeviceBuffer> {
        self.check_open()?;
        let native = self.driver.create_buffer(self.info.device, len)?;
        Ok(DeviceBuffer {
            driver: self.driver.clone(),
            native,
            len,
        })
    }
    /// Blocking write of `data` to `buffer` at byte `offset`.
    pub fn write<T: TransferElem>(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        data: &[T],
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent> {
        let event =
            self.with_queue(|queue| queue.write(buffer.native, offset, data, dependencies))??;
        Ok(event)
    }
    /// Blocking read of `buffer` at byte `offset` into `data`.
    pub fn read<T: TransferElem>(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        data: &mut [T],
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent> {
        let event =
            self.with_queue(|queue| queue.read(buffer.native, offset, data, dependencies))??;
        Ok(event)
    }
    pub fn barrier(&self, dependencies: &[LocalEvent]) -> Result<LocalEvent> {
        let event = self.with_queue(|queue| queue.enqueue_barrier(dependencies))??;
        Ok(event)
    }
    pub fn marker(&self, dependencies: &[LocalEvent]) -> Result<LocalEvent> {
        let event = self.with_queue(|queue| queue.enqueue_marker(dependencies))??;
        Ok(event)
    }
    pub fn flush(&self) -> Result<()> {
        self.with_queue(|queue| queue.flush())??;
        Ok(())
    }
    pub fn finish(&self) -> Result<()> {
        self.with_queue(|queue| queue.finish())??;
        Ok(())
    }
    /// Blocks until `events` have completed.
    pub fn wait(&self, events: &[LocalEvent]) -> Result<()> {
        self.with_queue(|queue| queue.wait(events))??;
        Ok(())
    }
    /// Resolves `event` on the queue of the calling thread.
    pub fn resolve_event(&self, event: LocalEvent) -> Option<Event> {
        let id = std::thread::current().id();
        let queue = self.queues.lock().get(&id)?.clone();
        let queue = queue.lock();
        queue.resolve_event(event)
    }
    /// A future completing with `event`, see [`resolve_event`](Self::resolve_event).
    pub fn event_future(&self, event: LocalEvent) -> Option<EventFuture> {
        self.resolve_event(event).map(EventFuture::new)
    }
    pub fn retain_event(&self, event: LocalEvent) -> Result<bool> {
        self.with_queue(|queue| queue.retain_event(event))
    }
    pub fn release_event(&self, event: LocalEvent) -> Result<bool> {
        self.with_queue(|queue| queue.release_event(event))
    }
    /// Resets the events of every queue and the code cache.
    pub fn reset(&self) {
        for queue in self.queues.lock().values() {
            queue.lock().reset();
        }
        self.code_cache.reset();
    }
    /// Releases all queues and code, further use errors with [`DeviceContextClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queues.lock().clear();
        self.code_cache.reset();
        tracing::debug!(device = %self.info.name, "closed device context");
    }
}

impl Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.info.name)
            .field("scheduler", &self.scheduler)
            .field("code_cache", &self.code_cache)
            .field("queues", &self.queue_count())
            .finish()
    }
}
