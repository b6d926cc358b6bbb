/*!
Command queues.

A [`CommandQueue`] submits operations to one device and tracks their events
in its own [`EventPool`]. Failed driver calls are logged and return
[`LocalEvent::INVALID`], only an [`IntegrityViolation`] is an error.

Barriers and markers depend on the protocol version of the device. Before
1.2 there is only a blocking wait for events, which produces no event.
*/

use crate::{
    config::RuntimeOptions,
    driver::{
        error::DriverError, ComputeDriver, DeviceInfo, NativeBuffer, NativeEvent, NativeKernel,
        NativeQueue, ProtocolVersion, QueueProperties,
    },
    event::{
        error::IntegrityViolation, ElementKind, Event, EventDescriptor, EventPool, LocalEvent,
        WaitList, SYNC_TAG,
    },
    scheduler::WorkGeometry,
};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Element types that can be transferred.
pub trait TransferElem: bytemuck::Pod {
    const KIND: ElementKind;
}

macro_rules! impl_transfer_elem {
    ($($t:ty => $kind:ident),* $(,)?) => {
        $(
            impl TransferElem for $t {
                const KIND: ElementKind = ElementKind::$kind;
            }
        )*
    };
}

impl_transfer_elem! {
    u8 => Byte,
    i8 => Byte,
    u16 => Short,
    i16 => Short,
    u32 => Int,
    i32 => Int,
    u64 => Long,
    i64 => Long,
    f32 => Float,
    f64 => Double,
}

/// A queue on one device, used by one thread.
pub struct CommandQueue {
    driver: Arc<dyn ComputeDriver>,
    native: NativeQueue,
    properties: QueueProperties,
    protocol_version: ProtocolVersion,
    pool: EventPool,
    scratch: WaitList,
    force_blocking: bool,
    marker_use_barrier: bool,
    driver_scheduling: bool,
}

impl CommandQueue {
    /// Creates a queue on `info`'s device.
    ///
    /// The queue is out of order and / or profiling as `options` request.
    pub fn new(
        driver: Arc<dyn ComputeDriver>,
        info: &DeviceInfo,
        options: &RuntimeOptions,
    ) -> Result<Self, DriverError> {
        let properties = QueueProperties::empty()
            .with_out_of_order(options.out_of_order)
            .with_profiling(options.profiling);
        let native = driver.create_command_queue(info.device, properties)?;
        let pool = EventPool::new(driver.clone(), native, options.event_window)
            .circular(options.circular_events)
            .exhaustion_policy(options.exhaustion_policy);
        tracing::debug!(
            queue = ?native,
            device = %info.name,
            ?properties,
            protocol_version = %info.protocol_version,
            "created command queue"
        );
        Ok(Self {
            driver,
            native,
            properties,
            protocol_version: info.protocol_version,
            pool,
            scratch: WaitList::with_capacity(options.max_wait_events),
            force_blocking: options.force_blocking,
            marker_use_barrier: options.marker_use_barrier,
            driver_scheduling: options.driver_scheduling,
        })
    }
    pub fn native(&self) -> NativeQueue {
        self.native
    }
    pub fn properties(&self) -> QueueProperties {
        self.properties
    }
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }
    /// Kernel launches leave the local work to the driver.
    pub fn driver_scheduling(&self) -> bool {
        self.driver_scheduling
    }
    pub fn pool(&self) -> &EventPool {
        &self.pool
    }
    /// Serializes `dependencies`, calls `enqueue` and registers the event.
    fn submit(
        &mut self,
        call: &'static str,
        descriptor: EventDescriptor,
        tag: u64,
        dependencies: &[LocalEvent],
        enqueue: impl FnOnce(
            &dyn ComputeDriver,
            NativeQueue,
            Option<&[NativeEvent]>,
        ) -> Result<NativeEvent, DriverError>,
    ) -> Result<(LocalEvent, NativeEvent), IntegrityViolation> {
        let wait_list =
            self.pool
                .serialize(dependencies, self.properties.out_of_order(), &mut self.scratch)?;
        let native = match enqueue(&*self.driver, self.native, wait_list) {
            Ok(native) => native,
            Err(error) => {
                tracing::error!(call, %descriptor, tag, %error, "enqueue failed");
                return Ok((LocalEvent::INVALID, NativeEvent::INVALID));
            }
        };
        let event = self.pool.register(native, descriptor, tag)?;
        Ok((event, native))
    }
    /// Blocks until `native` completes behind a barrier.
    fn block_on(&self, native: NativeEvent) {
        if self.protocol_version.supports_wait_list_sync() {
            match self.driver.enqueue_barrier_with_wait_list(self.native, None) {
                Ok(barrier) if barrier.is_valid() => {
                    if let Err(error) = self.driver.release_event(barrier) {
                        tracing::error!(%error, "failed to release barrier");
                    }
                }
                Ok(_) => tracing::error!("driver returned an invalid barrier event"),
                Err(error) => tracing::error!(%error, "failed to enqueue barrier"),
            }
        }
        if let Err(error) = self.driver.wait_for_events(&[native]) {
            tracing::error!(?native, %error, "failed to wait for event");
        }
    }
    /// Launches `kernel` over `geometry`.
    ///
    /// The global offset is only passed for protocol versions above 1.0, the
    /// local work only without driver scheduling.
    pub fn enqueue_kernel(
        &mut self,
        kernel: NativeKernel,
        geometry: &WorkGeometry,
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        let offset = if self.protocol_version.supports_work_offset() {
            geometry.offset()
        } else {
            None
        };
        let local = geometry.local().filter(|_| !self.driver_scheduling);
        let (event, native) = self.submit(
            "enqueue_nd_range_kernel",
            EventDescriptor::KernelParallel,
            kernel.0,
            dependencies,
            |driver, queue, wait_list| {
                driver.enqueue_nd_range_kernel(
                    queue,
                    kernel,
                    offset,
                    geometry.global(),
                    local,
                    wait_list,
                )
            },
        )?;
        if self.force_blocking && event.is_valid() {
            self.block_on(native);
        }
        Ok(event)
    }
    /// Launches `kernel` as a single work item.
    pub fn enqueue_task(
        &mut self,
        kernel: NativeKernel,
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        let (event, native) = self.submit(
            "enqueue_task",
            EventDescriptor::KernelSerial,
            kernel.0,
            dependencies,
            |driver, queue, wait_list| {
                driver.enqueue_nd_range_kernel(
                    queue,
                    kernel,
                    None,
                    &[1],
                    Some([1].as_slice()),
                    wait_list,
                )
            },
        )?;
        if self.force_blocking && event.is_valid() {
            self.block_on(native);
        }
        Ok(event)
    }
    /// Writes `data` to `buffer` at byte `offset`.
    ///
    /// # Safety
    /// If not `blocking`, `data` must not be dropped or modified until the
    /// returned event completes.
    pub unsafe fn enqueue_write<T: TransferElem>(
        &mut self,
        buffer: NativeBuffer,
        offset: usize,
        data: &[T],
        blocking: bool,
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.submit(
            "enqueue_write_buffer",
            EventDescriptor::Write(T::KIND),
            buffer.0,
            dependencies,
            |driver, queue, wait_list| {
                driver.enqueue_write_buffer(queue, buffer, blocking, offset, bytes, wait_list)
            },
        )
        .map(|(event, _)| event)
    }
    /// Reads `buffer` at byte `offset` into `data`.
    ///
    /// # Safety
    /// If not `blocking`, `data` must not be accessed or dropped until the
    /// returned event completes.
    pub unsafe fn enqueue_read<T: TransferElem>(
        &mut self,
        buffer: NativeBuffer,
        offset: usize,
        data: &mut [T],
        blocking: bool,
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(data);
        self.submit(
            "enqueue_read_buffer",
            EventDescriptor::Read(T::KIND),
            buffer.0,
            dependencies,
            |driver, queue, wait_list| unsafe {
                driver.enqueue_read_buffer(queue, buffer, blocking, offset, bytes, wait_list)
            },
        )
        .map(|(event, _)| event)
    }
    /// Blocking [`enqueue_write`](Self::enqueue_write).
    pub fn write<T: TransferElem>(
        &mut self,
        buffer: NativeBuffer,
        offset: usize,
        data: &[T],
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        unsafe { self.enqueue_write(buffer, offset, data, true, dependencies) }
    }
    /// Blocking [`enqueue_read`](Self::enqueue_read).
    pub fn read<T: TransferElem>(
        &mut self,
        buffer: NativeBuffer,
        offset: usize,
        data: &mut [T],
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        unsafe { self.enqueue_read(buffer, offset, data, true, dependencies) }
    }
    /// Blocking wait used before protocol 1.2.
    fn wait_for_dependencies(
        &mut self,
        descriptor: EventDescriptor,
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        let wait_list =
            self.pool
                .serialize(dependencies, self.properties.out_of_order(), &mut self.scratch)?;
        if let Some(wait_list) = wait_list {
            if let Err(error) = self.driver.enqueue_wait_for_events(self.native, wait_list) {
                tracing::error!(%descriptor, %error, "failed to wait for events");
            }
        }
        Ok(LocalEvent::INVALID)
    }
    /// Orders later operations after `dependencies`, or after everything if empty.
    ///
    /// Returns [`LocalEvent::INVALID`] before protocol 1.2.
    pub fn enqueue_barrier(
        &mut self,
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        if !self.protocol_version.supports_wait_list_sync() {
            return self.wait_for_dependencies(EventDescriptor::Barrier, dependencies);
        }
        self.submit(
            "enqueue_barrier_with_wait_list",
            EventDescriptor::Barrier,
            SYNC_TAG,
            dependencies,
            |driver, queue, wait_list| driver.enqueue_barrier_with_wait_list(queue, wait_list),
        )
        .map(|(event, _)| event)
    }
    /// An event that completes after `dependencies`.
    ///
    /// Returns [`LocalEvent::INVALID`] before protocol 1.2.
    pub fn enqueue_marker(
        &mut self,
        dependencies: &[LocalEvent],
    ) -> Result<LocalEvent, IntegrityViolation> {
        if self.marker_use_barrier {
            return self.enqueue_barrier(dependencies);
        }
        if !self.protocol_version.supports_wait_list_sync() {
            return self.wait_for_dependencies(EventDescriptor::Marker, dependencies);
        }
        self.submit(
            "enqueue_marker_with_wait_list",
            EventDescriptor::Marker,
            SYNC_TAG,
            dependencies,
            |driver, queue, wait_list| driver.enqueue_marker_with_wait_list(queue, wait_list),
        )
        .map(|(event, _)| event)
    }
    /// Submits all enqueued operations.
    pub fn flush(&self) -> Result<(), DriverError> {
        self.driver.flush(self.native).map_err(|error| {
            tracing::error!(queue = ?self.native, %error, "flush failed");
            error
        })
    }
    /// Blocks until all enqueued operations have completed.
    pub fn finish(&self) -> Result<(), DriverError> {
        self.driver.finish(self.native).map_err(|error| {
            tracing::error!(queue = ?self.native, %error, "finish failed");
            error
        })
    }
    /// Blocks until `events` have completed, invalid and reclaimed events are skipped.
    pub fn wait(&self, events: &[LocalEvent]) -> Result<(), DriverError> {
        let natives: Vec<_> = events.iter().filter_map(|x| self.pool.native(*x)).collect();
        if natives.is_empty() {
            return Ok(());
        }
        self.driver.wait_for_events(&natives)
    }
    /// Releases every event, the native queue is kept.
    pub fn reset(&mut self) {
        self.pool.reset();
    }
    pub fn retain_event(&mut self, event: LocalEvent) -> bool {
        self.pool.retain(event)
    }
    pub fn release_event(&mut self, event: LocalEvent) -> bool {
        self.pool.release(event)
    }
    pub fn resolve_event(&self, event: LocalEvent) -> Option<Event> {
        self.pool.resolve(event)
    }
    pub fn events(&self) -> Vec<Event> {
        self.pool.events()
    }
    pub fn dump_events(&self) {
        self.pool.dump();
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.pool.reset();
        if let Err(error) = self.driver.release_command_queue(self.native) {
            tracing::error!(queue = ?self.native, %error, "failed to release command queue");
        }
    }
}

impl Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("native", &self.native)
            .field("properties", &self.properties)
            .field("protocol_version", &self.protocol_version)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{emulated::EmulatedDriver, DeviceClass};

    fn kernel(driver: &EmulatedDriver, info: &DeviceInfo) -> NativeKernel {
        let program = driver
            .create_program_with_source(info.device, b"__kernel void fill() {}")
            .unwrap();
        driver.build_program(program, info.device, "").unwrap();
        driver.create_kernel(program, "fill").unwrap()
    }

    fn queue(
        options: RuntimeOptions,
        protocol_version: ProtocolVersion,
    ) -> (Arc<EmulatedDriver>, NativeKernel, CommandQueue) {
        let driver = Arc::new(EmulatedDriver::new());
        let mut info = driver.device_info(DeviceClass::Gpu);
        info.protocol_version = protocol_version;
        let kernel = kernel(&driver, &info);
        let queue = CommandQueue::new(driver.clone(), &info, &options).unwrap();
        (driver, kernel, queue)
    }

    fn out_of_order() -> RuntimeOptions {
        RuntimeOptions {
            out_of_order: true,
            ..RuntimeOptions::default()
        }
    }

    #[test]
    fn kernel_event_is_tagged() {
        let (_, kernel, mut queue) = queue(RuntimeOptions::default(), ProtocolVersion::V2_0);
        let geometry = WorkGeometry::new(&[64]).with_local(&[16]);
        let event = queue.enqueue_kernel(kernel, &geometry, &[]).unwrap();
        let event = queue.resolve_event(event).unwrap();
        assert_eq!(event.descriptor(), EventDescriptor::KernelParallel);
        assert_eq!(event.tag(), kernel.0);
        event.wait().unwrap();
    }

    #[test]
    fn out_of_order_dependencies() {
        let (_, kernel, mut queue) = queue(out_of_order(), ProtocolVersion::V2_0);
        let geometry = WorkGeometry::new(&[32, 32]);
        let a = queue.enqueue_kernel(kernel, &geometry, &[]).unwrap();
        let b = queue
            .enqueue_kernel(kernel, &geometry, &[a, LocalEvent::INVALID])
            .unwrap();
        assert!(b.is_valid());
        queue.finish().unwrap();
    }

    #[test]
    fn failed_enqueue_returns_invalid() {
        let (driver, kernel, mut queue) = queue(RuntimeOptions::default(), ProtocolVersion::V2_0);
        driver.fail_next("clEnqueueNDRangeKernel", -5);
        let event = queue
            .enqueue_kernel(kernel, &WorkGeometry::new(&[8]), &[])
            .unwrap();
        assert_eq!(event, LocalEvent::INVALID);
        assert!(queue.events().is_empty());
        let bad_local = WorkGeometry::new(&[10]).with_local(&[4]);
        assert_eq!(
            queue.enqueue_kernel(kernel, &bad_local, &[]).unwrap(),
            LocalEvent::INVALID
        );
    }

    #[test]
    fn invalid_native_event_is_fatal() {
        let driver = Arc::new(EmulatedDriver::new().with_event_limit(1));
        let info = driver.device_info(DeviceClass::Gpu);
        let kernel = kernel(&driver, &info);
        let mut queue = CommandQueue::new(driver.clone(), &info, &RuntimeOptions::default()).unwrap();
        queue.enqueue_task(kernel, &[]).unwrap();
        let error = queue.enqueue_task(kernel, &[]).unwrap_err();
        assert_eq!(
            error,
            IntegrityViolation::InvalidEvent {
                descriptor: EventDescriptor::KernelSerial,
                tag: kernel.0,
            }
        );
    }

    #[test]
    fn legacy_barrier_blocks() {
        let (driver, kernel, mut queue) = queue(out_of_order(), ProtocolVersion::V1_1);
        let a = queue.enqueue_task(kernel, &[]).unwrap();
        let waits = driver.stats().blocking_waits;
        assert_eq!(queue.enqueue_barrier(&[a]).unwrap(), LocalEvent::INVALID);
        assert_eq!(queue.enqueue_marker(&[a]).unwrap(), LocalEvent::INVALID);
        assert_eq!(driver.stats().blocking_waits, waits + 2);
        assert_eq!(driver.stats().barriers, 0);
    }

    #[test]
    fn barrier_and_marker_events() {
        let (driver, kernel, mut queue) = queue(out_of_order(), ProtocolVersion::V1_2);
        let a = queue.enqueue_task(kernel, &[]).unwrap();
        let barrier = queue.enqueue_barrier(&[a]).unwrap();
        let marker = queue.enqueue_marker(&[a, barrier]).unwrap();
        let barrier = queue.resolve_event(barrier).unwrap();
        let marker = queue.resolve_event(marker).unwrap();
        assert_eq!(barrier.descriptor(), EventDescriptor::Barrier);
        assert_eq!(marker.descriptor(), EventDescriptor::Marker);
        assert_eq!(marker.tag(), SYNC_TAG);
        assert_eq!(driver.stats().barriers, 1);
    }

    #[test]
    fn marker_as_barrier() {
        let options = RuntimeOptions {
            marker_use_barrier: true,
            ..RuntimeOptions::default()
        };
        let (_, _, mut queue) = queue(options, ProtocolVersion::V2_0);
        let marker = queue.enqueue_marker(&[]).unwrap();
        assert_eq!(
            queue.resolve_event(marker).unwrap().descriptor(),
            EventDescriptor::Barrier
        );
    }

    #[test]
    fn force_blocking_waits() {
        let options = RuntimeOptions {
            force_blocking: true,
            ..RuntimeOptions::default()
        };
        let (driver, kernel, mut queue) = queue(options, ProtocolVersion::V2_0);
        queue
            .enqueue_kernel(kernel, &WorkGeometry::new(&[4]), &[])
            .unwrap();
        let stats = driver.stats();
        assert_eq!(stats.barriers, 1);
        assert_eq!(stats.blocking_waits, 1);
        // the barrier event is not tracked
        assert_eq!(queue.events().len(), 1);
    }

    #[test]
    fn transfers() {
        let (driver, _, mut queue) = queue(RuntimeOptions::default(), ProtocolVersion::V2_0);
        let info = driver.device_info(DeviceClass::Gpu);
        let buffer = driver.create_buffer(info.device, 16).unwrap();
        let input = [1f32, 2., 3., 4.];
        let write = queue.write(buffer, 0, &input, &[]).unwrap();
        assert_eq!(
            queue.resolve_event(write).unwrap().descriptor(),
            EventDescriptor::Write(ElementKind::Float)
        );
        let mut output = [0u32; 2];
        let read = queue.read(buffer, 8, &mut output, &[write]).unwrap();
        assert_eq!(output, [3f32.to_bits(), 4f32.to_bits()]);
        let read = queue.resolve_event(read).unwrap();
        assert_eq!(read.descriptor(), EventDescriptor::Read(ElementKind::Int));
        assert_eq!(read.tag(), buffer.0);
        let mut overflow = [0u8; 4];
        assert_eq!(
            queue.read(buffer, 14, &mut overflow, &[]).unwrap(),
            LocalEvent::INVALID
        );
    }

    #[test]
    fn reset_and_drop_release_everything() {
        let (driver, kernel, mut queue) = queue(RuntimeOptions::default(), ProtocolVersion::V2_0);
        for _ in 0..3 {
            queue.enqueue_task(kernel, &[]).unwrap();
        }
        queue.reset();
        assert_eq!(driver.stats().live_events, 0);
        assert_eq!(queue.enqueue_task(kernel, &[]).unwrap(), LocalEvent::new(0));
        drop(queue);
        assert_eq!(driver.stats().live_events, 0);
        assert_eq!(driver.queue_count(), 0);
    }
}
