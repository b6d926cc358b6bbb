/*!
The native compute binding.

[`ComputeDriver`] is the boundary to a vendor compute driver. Every call is
fallible and reports failures as a [`DriverError`](error::DriverError)
status rather than unwinding. Enqueue calls may additionally hand back
[`NativeEvent::INVALID`] when the driver ran out of resources, which the
[`EventPool`](crate::event::EventPool) treats as fatal.

[`emulated::EmulatedDriver`] implements the trait in process.
*/

use std::fmt::{self, Debug};

pub mod emulated;

/// Errors.
pub mod error {
    /// A native call failed.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
    #[error("{call} failed with status {status}")]
    pub struct DriverError {
        /// The native entry point.
        pub call: &'static str,
        /// The driver status code.
        pub status: i32,
    }

    impl DriverError {
        pub const fn new(call: &'static str, status: i32) -> Self {
            Self { call, status }
        }
    }
}
use error::DriverError;

macro_rules! native_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
            #[repr(transparent)]
            pub struct $name(pub u64);

            impl $name {
                /// The null handle.
                pub const NULL: Self = Self(0);
                /// Is the null handle.
                pub const fn is_null(&self) -> bool {
                    self.0 == 0
                }
            }

            impl Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}({:#x})", stringify!($name), self.0)
                }
            }
        )*
    };
}

native_handle! {
    /// A device known to the driver.
    NativeDevice,
    /// A command queue.
    NativeQueue,
    /// A device memory object.
    NativeBuffer,
    /// A program built from source, IL or a vendor binary.
    NativeProgram,
    /// A kernel object created from a built program.
    NativeKernel,
    /// An event tracking one enqueued operation.
    NativeEvent,
}

impl NativeEvent {
    /// Returned by the driver when an enqueue ran out of resources.
    pub const INVALID: Self = Self(u64::MAX);
    /// Neither null nor [`INVALID`](Self::INVALID).
    pub const fn is_valid(&self) -> bool {
        self.0 != Self::NULL.0 && self.0 != Self::INVALID.0
    }
}

/// Class reported by the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::IsVariant)]
pub enum DeviceClass {
    Cpu,
    Gpu,
    /// FPGAs and other fixed-function accelerators.
    Accelerator,
    /// Anything else, scheduled like a GPU.
    Other,
}

/// Version of the compute API negotiated for a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const V1_0: Self = Self::new(1, 0);
    pub const V1_1: Self = Self::new(1, 1);
    pub const V1_2: Self = Self::new(1, 2);
    pub const V2_0: Self = Self::new(2, 0);
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
    /// Barriers and markers that take a wait list and produce an event.
    pub fn supports_wait_list_sync(&self) -> bool {
        *self >= Self::V1_2
    }
    /// A global work offset can be passed to kernel launches.
    pub fn supports_work_offset(&self) -> bool {
        *self > Self::V1_0
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/** Command queue properties.

A bitmask, matching the native queue property flags.
```
# use krnl_runtime::driver::QueueProperties;
let properties = QueueProperties::empty().with_out_of_order(true);
assert!(properties.out_of_order());
assert!(!properties.profiling());
```
*/
#[derive(Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct QueueProperties {
    bits: u64,
}

impl QueueProperties {
    const OUT_OF_ORDER: u64 = 1 << 0;
    const PROFILING: u64 = 1 << 1;
    /// No properties, an in-order queue.
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }
    /// Operations may complete out of submission order.
    pub const fn out_of_order(&self) -> bool {
        self.bits & Self::OUT_OF_ORDER != 0
    }
    /// Adds `out_of_order`.
    pub const fn with_out_of_order(self, out_of_order: bool) -> Self {
        self.with(Self::OUT_OF_ORDER, out_of_order)
    }
    /// Events record profiling timestamps.
    pub const fn profiling(&self) -> bool {
        self.bits & Self::PROFILING != 0
    }
    /// Adds `profiling`.
    pub const fn with_profiling(self, profiling: bool) -> Self {
        self.with(Self::PROFILING, profiling)
    }
    const fn with(mut self, bit: u64, value: bool) -> Self {
        if value {
            self.bits |= bit;
        } else {
            self.bits &= !bit;
        }
        self
    }
}

impl Debug for QueueProperties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QueueProperties")
            .field("out_of_order", &self.out_of_order())
            .field("profiling", &self.profiling())
            .finish()
    }
}

/// Result of building a program for a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::IsVariant)]
pub enum BuildStatus {
    None,
    InProgress,
    Success,
    Error,
}

/// Execution status of an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::IsVariant)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// The operation terminated abnormally with this status.
    Error(i32),
}

/// Profiling timestamps of an event in nanoseconds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProfilingInfo {
    pub queued: u64,
    pub submitted: u64,
    pub started: u64,
    pub ended: u64,
}

impl ProfilingInfo {
    /// Time spent executing.
    pub fn elapsed(&self) -> u64 {
        self.ended.saturating_sub(self.started)
    }
    /// Time between the host enqueue and the driver submitting to the device.
    pub fn dispatch(&self) -> u64 {
        self.submitted.saturating_sub(self.queued)
    }
}

/// Device properties used by the runtime.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub device: NativeDevice,
    pub platform_index: usize,
    pub device_index: usize,
    pub name: String,
    pub vendor: String,
    pub class: DeviceClass,
    pub protocol_version: ProtocolVersion,
    pub max_compute_units: u32,
    pub max_work_group_size: u64,
    pub max_work_item_sizes: [u64; 3],
    /// Warp / wavefront width.
    pub preferred_work_group_multiple: u64,
}

impl DeviceInfo {
    /// `device-<platform>-<device>`, used to name per-device directories.
    pub fn dir_name(&self) -> String {
        format!("device-{}-{}", self.platform_index, self.device_index)
    }
}

/// Calls into a vendor compute driver.
///
/// Wait lists are `None` when the operation has no explicit dependencies.
pub trait ComputeDriver: Send + Sync {
    fn create_command_queue(
        &self,
        device: NativeDevice,
        properties: QueueProperties,
    ) -> Result<NativeQueue, DriverError>;
    fn release_command_queue(&self, queue: NativeQueue) -> Result<(), DriverError>;

    fn create_buffer(&self, device: NativeDevice, bytes: usize)
        -> Result<NativeBuffer, DriverError>;
    fn release_buffer(&self, buffer: NativeBuffer) -> Result<(), DriverError>;

    fn create_program_with_source(
        &self,
        device: NativeDevice,
        source: &[u8],
    ) -> Result<NativeProgram, DriverError>;
    fn create_program_with_binary(
        &self,
        device: NativeDevice,
        binary: &[u8],
    ) -> Result<NativeProgram, DriverError>;
    fn create_program_with_il(
        &self,
        device: NativeDevice,
        il: &[u8],
    ) -> Result<NativeProgram, DriverError>;
    fn build_program(
        &self,
        program: NativeProgram,
        device: NativeDevice,
        options: &str,
    ) -> Result<(), DriverError>;
    fn program_build_status(
        &self,
        program: NativeProgram,
        device: NativeDevice,
    ) -> Result<BuildStatus, DriverError>;
    fn program_build_log(
        &self,
        program: NativeProgram,
        device: NativeDevice,
    ) -> Result<String, DriverError>;
    fn program_binary(
        &self,
        program: NativeProgram,
        device: NativeDevice,
    ) -> Result<Vec<u8>, DriverError>;
    fn release_program(&self, program: NativeProgram) -> Result<(), DriverError>;

    fn create_kernel(
        &self,
        program: NativeProgram,
        entry_point: &str,
    ) -> Result<NativeKernel, DriverError>;
    fn release_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError>;

    fn enqueue_nd_range_kernel(
        &self,
        queue: NativeQueue,
        kernel: NativeKernel,
        global_offset: Option<&[u64]>,
        global_work: &[u64],
        local_work: Option<&[u64]>,
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError>;
    fn enqueue_write_buffer(
        &self,
        queue: NativeQueue,
        buffer: NativeBuffer,
        blocking: bool,
        offset: usize,
        data: &[u8],
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError>;
    /// # Safety
    /// If not `blocking`, `data` must remain valid until the event completes.
    unsafe fn enqueue_read_buffer(
        &self,
        queue: NativeQueue,
        buffer: NativeBuffer,
        blocking: bool,
        offset: usize,
        data: &mut [u8],
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError>;
    /// Blocking wait primitive of protocol 1.0 / 1.1.
    fn enqueue_wait_for_events(
        &self,
        queue: NativeQueue,
        events: &[NativeEvent],
    ) -> Result<(), DriverError>;
    fn enqueue_barrier_with_wait_list(
        &self,
        queue: NativeQueue,
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError>;
    fn enqueue_marker_with_wait_list(
        &self,
        queue: NativeQueue,
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError>;
    fn flush(&self, queue: NativeQueue) -> Result<(), DriverError>;
    fn finish(&self, queue: NativeQueue) -> Result<(), DriverError>;

    fn wait_for_events(&self, events: &[NativeEvent]) -> Result<(), DriverError>;
    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError>;
    fn event_profiling_info(&self, event: NativeEvent) -> Result<ProfilingInfo, DriverError>;
    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError>;
}
