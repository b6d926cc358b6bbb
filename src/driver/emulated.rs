/*!
An in-process [`ComputeDriver`].

Buffers live in host memory, every enqueue completes immediately and builds
are simulated:
- a source build fails when the source contains `#error`, with that line as
the build log,
- the program binary of a source program is `EMUBIN` followed by the source,
- a kernel can only be created for an entry point named in the source,
- SPIR-V programs accept any entry point.

Failures can be injected per call with [`EmulatedDriver::fail_next`] and
event exhaustion with [`EmulatedDriver::with_event_limit`].
*/

use super::{
    error::DriverError, BuildStatus, ComputeDriver, DeviceClass, DeviceInfo, EventStatus,
    NativeBuffer, NativeDevice, NativeEvent, NativeKernel, NativeProgram, NativeQueue,
    ProfilingInfo, ProtocolVersion, QueueProperties,
};
use parking_lot::Mutex;
use std::collections::HashMap;

const BINARY_MAGIC: &[u8] = b"EMUBIN";

// status codes
const INVALID_VALUE: i32 = -30;
const INVALID_DEVICE: i32 = -33;
const INVALID_QUEUE: i32 = -36;
const INVALID_MEM_OBJECT: i32 = -38;
const INVALID_BINARY: i32 = -42;
const INVALID_PROGRAM: i32 = -44;
const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
const INVALID_KERNEL_NAME: i32 = -46;
const INVALID_KERNEL: i32 = -48;
const INVALID_WORK_DIMENSION: i32 = -53;
const INVALID_WORK_GROUP_SIZE: i32 = -54;
const INVALID_EVENT: i32 = -58;
const BUILD_PROGRAM_FAILURE: i32 = -11;

/// Counters of what the driver was asked to do.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EmulatedStats {
    /// Builds of any program.
    pub programs_built: usize,
    /// Builds of programs created from source.
    pub compilations: usize,
    pub kernels_created: usize,
    pub kernels_launched: usize,
    pub events_created: usize,
    pub events_released: usize,
    pub live_events: usize,
    pub barriers: usize,
    pub blocking_waits: usize,
}

#[derive(Debug)]
enum ProgramSource {
    Source(Vec<u8>),
    Binary(Vec<u8>),
    Il,
}

impl ProgramSource {
    fn text(&self) -> Option<&[u8]> {
        match self {
            Self::Source(text) | Self::Binary(text) => Some(text),
            Self::Il => None,
        }
    }
}

#[derive(Debug)]
struct Program {
    device: NativeDevice,
    source: ProgramSource,
    status: BuildStatus,
    log: String,
}

#[derive(Debug)]
struct Event {
    queue: NativeQueue,
    profiling: ProfilingInfo,
}

#[derive(Default, Debug)]
struct State {
    next_handle: u64,
    clock: u64,
    queues: HashMap<u64, (NativeDevice, QueueProperties)>,
    buffers: HashMap<u64, Vec<u8>>,
    programs: HashMap<u64, Program>,
    kernels: HashMap<u64, NativeProgram>,
    events: HashMap<u64, Event>,
    event_releases: HashMap<u64, usize>,
    failures: HashMap<&'static str, i32>,
    event_limit: Option<usize>,
    stats: EmulatedStats,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
    fn check(&mut self, call: &'static str) -> Result<(), DriverError> {
        if let Some(status) = self.failures.remove(call) {
            Err(DriverError::new(call, status))
        } else {
            Ok(())
        }
    }
    fn queue(&self, call: &'static str, queue: NativeQueue) -> Result<NativeDevice, DriverError> {
        self.queues
            .get(&queue.0)
            .map(|(device, _)| *device)
            .ok_or(DriverError::new(call, INVALID_QUEUE))
    }
    fn check_events(&self, call: &'static str, events: &[NativeEvent]) -> Result<(), DriverError> {
        if events.iter().all(|x| self.events.contains_key(&x.0)) {
            Ok(())
        } else {
            Err(DriverError::new(call, INVALID_EVENT))
        }
    }
    fn event(&mut self, queue: NativeQueue, duration: u64) -> NativeEvent {
        if let Some(limit) = self.event_limit {
            if self.events.len() >= limit {
                return NativeEvent::INVALID;
            }
        }
        let queued = self.clock;
        self.clock += 3 + duration;
        let profiling = ProfilingInfo {
            queued,
            submitted: queued + 1,
            started: queued + 2,
            ended: queued + 2 + duration,
        };
        let handle = self.handle();
        self.events.insert(handle, Event { queue, profiling });
        self.stats.events_created += 1;
        NativeEvent(handle)
    }
}

/// The emulated driver.
///
/// Devices are fixed: [`device_info`](EmulatedDriver::device_info) describes
/// one device per [`DeviceClass`].
#[derive(Default, Debug)]
pub struct EmulatedDriver {
    state: Mutex<State>,
}

impl EmulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }
    /// Enqueues return [`NativeEvent::INVALID`] once `limit` events are live.
    pub fn with_event_limit(self, limit: usize) -> Self {
        self.state.lock().event_limit = Some(limit);
        self
    }
    /// The next call to `call` fails with `status`.
    ///
    /// Calls are named after the native entry points, ie "clBuildProgram".
    pub fn fail_next(&self, call: &'static str, status: i32) {
        self.state.lock().failures.insert(call, status);
    }
    pub fn stats(&self) -> EmulatedStats {
        let state = self.state.lock();
        EmulatedStats {
            live_events: state.events.len(),
            ..state.stats
        }
    }
    /// How many times `event` was released.
    pub fn release_count(&self, event: NativeEvent) -> usize {
        self.state
            .lock()
            .event_releases
            .get(&event.0)
            .copied()
            .unwrap_or(0)
    }
    /// Whether `event` is live.
    pub fn is_live(&self, event: NativeEvent) -> bool {
        self.state.lock().events.contains_key(&event.0)
    }
    /// Contents of `buffer`.
    pub fn buffer_contents(&self, buffer: NativeBuffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer.0).cloned()
    }
    /// Number of live queues.
    pub fn queue_count(&self) -> usize {
        self.state.lock().queues.len()
    }
    /// Properties `queue` was created with.
    pub fn queue_properties(&self, queue: NativeQueue) -> Option<QueueProperties> {
        self.state
            .lock()
            .queues
            .get(&queue.0)
            .map(|(_, properties)| *properties)
    }
    /// Describes the emulated device of `class`.
    pub fn device_info(&self, class: DeviceClass) -> DeviceInfo {
        let (index, name) = match class {
            DeviceClass::Cpu => (0, "emulated cpu"),
            DeviceClass::Gpu => (1, "emulated gpu"),
            DeviceClass::Accelerator => (2, "emulated fpga"),
            DeviceClass::Other => (3, "emulated device"),
        };
        let (max_compute_units, max_work_group_size, max_work_item_sizes, warp) = match class {
            DeviceClass::Cpu => (8, 8192, [8192, 8192, 8192], 1),
            DeviceClass::Gpu | DeviceClass::Other => (64, 1024, [1024, 1024, 64], 32),
            DeviceClass::Accelerator => (1, 1024, [1024, 1024, 1024], 1),
        };
        DeviceInfo {
            device: NativeDevice(index as u64 + 1),
            platform_index: 0,
            device_index: index,
            name: name.to_string(),
            vendor: "krnl".to_string(),
            class,
            protocol_version: ProtocolVersion::V2_0,
            max_compute_units,
            max_work_group_size,
            max_work_item_sizes,
            preferred_work_group_multiple: warp,
        }
    }
    fn device_limits(device: NativeDevice) -> Option<(u64, [u64; 3])> {
        match device.0 {
            1 => Some((8192, [8192, 8192, 8192])),
            2 | 4 => Some((1024, [1024, 1024, 64])),
            3 => Some((1024, [1024, 1024, 1024])),
            _ => None,
        }
    }
    fn check_device(call: &'static str, device: NativeDevice) -> Result<(), DriverError> {
        if Self::device_limits(device).is_some() {
            Ok(())
        } else {
            Err(DriverError::new(call, INVALID_DEVICE))
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|x| x == needle)
}

fn is_spirv(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == spirv::MAGIC_NUMBER.to_le_bytes()
}

impl ComputeDriver for EmulatedDriver {
    fn create_command_queue(
        &self,
        device: NativeDevice,
        properties: QueueProperties,
    ) -> Result<NativeQueue, DriverError> {
        const CALL: &str = "clCreateCommandQueue";
        let mut state = self.state.lock();
        state.check(CALL)?;
        Self::check_device(CALL, device)?;
        let handle = state.handle();
        state.queues.insert(handle, (device, properties));
        Ok(NativeQueue(handle))
    }
    fn release_command_queue(&self, queue: NativeQueue) -> Result<(), DriverError> {
        const CALL: &str = "clReleaseCommandQueue";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state
            .queues
            .remove(&queue.0)
            .map(|_| ())
            .ok_or(DriverError::new(CALL, INVALID_QUEUE))
    }
    fn create_buffer(
        &self,
        device: NativeDevice,
        bytes: usize,
    ) -> Result<NativeBuffer, DriverError> {
        const CALL: &str = "clCreateBuffer";
        let mut state = self.state.lock();
        state.check(CALL)?;
        Self::check_device(CALL, device)?;
        if bytes == 0 {
            return Err(DriverError::new(CALL, INVALID_VALUE));
        }
        let handle = state.handle();
        state.buffers.insert(handle, vec![0; bytes]);
        Ok(NativeBuffer(handle))
    }
    fn release_buffer(&self, buffer: NativeBuffer) -> Result<(), DriverError> {
        const CALL: &str = "clReleaseMemObject";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state
            .buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or(DriverError::new(CALL, INVALID_MEM_OBJECT))
    }
    fn create_program_with_source(
        &self,
        device: NativeDevice,
        source: &[u8],
    ) -> Result<NativeProgram, DriverError> {
        const CALL: &str = "clCreateProgramWithSource";
        let mut state = self.state.lock();
        state.check(CALL)?;
        Self::check_device(CALL, device)?;
        if source.is_empty() {
            return Err(DriverError::new(CALL, INVALID_VALUE));
        }
        let handle = state.handle();
        state.programs.insert(
            handle,
            Program {
                device,
                source: ProgramSource::Source(source.to_vec()),
                status: BuildStatus::None,
                log: String::new(),
            },
        );
        Ok(NativeProgram(handle))
    }
    fn create_program_with_binary(
        &self,
        device: NativeDevice,
        binary: &[u8],
    ) -> Result<NativeProgram, DriverError> {
        const CALL: &str = "clCreateProgramWithBinary";
        let mut state = self.state.lock();
        state.check(CALL)?;
        Self::check_device(CALL, device)?;
        let source = binary
            .strip_prefix(BINARY_MAGIC)
            .ok_or(DriverError::new(CALL, INVALID_BINARY))?;
        let handle = state.handle();
        state.programs.insert(
            handle,
            Program {
                device,
                source: ProgramSource::Binary(source.to_vec()),
                status: BuildStatus::None,
                log: String::new(),
            },
        );
        Ok(NativeProgram(handle))
    }
    fn create_program_with_il(
        &self,
        device: NativeDevice,
        il: &[u8],
    ) -> Result<NativeProgram, DriverError> {
        const CALL: &str = "clCreateProgramWithIL";
        let mut state = self.state.lock();
        state.check(CALL)?;
        Self::check_device(CALL, device)?;
        if !is_spirv(il) {
            return Err(DriverError::new(CALL, INVALID_BINARY));
        }
        let handle = state.handle();
        state.programs.insert(
            handle,
            Program {
                device,
                source: ProgramSource::Il,
                status: BuildStatus::None,
                log: String::new(),
            },
        );
        Ok(NativeProgram(handle))
    }
    fn build_program(
        &self,
        program: NativeProgram,
        device: NativeDevice,
        _options: &str,
    ) -> Result<(), DriverError> {
        const CALL: &str = "clBuildProgram";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.stats.programs_built += 1;
        let program = state
            .programs
            .get_mut(&program.0)
            .ok_or(DriverError::new(CALL, INVALID_PROGRAM))?;
        if program.device != device {
            return Err(DriverError::new(CALL, INVALID_DEVICE));
        }
        let compiled = matches!(program.source, ProgramSource::Source(_));
        let error_line = program.source.text().and_then(|text| {
            String::from_utf8_lossy(text)
                .lines()
                .enumerate()
                .find(|(_, line)| line.trim_start().starts_with("#error"))
                .map(|(i, line)| format!("<source>:{}: error: {}", i + 1, line.trim()))
        });
        let result = if let Some(log) = error_line {
            program.status = BuildStatus::Error;
            program.log = log;
            Err(DriverError::new(CALL, BUILD_PROGRAM_FAILURE))
        } else {
            program.status = BuildStatus::Success;
            program.log.clear();
            Ok(())
        };
        if compiled {
            state.stats.compilations += 1;
        }
        result
    }
    fn program_build_status(
        &self,
        program: NativeProgram,
        _device: NativeDevice,
    ) -> Result<BuildStatus, DriverError> {
        const CALL: &str = "clGetProgramBuildInfo";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state
            .programs
            .get(&program.0)
            .map(|x| x.status)
            .ok_or(DriverError::new(CALL, INVALID_PROGRAM))
    }
    fn program_build_log(
        &self,
        program: NativeProgram,
        _device: NativeDevice,
    ) -> Result<String, DriverError> {
        const CALL: &str = "clGetProgramBuildInfo";
        let state = self.state.lock();
        state
            .programs
            .get(&program.0)
            .map(|x| x.log.clone())
            .ok_or(DriverError::new(CALL, INVALID_PROGRAM))
    }
    fn program_binary(
        &self,
        program: NativeProgram,
        _device: NativeDevice,
    ) -> Result<Vec<u8>, DriverError> {
        const CALL: &str = "clGetProgramInfo";
        let mut state = self.state.lock();
        state.check(CALL)?;
        let program = state
            .programs
            .get(&program.0)
            .ok_or(DriverError::new(CALL, INVALID_PROGRAM))?;
        match program.source.text() {
            Some(text) if program.status.is_success() => Ok([BINARY_MAGIC, text].concat()),
            _ => Err(DriverError::new(CALL, INVALID_PROGRAM_EXECUTABLE)),
        }
    }
    fn release_program(&self, program: NativeProgram) -> Result<(), DriverError> {
        const CALL: &str = "clReleaseProgram";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state
            .programs
            .remove(&program.0)
            .map(|_| ())
            .ok_or(DriverError::new(CALL, INVALID_PROGRAM))
    }
    fn create_kernel(
        &self,
        program: NativeProgram,
        entry_point: &str,
    ) -> Result<NativeKernel, DriverError> {
        const CALL: &str = "clCreateKernel";
        let mut state = self.state.lock();
        state.check(CALL)?;
        let built = state
            .programs
            .get(&program.0)
            .ok_or(DriverError::new(CALL, INVALID_PROGRAM))?;
        if !built.status.is_success() {
            return Err(DriverError::new(CALL, INVALID_PROGRAM_EXECUTABLE));
        }
        if let Some(text) = built.source.text() {
            if !contains(text, entry_point.as_bytes()) {
                return Err(DriverError::new(CALL, INVALID_KERNEL_NAME));
            }
        }
        let handle = state.handle();
        state.kernels.insert(handle, program);
        state.stats.kernels_created += 1;
        Ok(NativeKernel(handle))
    }
    fn release_kernel(&self, kernel: NativeKernel) -> Result<(), DriverError> {
        const CALL: &str = "clReleaseKernel";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state
            .kernels
            .remove(&kernel.0)
            .map(|_| ())
            .ok_or(DriverError::new(CALL, INVALID_KERNEL))
    }
    fn enqueue_nd_range_kernel(
        &self,
        queue: NativeQueue,
        kernel: NativeKernel,
        global_offset: Option<&[u64]>,
        global_work: &[u64],
        local_work: Option<&[u64]>,
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError> {
        const CALL: &str = "clEnqueueNDRangeKernel";
        let mut state = self.state.lock();
        state.check(CALL)?;
        let device = state.queue(CALL, queue)?;
        if !state.kernels.contains_key(&kernel.0) {
            return Err(DriverError::new(CALL, INVALID_KERNEL));
        }
        let dims = global_work.len();
        if !(1..=3).contains(&dims)
            || global_offset.map_or(false, |x| x.len() != dims)
            || local_work.map_or(false, |x| x.len() != dims)
        {
            return Err(DriverError::new(CALL, INVALID_WORK_DIMENSION));
        }
        if global_work.contains(&0) {
            return Err(DriverError::new(CALL, INVALID_VALUE));
        }
        if let Some(local_work) = local_work {
            let (max_group, max_items) =
                Self::device_limits(device).ok_or(DriverError::new(CALL, INVALID_DEVICE))?;
            let divides = global_work
                .iter()
                .zip(local_work)
                .all(|(g, l)| *l != 0 && g % l == 0);
            let within_items = local_work.iter().zip(max_items).all(|(l, max)| *l <= max);
            if !divides || !within_items || local_work.iter().product::<u64>() > max_group {
                return Err(DriverError::new(CALL, INVALID_WORK_GROUP_SIZE));
            }
        }
        if let Some(wait_list) = wait_list {
            state.check_events(CALL, wait_list)?;
        }
        state.stats.kernels_launched += 1;
        let duration = global_work.iter().product();
        Ok(state.event(queue, duration))
    }
    fn enqueue_write_buffer(
        &self,
        queue: NativeQueue,
        buffer: NativeBuffer,
        _blocking: bool,
        offset: usize,
        data: &[u8],
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError> {
        const CALL: &str = "clEnqueueWriteBuffer";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.queue(CALL, queue)?;
        if let Some(wait_list) = wait_list {
            state.check_events(CALL, wait_list)?;
        }
        let memory = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or(DriverError::new(CALL, INVALID_MEM_OBJECT))?;
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= memory.len())
            .ok_or(DriverError::new(CALL, INVALID_VALUE))?;
        memory[offset..end].copy_from_slice(data);
        Ok(state.event(queue, data.len() as u64))
    }
    unsafe fn enqueue_read_buffer(
        &self,
        queue: NativeQueue,
        buffer: NativeBuffer,
        _blocking: bool,
        offset: usize,
        data: &mut [u8],
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError> {
        const CALL: &str = "clEnqueueReadBuffer";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.queue(CALL, queue)?;
        if let Some(wait_list) = wait_list {
            state.check_events(CALL, wait_list)?;
        }
        let memory = state
            .buffers
            .get(&buffer.0)
            .ok_or(DriverError::new(CALL, INVALID_MEM_OBJECT))?;
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= memory.len())
            .ok_or(DriverError::new(CALL, INVALID_VALUE))?;
        data.copy_from_slice(&memory[offset..end]);
        Ok(state.event(queue, data.len() as u64))
    }
    fn enqueue_wait_for_events(
        &self,
        queue: NativeQueue,
        events: &[NativeEvent],
    ) -> Result<(), DriverError> {
        const CALL: &str = "clEnqueueWaitForEvents";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.queue(CALL, queue)?;
        if events.is_empty() {
            return Err(DriverError::new(CALL, INVALID_VALUE));
        }
        state.check_events(CALL, events)?;
        state.stats.blocking_waits += 1;
        Ok(())
    }
    fn enqueue_barrier_with_wait_list(
        &self,
        queue: NativeQueue,
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError> {
        const CALL: &str = "clEnqueueBarrierWithWaitList";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.queue(CALL, queue)?;
        if let Some(wait_list) = wait_list {
            state.check_events(CALL, wait_list)?;
        }
        state.stats.barriers += 1;
        Ok(state.event(queue, 0))
    }
    fn enqueue_marker_with_wait_list(
        &self,
        queue: NativeQueue,
        wait_list: Option<&[NativeEvent]>,
    ) -> Result<NativeEvent, DriverError> {
        const CALL: &str = "clEnqueueMarkerWithWaitList";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.queue(CALL, queue)?;
        if let Some(wait_list) = wait_list {
            state.check_events(CALL, wait_list)?;
        }
        Ok(state.event(queue, 0))
    }
    fn flush(&self, queue: NativeQueue) -> Result<(), DriverError> {
        const CALL: &str = "clFlush";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.queue(CALL, queue).map(|_| ())
    }
    fn finish(&self, queue: NativeQueue) -> Result<(), DriverError> {
        const CALL: &str = "clFinish";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state.queue(CALL, queue).map(|_| ())
    }
    fn wait_for_events(&self, events: &[NativeEvent]) -> Result<(), DriverError> {
        const CALL: &str = "clWaitForEvents";
        let mut state = self.state.lock();
        state.check(CALL)?;
        if events.is_empty() {
            return Err(DriverError::new(CALL, INVALID_VALUE));
        }
        state.check_events(CALL, events)?;
        state.stats.blocking_waits += 1;
        Ok(())
    }
    fn event_status(&self, event: NativeEvent) -> Result<EventStatus, DriverError> {
        const CALL: &str = "clGetEventInfo";
        let mut state = self.state.lock();
        state.check(CALL)?;
        state
            .events
            .get(&event.0)
            .map(|_| EventStatus::Complete)
            .ok_or(DriverError::new(CALL, INVALID_EVENT))
    }
    fn event_profiling_info(&self, event: NativeEvent) -> Result<ProfilingInfo, DriverError> {
        const CALL: &str = "clGetEventProfilingInfo";
        const PROFILING_INFO_NOT_AVAILABLE: i32 = -7;
        let mut state = self.state.lock();
        state.check(CALL)?;
        let event = state
            .events
            .get(&event.0)
            .ok_or(DriverError::new(CALL, INVALID_EVENT))?;
        let profiling = state
            .queues
            .get(&event.queue.0)
            .map_or(false, |(_, properties)| properties.profiling());
        if profiling {
            Ok(event.profiling)
        } else {
            Err(DriverError::new(CALL, PROFILING_INFO_NOT_AVAILABLE))
        }
    }
    fn release_event(&self, event: NativeEvent) -> Result<(), DriverError> {
        const CALL: &str = "clReleaseEvent";
        let mut state = self.state.lock();
        state.check(CALL)?;
        if state.events.remove(&event.0).is_none() {
            return Err(DriverError::new(CALL, INVALID_EVENT));
        }
        *state.event_releases.entry(event.0).or_default() += 1;
        state.stats.events_released += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(driver: &EmulatedDriver, source: &str) -> (DeviceInfo, NativeProgram) {
        let info = driver.device_info(DeviceClass::Gpu);
        let program = driver
            .create_program_with_source(info.device, source.as_bytes())
            .unwrap();
        let _ = driver.build_program(program, info.device, "");
        (info, program)
    }

    #[test]
    fn build_error_sets_log() {
        let driver = EmulatedDriver::new();
        let (info, program) = built(&driver, "__kernel void a() {}\n#error broken\n");
        assert_eq!(
            driver.program_build_status(program, info.device).unwrap(),
            BuildStatus::Error
        );
        let log = driver.program_build_log(program, info.device).unwrap();
        assert!(log.contains("2: error: #error broken"), "{log}");
        assert!(driver.create_kernel(program, "a").is_err());
    }

    #[test]
    fn binary_reloads() {
        let driver = EmulatedDriver::new();
        let (info, program) = built(&driver, "__kernel void fill() {}");
        let binary = driver.program_binary(program, info.device).unwrap();
        assert!(binary.starts_with(BINARY_MAGIC));
        let reloaded = driver
            .create_program_with_binary(info.device, &binary)
            .unwrap();
        driver.build_program(reloaded, info.device, "").unwrap();
        driver.create_kernel(reloaded, "fill").unwrap();
        let error = driver.create_kernel(reloaded, "missing").unwrap_err();
        assert_eq!(error.status, INVALID_KERNEL_NAME);
    }

    #[test]
    fn event_limit() {
        let driver = EmulatedDriver::new().with_event_limit(1);
        let info = driver.device_info(DeviceClass::Cpu);
        let queue = driver
            .create_command_queue(info.device, QueueProperties::empty())
            .unwrap();
        let first = driver.enqueue_marker_with_wait_list(queue, None).unwrap();
        assert!(first.is_valid());
        let second = driver.enqueue_marker_with_wait_list(queue, None).unwrap();
        assert_eq!(second, NativeEvent::INVALID);
        driver.release_event(first).unwrap();
        assert_eq!(driver.release_count(first), 1);
        assert!(driver.release_event(first).is_err());
    }

    #[test]
    fn fail_next_once() {
        let driver = EmulatedDriver::new();
        let info = driver.device_info(DeviceClass::Cpu);
        driver.fail_next("clCreateCommandQueue", -6);
        let error = driver
            .create_command_queue(info.device, QueueProperties::empty())
            .unwrap_err();
        assert_eq!(error, DriverError::new("clCreateCommandQueue", -6));
        driver
            .create_command_queue(info.device, QueueProperties::empty())
            .unwrap();
    }
}
