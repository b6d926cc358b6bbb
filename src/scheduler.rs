/*!
Launch geometry.

The [`KernelScheduler`] of a device decides the global and local work of
every launch from the iteration domain of a [`TaskMeta`]:
- cpus run one work item per thread, `max_compute_units * cpu_thread_factor`
threads unless the task coarsens threads itself,
- gpus launch the domain, with the largest local size up to the device limit
that divides it, or the block size of the task,
- fpgas launch the domain rounded up to 32, in fixed tiles.

With driver scheduling, from the task or
[`RuntimeOptions::driver_scheduling`], the local work is left to the driver.
*/

use crate::{
    config::RuntimeOptions,
    driver::{DeviceClass, DeviceInfo, NativeKernel, ProfilingInfo},
    event::{error::IntegrityViolation, LocalEvent},
    queue::CommandQueue,
};

const FPGA_GLOBAL_MULTIPLE: u64 = 32;
const FPGA_TILE_1D: [u64; 1] = [64];
const FPGA_TILE_2D: [u64; 2] = [16, 16];
const FPGA_TILE_3D: [u64; 3] = [16, 16, 1];

/// Global and local work of one launch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkGeometry {
    dims: usize,
    global: [u64; 3],
    local: Option<[u64; 3]>,
    offset: Option<[u64; 3]>,
}

fn dims3(dims: usize, values: &[u64]) -> [u64; 3] {
    assert_eq!(values.len(), dims, "expected {dims} dimensions");
    let mut output = [1; 3];
    output[..dims].copy_from_slice(values);
    output
}

impl WorkGeometry {
    /// The local work is left to the driver.
    ///
    /// **Panics**
    /// - If `global` does not have 1 to 3 dimensions.
    pub fn new(global: &[u64]) -> Self {
        let dims = global.len();
        assert!((1..=3).contains(&dims), "expected 1 to 3 dimensions");
        Self {
            dims,
            global: dims3(dims, global),
            local: None,
            offset: None,
        }
    }
    /// **Panics**
    /// - If `local` does not match the dimensions.
    pub fn with_local(self, local: &[u64]) -> Self {
        Self {
            local: Some(dims3(self.dims, local)),
            ..self
        }
    }
    /// **Panics**
    /// - If `offset` does not match the dimensions.
    pub fn with_offset(self, offset: &[u64]) -> Self {
        Self {
            offset: Some(dims3(self.dims, offset)),
            ..self
        }
    }
    pub fn dims(&self) -> usize {
        self.dims
    }
    pub fn global(&self) -> &[u64] {
        &self.global[..self.dims]
    }
    pub fn local(&self) -> Option<&[u64]> {
        self.local.as_ref().map(|x| &x[..self.dims])
    }
    pub fn offset(&self) -> Option<&[u64]> {
        self.offset.as_ref().map(|x| &x[..self.dims])
    }
}

/// Accumulated timings of the launches of a task.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct KernelProfile {
    pub launches: usize,
    /// Execution time in nanoseconds.
    pub total_kernel_ns: u64,
    /// Time between enqueue and submission in nanoseconds.
    pub dispatch_ns: u64,
}

impl KernelProfile {
    pub fn record(&mut self, info: &ProfilingInfo) {
        self.launches += 1;
        self.total_kernel_ns += info.elapsed();
        self.dispatch_ns += info.dispatch();
    }
}

/** A launch request.

Dimensions of the global or local work left at 0 are computed by the
scheduler.
```
# use krnl_runtime::scheduler::TaskMeta;
let task = TaskMeta::new("s0.t1")
    .domain([512, 512])
    .local_work([16, 0]);
assert_eq!(task.dims(), Some(2));
```
*/
#[derive(Clone, Debug)]
pub struct TaskMeta {
    id: String,
    dims: Option<usize>,
    domain: Option<[u64; 3]>,
    global: Option<[u64; 3]>,
    local: Option<[u64; 3]>,
    offset: Option<[u64; 3]>,
    thread_coarsening: bool,
    dump_geometry: bool,
    driver_scheduling: bool,
    gpu_block: Option<u64>,
    gpu_block_2d: Option<[u64; 2]>,
    profile: Option<KernelProfile>,
}

impl TaskMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dims: None,
            domain: None,
            global: None,
            local: None,
            offset: None,
            thread_coarsening: false,
            dump_geometry: false,
            driver_scheduling: false,
            gpu_block: None,
            gpu_block_2d: None,
            profile: None,
        }
    }
    fn with_dims<const N: usize>(&mut self, values: [u64; N]) -> [u64; 3] {
        assert!((1..=3).contains(&N), "expected 1 to 3 dimensions");
        if let Some(dims) = self.dims {
            assert_eq!(dims, N, "task {} has {dims} dimensions", self.id);
        }
        self.dims.replace(N);
        dims3(N, &values)
    }
    /// Cardinality of each dimension of the iteration domain.
    ///
    /// **Panics**
    /// - If `N` is not 1 to 3, or differs from previously set dimensions.
    pub fn domain<const N: usize>(mut self, domain: [u64; N]) -> Self {
        let domain = self.with_dims(domain);
        self.domain = Some(domain);
        self
    }
    /// **Panics**
    /// - If `N` is not 1 to 3, or differs from previously set dimensions.
    pub fn global_work<const N: usize>(mut self, global: [u64; N]) -> Self {
        let global = self.with_dims(global);
        self.global = Some(global);
        self
    }
    /// **Panics**
    /// - If `N` is not 1 to 3, or differs from previously set dimensions.
    pub fn local_work<const N: usize>(mut self, local: [u64; N]) -> Self {
        let local = self.with_dims(local);
        self.local = Some(local);
        self
    }
    /// **Panics**
    /// - If `N` is not 1 to 3, or differs from previously set dimensions.
    pub fn global_offset<const N: usize>(mut self, offset: [u64; N]) -> Self {
        let offset = self.with_dims(offset);
        self.offset = Some(offset);
        self
    }
    /// Each work item loops over part of the domain.
    pub fn thread_coarsening(self, thread_coarsening: bool) -> Self {
        Self {
            thread_coarsening,
            ..self
        }
    }
    /// Log the geometry of each launch.
    pub fn dump_geometry(self, dump_geometry: bool) -> Self {
        Self {
            dump_geometry,
            ..self
        }
    }
    /// Leave the local work to the driver.
    pub fn driver_scheduling(self, driver_scheduling: bool) -> Self {
        Self {
            driver_scheduling,
            ..self
        }
    }
    /// Local work of 1-D launches on gpus.
    ///
    /// Reduced to a divisor of the global work if it doesn't divide it.
    pub fn gpu_block(self, x: u64) -> Self {
        Self {
            gpu_block: Some(x),
            ..self
        }
    }
    /// Local work of the first two axes of 2-D and 3-D launches on gpus.
    pub fn gpu_block_2d(self, x: u64, y: u64) -> Self {
        Self {
            gpu_block_2d: Some([x, y]),
            ..self
        }
    }
    /// Accumulate a [`KernelProfile`] on profiling queues.
    pub fn profiled(self, profiled: bool) -> Self {
        Self {
            profile: profiled.then(KernelProfile::default),
            ..self
        }
    }
    pub fn id(&self) -> &str {
        &self.id
    }
    /// `None` for tasks launched as a single work item.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }
    pub fn profile(&self) -> Option<&KernelProfile> {
        self.profile.as_ref()
    }
    fn domain_or_one(&self, dims: usize) -> [u64; 3] {
        let mut domain = self.domain.unwrap_or([1; 3]);
        domain[dims..].fill(1);
        domain
    }
}

/// Largest `x <= max` dividing `global`.
///
/// `max` is halved when it equals `global`, so that more than one group is
/// launched. Never returns 0.
/// ```
/// # use krnl_runtime::scheduler::calculate_group_size;
/// assert_eq!(calculate_group_size(256, 1000), 250);
/// assert_eq!(calculate_group_size(64, 64), 32);
/// ```
pub fn calculate_group_size(max: u64, global: u64) -> u64 {
    let max = if max == global { max / 2 } else { max };
    let mut value = max.min(global);
    if value == 0 {
        return 1;
    }
    while global % value != 0 {
        value -= 1;
    }
    value
}

fn largest_divisor(n: u64, cap: u64) -> u64 {
    (1..=cap.min(n).max(1))
        .rev()
        .find(|x| n % x == 0)
        .unwrap_or(1)
}

fn round_up(n: u64, multiple: u64) -> u64 {
    if multiple <= 1 {
        n
    } else {
        (n + multiple - 1) / multiple * multiple
    }
}

/// Geometry strategy of a device class.
#[derive(Clone, Copy, Debug, PartialEq, derive_more::IsVariant)]
pub enum KernelScheduler {
    Cpu {
        max_compute_units: u32,
        thread_factor: f64,
    },
    Gpu {
        max_work_group_size: u64,
        max_work_item_sizes: [u64; 3],
        warp: u64,
        round_to_warp: bool,
    },
    Fpga,
}

impl KernelScheduler {
    /// Picks the strategy for the class of `info`.
    ///
    /// [`RuntimeOptions::force_gpu_scheduler`] selects the gpu strategy for every device.
    pub fn for_device(info: &DeviceInfo, options: &RuntimeOptions) -> Self {
        let gpu = Self::Gpu {
            max_work_group_size: info.max_work_group_size.max(1),
            max_work_item_sizes: info.max_work_item_sizes.map(|x| x.max(1)),
            warp: info.preferred_work_group_multiple.max(1),
            round_to_warp: options.round_to_warp,
        };
        if options.force_gpu_scheduler {
            return gpu;
        }
        match info.class {
            DeviceClass::Cpu => Self::Cpu {
                max_compute_units: info.max_compute_units,
                thread_factor: options.cpu_thread_factor,
            },
            DeviceClass::Gpu | DeviceClass::Other => gpu,
            DeviceClass::Accelerator => Self::Fpga,
        }
    }
    /// Global work for each dimension of `task`.
    ///
    /// `batch` replaces the domain on gpus.
    pub fn global_work(&self, task: &TaskMeta, batch: Option<u64>) -> Vec<u64> {
        let dims = task.dims().unwrap_or(1);
        let domain = task.domain_or_one(dims);
        let mut global = match self {
            Self::Cpu {
                max_compute_units,
                thread_factor,
            } => {
                if task.thread_coarsening {
                    domain
                } else {
                    let threads = (*max_compute_units as f64 * thread_factor) as u64;
                    [threads.max(1), 1, 1]
                }
            }
            Self::Gpu {
                warp,
                round_to_warp,
                ..
            } => {
                let mut global = batch.map_or(domain, |batch| [batch; 3]);
                if *round_to_warp {
                    global.iter_mut().for_each(|x| *x = round_up(*x, *warp));
                }
                global
            }
            Self::Fpga => domain.map(|x| round_up(x.max(1), FPGA_GLOBAL_MULTIPLE)),
        };
        global.iter_mut().for_each(|x| *x = (*x).max(1));
        global[..dims].to_vec()
    }
    /// Local work dividing `global` in every dimension.
    pub fn local_work(&self, global: &[u64]) -> Vec<u64> {
        match self {
            Self::Cpu { .. } => vec![1; global.len()],
            Self::Gpu {
                max_work_group_size,
                max_work_item_sizes,
                ..
            } => {
                let max: [u64; 3] = if global.len() == 1 {
                    [max_work_item_sizes[0].min(*max_work_group_size), 1, 1]
                } else {
                    let side = (*max_work_group_size as f64).sqrt() as u64;
                    [
                        side.min(max_work_item_sizes[0]),
                        side.min(max_work_item_sizes[1]),
                        1,
                    ]
                };
                global
                    .iter()
                    .zip(max)
                    .map(|(global, max)| calculate_group_size(max, *global))
                    .collect()
            }
            Self::Fpga => {
                let tile: &[u64] = match global.len() {
                    1 => &FPGA_TILE_1D,
                    2 => &FPGA_TILE_2D,
                    _ => &FPGA_TILE_3D,
                };
                global
                    .iter()
                    .zip(tile)
                    .map(|(global, tile)| {
                        if global % tile == 0 {
                            *tile
                        } else {
                            largest_divisor(*global, *tile)
                        }
                    })
                    .collect()
            }
        }
    }
    /// Local work for `task`, from its gpu block sizes if set.
    pub fn task_local_work(&self, task: &TaskMeta, global: &[u64]) -> Vec<u64> {
        let max_work_item_sizes = match self {
            Self::Gpu {
                max_work_item_sizes,
                ..
            } => max_work_item_sizes,
            _ => return self.local_work(global),
        };
        let blocks: &[u64] = match (global.len(), &task.gpu_block, &task.gpu_block_2d) {
            (1, Some(x), _) => std::slice::from_ref(x),
            (2 | 3, _, Some(xy)) => xy.as_slice(),
            _ => return self.local_work(global),
        };
        let mut local = vec![1; global.len()];
        for (((local, global), block), max) in local
            .iter_mut()
            .zip(global)
            .zip(blocks)
            .zip(max_work_item_sizes)
        {
            let block = (*block).min(*max).max(1);
            *local = if global % block == 0 {
                block
            } else {
                calculate_group_size(block, *global)
            };
        }
        local
    }
    /// Fills in the geometry `task` leaves unspecified.
    ///
    /// With [driver scheduling](TaskMeta::driver_scheduling) the local work is left unset.
    pub fn geometry(&self, task: &TaskMeta, batch: Option<u64>) -> Option<WorkGeometry> {
        self.geometry_with(task, batch, task.driver_scheduling)
    }
    fn geometry_with(
        &self,
        task: &TaskMeta,
        batch: Option<u64>,
        driver_scheduling: bool,
    ) -> Option<WorkGeometry> {
        let dims = task.dims()?;
        let mut global = task.global.unwrap_or([0; 3]);
        if global[..dims].contains(&0) {
            let computed = self.global_work(task, batch);
            for (x, computed) in global.iter_mut().zip(computed) {
                if *x == 0 {
                    *x = computed;
                }
            }
        }
        let mut geometry = WorkGeometry::new(&global[..dims]);
        if !driver_scheduling {
            let mut local = task.local.unwrap_or([0; 3]);
            if local[..dims].contains(&0) {
                let computed = self.task_local_work(task, &global[..dims]);
                for (x, computed) in local.iter_mut().zip(computed) {
                    if *x == 0 {
                        *x = computed;
                    }
                }
            }
            geometry = geometry.with_local(&local[..dims]);
        }
        if let Some(offset) = task.offset {
            geometry = geometry.with_offset(&offset[..dims]);
        }
        Some(geometry)
    }
    /// Launches `kernel` for `task` on `queue`.
    ///
    /// A task without dimensions is launched as a single work item. The local
    /// work is left to the driver if the task or the queue asks for driver
    /// scheduling. With a profiling queue and a [profiled](TaskMeta::profiled)
    /// task, waits for the launch and records its timings.
    pub fn submit(
        &self,
        queue: &mut CommandQueue,
        kernel: NativeKernel,
        task: &mut TaskMeta,
        dependencies: &[LocalEvent],
        batch: Option<u64>,
    ) -> Result<LocalEvent, IntegrityViolation> {
        let driver_scheduling = task.driver_scheduling || queue.driver_scheduling();
        let event = if let Some(geometry) = self.geometry_with(task, batch, driver_scheduling) {
            if task.dump_geometry {
                tracing::info!(
                    task = %task.id,
                    global = ?geometry.global(),
                    local = ?geometry.local(),
                    offset = ?geometry.offset(),
                    "launch geometry"
                );
            }
            queue.enqueue_kernel(kernel, &geometry, dependencies)?
        } else {
            if task.dump_geometry {
                tracing::info!(task = %task.id, "launch geometry: single work item");
            }
            queue.enqueue_task(kernel, dependencies)?
        };
        if let Some(profile) = task.profile.as_mut() {
            if queue.properties().profiling() {
                if let Some(resolved) = queue.resolve_event(event) {
                    match resolved.wait().and_then(|_| resolved.profiling()) {
                        Ok(info) => profile.record(&info),
                        Err(error) => tracing::warn!(task = %task.id, %error, "profiling failed"),
                    }
                }
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{emulated::EmulatedDriver, ComputeDriver};
    use std::sync::Arc;

    fn scheduler(class: DeviceClass, options: &RuntimeOptions) -> KernelScheduler {
        KernelScheduler::for_device(&EmulatedDriver::new().device_info(class), options)
    }

    #[test]
    fn group_size() {
        assert_eq!(calculate_group_size(256, 1000), 250);
        assert_eq!(calculate_group_size(1024, 1024), 512);
        assert_eq!(calculate_group_size(256, 7), 7);
        assert_eq!(calculate_group_size(1, 1), 1);
        assert_eq!(calculate_group_size(0, 5), 1);
        assert_eq!(calculate_group_size(32, 0), 1);
    }

    #[test]
    fn selection() {
        let options = RuntimeOptions::default();
        assert!(scheduler(DeviceClass::Cpu, &options).is_cpu());
        assert!(scheduler(DeviceClass::Gpu, &options).is_gpu());
        assert!(scheduler(DeviceClass::Other, &options).is_gpu());
        assert!(scheduler(DeviceClass::Accelerator, &options).is_fpga());
        let options = RuntimeOptions {
            force_gpu_scheduler: true,
            ..RuntimeOptions::default()
        };
        assert!(scheduler(DeviceClass::Cpu, &options).is_gpu());
        assert!(scheduler(DeviceClass::Accelerator, &options).is_gpu());
    }

    #[test]
    fn cpu() {
        let options = RuntimeOptions {
            cpu_thread_factor: 1.5,
            ..RuntimeOptions::default()
        };
        let cpu = scheduler(DeviceClass::Cpu, &options);
        let task = TaskMeta::new("t").domain([100, 3]);
        assert_eq!(cpu.global_work(&task, None), [12, 1]);
        let task = task.thread_coarsening(true);
        assert_eq!(cpu.global_work(&task, None), [100, 3]);
        assert_eq!(cpu.local_work(&[100, 3]), [1, 1]);
    }

    #[test]
    fn gpu() {
        let gpu = scheduler(DeviceClass::Gpu, &RuntimeOptions::default());
        let task = TaskMeta::new("t").domain([1000]);
        assert_eq!(gpu.global_work(&task, None), [1000]);
        assert_eq!(gpu.global_work(&task, Some(77)), [77]);
        assert_eq!(gpu.local_work(&[1000]), [1000]);
        assert_eq!(gpu.local_work(&[1024]), [512]);
        // sqrt(1024) = 32 per axis
        assert_eq!(gpu.local_work(&[64, 100, 5]), [32, 25, 1]);
        let warp = scheduler(
            DeviceClass::Gpu,
            &RuntimeOptions {
                round_to_warp: true,
                ..RuntimeOptions::default()
            },
        );
        assert_eq!(warp.global_work(&task, None), [1024]);
    }

    #[test]
    fn gpu_item_limit() {
        let driver = EmulatedDriver::new();
        let mut info = driver.device_info(DeviceClass::Gpu);
        info.max_work_item_sizes = [256, 256, 64];
        let gpu = KernelScheduler::for_device(&info, &RuntimeOptions::default());
        assert_eq!(gpu.local_work(&[1000]), [250]);
    }

    #[test]
    fn fpga() {
        let fpga = scheduler(DeviceClass::Accelerator, &RuntimeOptions::default());
        let task = TaskMeta::new("t").domain([100, 40]);
        let global = fpga.global_work(&task, None);
        assert_eq!(global, [128, 64]);
        assert_eq!(fpga.local_work(&global), [16, 16]);
        assert_eq!(fpga.local_work(&[96]), [48]);
        assert_eq!(fpga.local_work(&[32, 32, 5]), [16, 16, 1]);
    }

    #[test]
    fn geometry_fills_unspecified() {
        let gpu = scheduler(DeviceClass::Gpu, &RuntimeOptions::default());
        let task = TaskMeta::new("t")
            .domain([1000, 30])
            .global_work([0, 64])
            .local_work([8, 0]);
        let geometry = gpu.geometry(&task, None).unwrap();
        assert_eq!(geometry.global(), [1000, 64]);
        assert_eq!(geometry.local(), Some([8, 32].as_slice()));
        assert!(gpu.geometry(&TaskMeta::new("serial"), None).is_none());
    }

    #[test]
    fn gpu_blocks() {
        let gpu = scheduler(DeviceClass::Gpu, &RuntimeOptions::default());
        let task = TaskMeta::new("t").domain([1000]).gpu_block(8);
        assert_eq!(gpu.geometry(&task, None).unwrap().local(), Some([8].as_slice()));
        let task = TaskMeta::new("t").domain([1000]).gpu_block(64);
        assert_eq!(gpu.task_local_work(&task, &[1000]), [50]);
        let task = TaskMeta::new("t").domain([64, 100]).gpu_block_2d(16, 4);
        assert_eq!(gpu.task_local_work(&task, &[64, 100]), [16, 4]);
        let task = TaskMeta::new("t").domain([64, 100, 3]).gpu_block_2d(16, 4);
        assert_eq!(gpu.task_local_work(&task, &[64, 100, 3]), [16, 4, 1]);
        // 1-D block is not used for 2-D launches
        let task = TaskMeta::new("t").domain([64, 100]).gpu_block(8);
        assert_eq!(gpu.task_local_work(&task, &[64, 100]), gpu.local_work(&[64, 100]));
        let cpu = scheduler(DeviceClass::Cpu, &RuntimeOptions::default());
        let task = TaskMeta::new("t").domain([1000]).gpu_block(8);
        assert_eq!(cpu.task_local_work(&task, &[1000]), [1]);
    }

    #[test]
    fn task_driver_scheduling() {
        let gpu = scheduler(DeviceClass::Gpu, &RuntimeOptions::default());
        let task = TaskMeta::new("t")
            .domain([1000])
            .local_work([8])
            .driver_scheduling(true);
        let geometry = gpu.geometry(&task, None).unwrap();
        assert_eq!(geometry.global(), [1000]);
        assert!(geometry.local().is_none());
    }

    fn kernel(driver: &EmulatedDriver, info: &DeviceInfo) -> NativeKernel {
        let program = driver
            .create_program_with_source(info.device, b"__kernel void k() {}")
            .unwrap();
        driver.build_program(program, info.device, "").unwrap();
        driver.create_kernel(program, "k").unwrap()
    }

    #[test]
    fn options_driver_scheduling() {
        let driver = Arc::new(EmulatedDriver::new());
        let info = driver.device_info(DeviceClass::Gpu);
        let kernel = kernel(&driver, &info);
        let gpu = KernelScheduler::for_device(&info, &RuntimeOptions::default());
        // 7 doesn't divide 1000, the driver rejects it as local work
        let mut task = TaskMeta::new("t").domain([1000]).local_work([7]);
        let mut queue =
            CommandQueue::new(driver.clone(), &info, &RuntimeOptions::default()).unwrap();
        let event = gpu.submit(&mut queue, kernel, &mut task, &[], None).unwrap();
        assert!(!event.is_valid());
        let options = RuntimeOptions {
            driver_scheduling: true,
            ..RuntimeOptions::default()
        };
        let mut queue = CommandQueue::new(driver.clone(), &info, &options).unwrap();
        assert!(queue.driver_scheduling());
        let event = gpu.submit(&mut queue, kernel, &mut task, &[], None).unwrap();
        assert!(event.is_valid());
    }

    #[test]
    fn submit_profiles() {
        let driver = Arc::new(EmulatedDriver::new());
        let info = driver.device_info(DeviceClass::Gpu);
        let kernel = kernel(&driver, &info);
        let options = RuntimeOptions {
            profiling: true,
            ..RuntimeOptions::default()
        };
        let mut queue = CommandQueue::new(driver.clone(), &info, &options).unwrap();
        let gpu = KernelScheduler::for_device(&info, &options);
        let mut task = TaskMeta::new("t")
            .domain([64])
            .profiled(true)
            .dump_geometry(true);
        gpu.submit(&mut queue, kernel, &mut task, &[], None).unwrap();
        gpu.submit(&mut queue, kernel, &mut task, &[], None).unwrap();
        let profile = task.profile().unwrap();
        assert_eq!(profile.launches, 2);
        assert_eq!(profile.total_kernel_ns, 128);
        assert_eq!(profile.dispatch_ns, 2);
        let mut serial = TaskMeta::new("serial");
        let event = gpu.submit(&mut queue, kernel, &mut serial, &[], None).unwrap();
        assert_eq!(
            queue.resolve_event(event).unwrap().descriptor(),
            crate::event::EventDescriptor::KernelSerial
        );
    }
}
