/*!
Execution runtime for heterogeneous compute devices.

A [`DeviceContext`](device::DeviceContext) owns everything needed to run
kernels on one device:
- a [`CodeCache`](code_cache::CodeCache) of installed kernels,
- a [`KernelScheduler`](scheduler::KernelScheduler) that decides launch geometry,
- one [`CommandQueue`](queue::CommandQueue) per thread, each with its own
[`EventPool`](event::EventPool).

The vendor compute API is reached through the [`ComputeDriver`](driver::ComputeDriver)
trait. [`EmulatedDriver`](driver::emulated::EmulatedDriver) implements it in
process.

```no_run
# use krnl_runtime::{anyhow::Result, config::RuntimeOptions, device::{CodeKind, DeviceContext}, driver::{emulated::EmulatedDriver, DeviceClass}, scheduler::TaskMeta};
# use std::sync::Arc;
# fn main() -> Result<()> {
let driver = Arc::new(EmulatedDriver::new());
let info = driver.device_info(DeviceClass::Gpu);
let device = DeviceContext::builder(driver, info)
    .options(RuntimeOptions::from_env()?)
    .build()?;
let code = device.install_code(
    "s0.t0",
    "saxpy",
    b"__kernel void saxpy() {}",
    CodeKind::Source { options: "" },
)?;
let mut task = TaskMeta::new("s0.t0").domain([1024]);
let event = device.execute(&code, &mut task, &[], None)?;
device.resolve_event(event).unwrap().wait()?;
# Ok(())
# }
```
*/

pub extern crate anyhow;

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod code_cache;
pub mod config;
pub mod device;
pub mod driver;
pub mod event;
pub mod future;
pub mod queue;
pub mod scheduler;
