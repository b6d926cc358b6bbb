//! Property tests of launch geometry and event slot reuse.

use krnl_runtime::{
    config::{ExhaustionPolicy, RuntimeOptions},
    driver::{emulated::EmulatedDriver, ComputeDriver, DeviceClass, QueueProperties},
    event::{EventDescriptor, EventPool, LocalEvent},
    scheduler::{calculate_group_size, KernelScheduler, TaskMeta},
};
use proptest::prelude::*;
use std::{collections::VecDeque, sync::Arc};

fn scheduler(class: DeviceClass) -> KernelScheduler {
    KernelScheduler::for_device(
        &EmulatedDriver::new().device_info(class),
        &RuntimeOptions::default(),
    )
}

fn domain() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..5000, 1..=3)
}

fn task(domain: &[u64]) -> TaskMeta {
    let task = TaskMeta::new("s0.t0");
    match *domain {
        [x] => task.domain([x]),
        [x, y] => task.domain([x, y]),
        [x, y, z] => task.domain([x, y, z]),
        _ => unreachable!(),
    }
}

proptest! {
    #[test]
    fn group_size_divides(max in 0u64..2048, global in 0u64..100_000) {
        let group = calculate_group_size(max, global);
        prop_assert!(group >= 1);
        prop_assert!(group <= max.max(1));
        if global > 0 {
            prop_assert_eq!(global % group, 0);
        }
    }

    #[test]
    fn gpu_local_divides_global(domain in domain()) {
        let scheduler = scheduler(DeviceClass::Gpu);
        let global = scheduler.global_work(&task(&domain), None);
        prop_assert_eq!(&global, &domain);
        let local = scheduler.local_work(&global);
        prop_assert_eq!(local.len(), global.len());
        for (global, local) in global.iter().zip(&local) {
            prop_assert_eq!(global % local, 0);
        }
        prop_assert!(local.iter().product::<u64>() <= 1024);
    }

    #[test]
    fn fpga_global_is_multiple_of_32(domain in domain()) {
        let scheduler = scheduler(DeviceClass::Accelerator);
        let global = scheduler.global_work(&task(&domain), None);
        for (global, n) in global.iter().zip(&domain) {
            prop_assert_eq!(global % 32, 0);
            prop_assert!(global >= n);
            prop_assert!(global - n < 32);
        }
        let local = scheduler.local_work(&global);
        for (global, local) in global.iter().zip(&local) {
            prop_assert_eq!(global % local, 0);
        }
    }

    #[test]
    fn cpu_local_is_one(domain in domain(), coarsening in any::<bool>()) {
        let scheduler = scheduler(DeviceClass::Cpu);
        let global = scheduler.global_work(&task(&domain).thread_coarsening(coarsening), None);
        prop_assert!(global.iter().all(|x| *x >= 1));
        prop_assert!(scheduler.local_work(&global).iter().all(|x| *x == 1));
    }

    #[test]
    fn retained_slots_are_never_reused(
        capacity in 1usize..8,
        ops in prop::collection::vec((any::<bool>(), any::<bool>()), 1..64),
    ) {
        let driver = Arc::new(EmulatedDriver::new());
        let info = driver.device_info(DeviceClass::Gpu);
        let queue = driver.create_command_queue(info.device, QueueProperties::empty()).unwrap();
        let mut pool = EventPool::new(driver.clone(), queue, capacity)
            .exhaustion_policy(ExhaustionPolicy::Error);
        let mut retained = VecDeque::<LocalEvent>::new();
        for (retain, release) in ops {
            let native = driver.enqueue_marker_with_wait_list(queue, None).unwrap();
            let event = pool.register(native, EventDescriptor::Marker, 0).unwrap();
            if retained.len() == capacity {
                prop_assert!(!event.is_valid());
            } else {
                prop_assert!(event.is_valid());
                prop_assert!(!retained.contains(&event));
                if retain {
                    prop_assert!(pool.retain(event));
                    retained.push_back(event);
                }
            }
            if release {
                if let Some(event) = retained.pop_front() {
                    prop_assert!(pool.release(event));
                }
            }
        }
        pool.reset();
        prop_assert_eq!(driver.stats().live_events, 0);
    }
}
