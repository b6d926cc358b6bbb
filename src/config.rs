/*!
Runtime options.

[`RuntimeOptions::from_env`] reads `KRNL_*` environment variables:

| variable | field | default |
|---|---|---|
| `KRNL_RUNTIME_ROOT` | `root_dir` | `<temp>/krnl-runtime` |
| `KRNL_CODECACHE_ENABLE` | `cache_enable` | false |
| `KRNL_CODECACHE_LOADBIN` | `load_binaries` | false |
| `KRNL_CODECACHE_DUMP` | `dump_binaries` | false |
| `KRNL_SOURCE_DUMP` | `dump_source` | false |
| `KRNL_SOURCE_PRINT` | `print_source` | false |
| `KRNL_CIRCULAR_EVENTS` | `circular_events` | true |
| `KRNL_EVENT_WINDOW` | `event_window` | 1024 |
| `KRNL_MAX_WAIT_EVENTS` | `max_wait_events` | 32 |
| `KRNL_EVENT_EXHAUSTION` | `exhaustion_policy` | fatal |
| `KRNL_OOO_EXECUTION` | `out_of_order` | false |
| `KRNL_FORCE_BLOCKING` | `force_blocking` | false |
| `KRNL_FORCE_GPU_SCHEDULER` | `force_gpu_scheduler` | false |
| `KRNL_MARKER_USE_BARRIER` | `marker_use_barrier` | false |
| `KRNL_PROFILING` | `profiling` | false |
| `KRNL_CPU_THREAD_FACTOR` | `cpu_thread_factor` | 1.0 |
| `KRNL_GPU_ROUND_TO_WARP` | `round_to_warp` | false |
| `KRNL_USE_DRIVER_SCHEDULING` | `driver_scheduling` | false |
| `KRNL_PRECOMPILED_BINARIES` | `precompiled` | empty |
| `KRNL_BINARY_DENYLIST` | `binary_denylist` | Apple |

Booleans are `true` / `false` (or `1` / `0`), case insensitive.
`KRNL_PRECOMPILED_BINARIES` is a `;` separated list of `path,task` pairs and
`KRNL_BINARY_DENYLIST` a `,` separated list of vendors.
*/

use error::ConfigError;
use std::path::PathBuf;

/// Errors.
pub mod error {
    /// A malformed option.
    #[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
    pub enum ConfigError {
        #[error("{var}={value:?} is not valid, expected {expected}")]
        Invalid {
            var: &'static str,
            value: String,
            expected: &'static str,
        },
        #[error("{var} entry {entry:?} is not a `path,task` pair")]
        PrecompiledEntry { var: &'static str, entry: String },
    }
}

/// What happens when every event slot of a queue is retained.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, derive_more::IsVariant)]
pub enum ExhaustionPolicy {
    /// Return [`IntegrityViolation::PoolExhausted`](crate::event::error::IntegrityViolation::PoolExhausted).
    #[default]
    Fatal,
    /// Log, release the incoming event and hand out [`LocalEvent::INVALID`](crate::event::LocalEvent::INVALID).
    Error,
}

/// A binary to install for a task instead of compiling its source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrecompiledBinary {
    pub path: PathBuf,
    pub task_id: String,
}

/// Options for a [`DeviceContext`](crate::device::DeviceContext).
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// Contains `codecache`, `source` and `logs`.
    pub root_dir: PathBuf,
    /// Persist built binaries and reload them on startup.
    pub cache_enable: bool,
    /// Install [`precompiled`](Self::precompiled) binaries.
    pub load_binaries: bool,
    /// Persist built binaries even when caching is disabled.
    pub dump_binaries: bool,
    pub dump_source: bool,
    /// Log the source of every build.
    pub print_source: bool,
    /// Wrap around to the start of the event pool.
    pub circular_events: bool,
    /// Capacity of each queue's event pool.
    pub event_window: usize,
    /// Maximum number of dependencies of a single operation.
    pub max_wait_events: usize,
    pub exhaustion_policy: ExhaustionPolicy,
    /// Create out of order queues.
    pub out_of_order: bool,
    /// Wait for every kernel launch.
    pub force_blocking: bool,
    /// Schedule every device like a gpu.
    pub force_gpu_scheduler: bool,
    /// Enqueue markers as barriers.
    pub marker_use_barrier: bool,
    /// Create profiling queues.
    pub profiling: bool,
    /// Threads per compute unit for cpus.
    pub cpu_thread_factor: f64,
    /// Round gpu global work up to the warp size.
    pub round_to_warp: bool,
    /// Leave the local work of every launch to the driver.
    pub driver_scheduling: bool,
    pub precompiled: Vec<PrecompiledBinary>,
    /// Vendors whose drivers can't be trusted to return program binaries.
    pub binary_denylist: Vec<String>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("krnl-runtime"),
            cache_enable: false,
            load_binaries: false,
            dump_binaries: false,
            dump_source: false,
            print_source: false,
            circular_events: true,
            event_window: 1024,
            max_wait_events: 32,
            exhaustion_policy: ExhaustionPolicy::Fatal,
            out_of_order: false,
            force_blocking: false,
            force_gpu_scheduler: false,
            marker_use_barrier: false,
            profiling: false,
            cpu_thread_factor: 1.0,
            round_to_warp: false,
            driver_scheduling: false,
            precompiled: Vec::new(),
            binary_denylist: vec!["Apple".to_string()],
        }
    }
}

impl RuntimeOptions {
    /// Reads options from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }
    /// Reads options with `lookup`, unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(root_dir) = lookup("KRNL_RUNTIME_ROOT").filter(|x| !x.is_empty()) {
            options.root_dir = root_dir.into();
        }
        let flags: [(&'static str, &mut bool); 13] = [
            ("KRNL_CODECACHE_ENABLE", &mut options.cache_enable),
            ("KRNL_CODECACHE_LOADBIN", &mut options.load_binaries),
            ("KRNL_CODECACHE_DUMP", &mut options.dump_binaries),
            ("KRNL_SOURCE_DUMP", &mut options.dump_source),
            ("KRNL_SOURCE_PRINT", &mut options.print_source),
            ("KRNL_CIRCULAR_EVENTS", &mut options.circular_events),
            ("KRNL_OOO_EXECUTION", &mut options.out_of_order),
            ("KRNL_FORCE_BLOCKING", &mut options.force_blocking),
            ("KRNL_FORCE_GPU_SCHEDULER", &mut options.force_gpu_scheduler),
            ("KRNL_MARKER_USE_BARRIER", &mut options.marker_use_barrier),
            ("KRNL_PROFILING", &mut options.profiling),
            ("KRNL_GPU_ROUND_TO_WARP", &mut options.round_to_warp),
            ("KRNL_USE_DRIVER_SCHEDULING", &mut options.driver_scheduling),
        ];
        for (var, flag) in flags {
            if let Some(value) = lookup(var) {
                *flag = parse_bool(var, &value)?;
            }
        }
        if let Some(value) = lookup("KRNL_EVENT_WINDOW") {
            options.event_window = parse_count("KRNL_EVENT_WINDOW", &value)?;
        }
        if let Some(value) = lookup("KRNL_MAX_WAIT_EVENTS") {
            options.max_wait_events = parse_count("KRNL_MAX_WAIT_EVENTS", &value)?;
        }
        if let Some(value) = lookup("KRNL_EVENT_EXHAUSTION") {
            options.exhaustion_policy = match value.trim().to_ascii_lowercase().as_str() {
                "fatal" => ExhaustionPolicy::Fatal,
                "error" => ExhaustionPolicy::Error,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "KRNL_EVENT_EXHAUSTION",
                        value,
                        expected: "fatal or error",
                    })
                }
            };
        }
        if let Some(value) = lookup("KRNL_CPU_THREAD_FACTOR") {
            options.cpu_thread_factor = value
                .trim()
                .parse()
                .ok()
                .filter(|x: &f64| x.is_finite() && *x > 0.)
                .ok_or_else(|| ConfigError::Invalid {
                    var: "KRNL_CPU_THREAD_FACTOR",
                    value: value.clone(),
                    expected: "a positive number",
                })?;
        }
        if let Some(value) = lookup("KRNL_PRECOMPILED_BINARIES") {
            options.precompiled = parse_precompiled("KRNL_PRECOMPILED_BINARIES", &value)?;
        }
        if let Some(value) = lookup("KRNL_BINARY_DENYLIST") {
            options.binary_denylist = value
                .split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(Into::into)
                .collect();
        }
        Ok(options)
    }
    /// Whether program binaries of `vendor` may be requested.
    pub fn binaries_allowed(&self, vendor: &str) -> bool {
        !self
            .binary_denylist
            .iter()
            .any(|denied| vendor.contains(denied.as_str()))
    }
    /// Whether built binaries are written to the code cache.
    pub fn persist_binaries(&self) -> bool {
        self.cache_enable || self.dump_binaries
    }
    /// The precompiled binary for `task_id`, if loading binaries is enabled.
    pub fn precompiled_binary(&self, task_id: &str) -> Option<&PrecompiledBinary> {
        if !self.load_binaries {
            return None;
        }
        self.precompiled.iter().find(|x| x.task_id == task_id)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}

fn parse_count(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .ok()
        .filter(|x| *x > 0)
        .ok_or_else(|| ConfigError::Invalid {
            var,
            value: value.to_string(),
            expected: "a positive integer",
        })
}

fn parse_precompiled(
    var: &'static str,
    value: &str,
) -> Result<Vec<PrecompiledBinary>, ConfigError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|entry| {
            let (path, task_id) = entry
                .split_once(',')
                .map(|(path, task)| (path.trim(), task.trim()))
                .filter(|(path, task)| !path.is_empty() && !task.is_empty())
                .ok_or_else(|| ConfigError::PrecompiledEntry {
                    var,
                    entry: entry.to_string(),
                })?;
            Ok(PrecompiledBinary {
                path: path.into(),
                task_id: task_id.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn options(vars: &[(&str, &str)]) -> Result<RuntimeOptions, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeOptions::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let options = options(&[]).unwrap();
        assert!(options.circular_events);
        assert!(!options.cache_enable);
        assert_eq!(options.event_window, 1024);
        assert_eq!(options.max_wait_events, 32);
        assert!(options.exhaustion_policy.is_fatal());
        assert!(!options.driver_scheduling);
        assert!(!options.binaries_allowed("Apple Inc."));
        assert!(options.binaries_allowed("NVIDIA Corporation"));
    }

    #[test]
    fn flags() {
        let options = options(&[
            ("KRNL_CODECACHE_ENABLE", "TRUE"),
            ("KRNL_CIRCULAR_EVENTS", "false"),
            ("KRNL_OOO_EXECUTION", "1"),
            ("KRNL_EVENT_WINDOW", "4"),
            ("KRNL_EVENT_EXHAUSTION", "Error"),
            ("KRNL_CPU_THREAD_FACTOR", "2.5"),
            ("KRNL_BINARY_DENYLIST", ""),
            ("KRNL_USE_DRIVER_SCHEDULING", "true"),
        ])
        .unwrap();
        assert!(options.driver_scheduling);
        assert!(options.cache_enable);
        assert!(!options.circular_events);
        assert!(options.out_of_order);
        assert_eq!(options.event_window, 4);
        assert!(options.exhaustion_policy.is_error());
        assert_eq!(options.cpu_thread_factor, 2.5);
        assert!(options.binaries_allowed("Apple"));
    }

    #[test]
    fn malformed() {
        assert!(matches!(
            options(&[("KRNL_FORCE_BLOCKING", "yes")]),
            Err(ConfigError::Invalid {
                var: "KRNL_FORCE_BLOCKING",
                ..
            })
        ));
        assert!(options(&[("KRNL_EVENT_WINDOW", "0")]).is_err());
        assert!(options(&[("KRNL_CPU_THREAD_FACTOR", "-1")]).is_err());
        assert!(options(&[("KRNL_EVENT_EXHAUSTION", "ignore")]).is_err());
    }

    #[test]
    fn precompiled() {
        let options = options(&[
            ("KRNL_CODECACHE_LOADBIN", "true"),
            ("KRNL_PRECOMPILED_BINARIES", "a.bin,s0.t0; b.spv , s0.t1;"),
        ])
        .unwrap();
        assert_eq!(options.precompiled.len(), 2);
        let binary = options.precompiled_binary("s0.t1").unwrap();
        assert_eq!(binary.path, PathBuf::from("b.spv"));
        assert!(options.precompiled_binary("s0.t2").is_none());
        let error = self::options(&[("KRNL_PRECOMPILED_BINARIES", "a.bin")]).unwrap_err();
        assert!(matches!(error, ConfigError::PrecompiledEntry { .. }));
    }
}
