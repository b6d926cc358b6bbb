/*!
Installed kernels of a device.

A [`CodeCache`] maps `(task, entry point)` to [`InstalledCode`]. Code is
built from source or loaded from a binary. The device binaries of
successful builds are persisted as is to
`<root>/codecache/device-<p>-<d>/<task>/<entry>`, and reloaded with
[`CodeCache::load_all_cached`] or as precompiled binaries. A failed build is not cached, its log and
source are written to `<root>/logs/device-<p>-<d>/`.
*/

use crate::{
    config::RuntimeOptions,
    driver::{BuildStatus, ComputeDriver, DeviceInfo, NativeDevice, NativeKernel, NativeProgram},
};
use dashmap::{mapref::entry::Entry, DashMap};
use error::CodeCacheError;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    fmt::{self, Debug},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Errors.
pub mod error {
    use std::{io, path::PathBuf};

    #[derive(Debug, thiserror::Error)]
    pub enum CodeCacheError {
        #[error("{path:?} exists and is not a directory")]
        NotADirectory { path: PathBuf },
        #[error("failed to create directory {path:?}")]
        Directory {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("failed to access {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
    }
}

/// Identifies installed code.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey {
    pub task_id: String,
    pub entry_point: String,
}

impl CacheKey {
    pub fn new(task_id: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            entry_point: entry_point.into(),
        }
    }
    /// `<task>-<entry>`, with path separators replaced.
    pub fn file_stem(&self) -> String {
        path_component(&format!("{}-{}", self.task_id, self.entry_point))
    }
    /// `<task>/<entry>`, with path separators replaced.
    pub fn binary_path(&self) -> PathBuf {
        Path::new(&path_component(&self.task_id)).join(path_component(&self.entry_point))
    }
}

fn path_component(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::IsVariant)]
pub enum CacheStatus {
    /// Being built.
    Pending,
    Built,
    Failed,
}

#[derive(Debug)]
struct CodeState {
    status: CacheStatus,
    program: Option<NativeProgram>,
    kernel: Option<NativeKernel>,
    build_log: String,
}

/// A kernel built for a device.
///
/// Releases its kernel and program when invalidated or dropped.
pub struct InstalledCode {
    key: CacheKey,
    code: Vec<u8>,
    driver: Arc<dyn ComputeDriver>,
    state: Mutex<CodeState>,
}

impl InstalledCode {
    fn pending(driver: Arc<dyn ComputeDriver>, key: CacheKey, code: &[u8]) -> Self {
        Self {
            key,
            code: code.to_vec(),
            driver,
            state: Mutex::new(CodeState {
                status: CacheStatus::Pending,
                program: None,
                kernel: None,
                build_log: String::new(),
            }),
        }
    }
    fn set_built(&self, program: NativeProgram, kernel: NativeKernel, build_log: String) {
        let mut state = self.state.lock();
        state.status = CacheStatus::Built;
        state.program.replace(program);
        state.kernel.replace(kernel);
        state.build_log = build_log;
    }
    fn set_failed(&self, program: Option<NativeProgram>, build_log: String) {
        let mut state = self.state.lock();
        state.status = CacheStatus::Failed;
        state.build_log = build_log;
        if let Some(program) = program {
            state.program.replace(program);
        }
        self.release(&mut state);
    }
    fn release(&self, state: &mut CodeState) {
        release_handles(&*self.driver, state);
    }
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
    pub fn task_id(&self) -> &str {
        &self.key.task_id
    }
    pub fn entry_point(&self) -> &str {
        &self.key.entry_point
    }
    /// The source or binary the code was installed from.
    pub fn code(&self) -> &[u8] {
        &self.code
    }
    pub fn status(&self) -> CacheStatus {
        self.state.lock().status
    }
    pub fn build_log(&self) -> String {
        self.state.lock().build_log.clone()
    }
    /// The kernel, if built and not invalidated.
    pub fn kernel(&self) -> Option<NativeKernel> {
        let state = self.state.lock();
        state.kernel.filter(|_| state.status.is_built())
    }
    pub fn is_valid(&self) -> bool {
        self.kernel().is_some()
    }
    /// Releases the kernel and marks the code failed.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.status = CacheStatus::Failed;
        self.release(&mut state);
    }
}

fn release_handles(driver: &dyn ComputeDriver, state: &mut CodeState) {
    if let Some(kernel) = state.kernel.take() {
        if let Err(error) = driver.release_kernel(kernel) {
            tracing::error!(?kernel, %error, "failed to release kernel");
        }
    }
    if let Some(program) = state.program.take() {
        if let Err(error) = driver.release_program(program) {
            tracing::error!(?program, %error, "failed to release program");
        }
    }
}

impl Drop for InstalledCode {
    fn drop(&mut self) {
        release_handles(&*self.driver, self.state.get_mut());
    }
}

impl Debug for InstalledCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InstalledCode")
            .field("key", &self.key)
            .field("status", &state.status)
            .field("kernel", &state.kernel)
            .finish()
    }
}

#[derive(Debug)]
struct CacheDirs {
    codecache: PathBuf,
    source: PathBuf,
    logs: PathBuf,
}

impl CacheDirs {
    fn new(root: &Path, device_dir: &str) -> Result<Self, CodeCacheError> {
        let dir = |name: &str| -> Result<PathBuf, CodeCacheError> {
            let path = root.join(name).join(device_dir);
            if path.exists() && !path.is_dir() {
                return Err(CodeCacheError::NotADirectory { path });
            }
            // tolerates concurrent creation
            fs::create_dir_all(&path).map_err(|source| CodeCacheError::Directory {
                path: path.clone(),
                source,
            })?;
            Ok(path)
        };
        Ok(Self {
            codecache: dir("codecache")?,
            source: dir("source")?,
            logs: dir("logs")?,
        })
    }
}

fn is_spirv(bytes: &[u8]) -> bool {
    bytes.len() >= 4
        && (bytes[..4] == spirv::MAGIC_NUMBER.to_le_bytes()
            || bytes[..4] == spirv::MAGIC_NUMBER.to_be_bytes())
}

fn read_dir(dir: &Path) -> Result<Vec<PathBuf>, CodeCacheError> {
    let entries = fs::read_dir(dir).map_err(|source| CodeCacheError::Io {
        path: dir.to_owned(),
        source,
    })?;
    Ok(entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(error) => {
                tracing::warn!(?dir, %error, "failed to read directory entry");
                None
            }
        })
        .collect())
}

/// The file name of `path` if its metadata satisfies `accept`, symlinks are not followed.
fn dir_entry_name(path: &Path, accept: impl FnOnce(&fs::Metadata) -> bool) -> Option<String> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if accept(&metadata) => (),
        Ok(_) => {
            tracing::debug!(?path, "skipping");
            return None;
        }
        Err(error) => {
            tracing::warn!(?path, %error, "failed to stat");
            return None;
        }
    }
    let name = path.file_name()?.to_str();
    if name.is_none() {
        tracing::debug!(?path, "skipping non utf-8 name");
    }
    name.map(str::to_owned)
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Err(error) = fs::write(path, bytes) {
        tracing::error!(?path, %error, "failed to write file");
    }
}

/// The code cache of one device.
pub struct CodeCache {
    driver: Arc<dyn ComputeDriver>,
    info: Arc<DeviceInfo>,
    options: Arc<RuntimeOptions>,
    entries: DashMap<CacheKey, Arc<InstalledCode>>,
    dirs: OnceCell<CacheDirs>,
}

impl CodeCache {
    pub fn new(
        driver: Arc<dyn ComputeDriver>,
        info: Arc<DeviceInfo>,
        options: Arc<RuntimeOptions>,
    ) -> Self {
        Self {
            driver,
            info,
            options,
            entries: DashMap::new(),
            dirs: OnceCell::new(),
        }
    }
    fn device(&self) -> NativeDevice {
        self.info.device
    }
    fn dirs(&self) -> Result<&CacheDirs, CodeCacheError> {
        self.dirs
            .get_or_try_init(|| CacheDirs::new(&self.options.root_dir, &self.info.dir_name()))
    }
    /// Directory of persisted binaries.
    pub fn codecache_dir(&self) -> Result<&Path, CodeCacheError> {
        Ok(&self.dirs()?.codecache)
    }
    /// Directory of dumped sources.
    pub fn source_dir(&self) -> Result<&Path, CodeCacheError> {
        Ok(&self.dirs()?.source)
    }
    /// Directory of build logs.
    pub fn logs_dir(&self) -> Result<&Path, CodeCacheError> {
        Ok(&self.dirs()?.logs)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn get(&self, task_id: &str, entry_point: &str) -> Option<Arc<InstalledCode>> {
        self.get_key(&CacheKey::new(task_id, entry_point))
    }
    fn get_key(&self, key: &CacheKey) -> Option<Arc<InstalledCode>> {
        self.entries.get(key).map(|x| x.value().clone())
    }
    fn get_valid(&self, key: &CacheKey) -> Option<Arc<InstalledCode>> {
        self.get_key(key).filter(|x| x.is_valid())
    }
    /// Whether valid code is installed.
    pub fn is_cached(&self, task_id: &str, entry_point: &str) -> bool {
        self.get(task_id, entry_point)
            .map_or(false, |x| x.is_valid())
    }
    /// Inserts `code`, unless valid code was inserted concurrently.
    fn insert(&self, code: InstalledCode) -> Arc<InstalledCode> {
        let code = Arc::new(code);
        match self.entries.entry(code.key.clone()) {
            Entry::Occupied(occupied) if occupied.get().is_valid() => {
                tracing::debug!(key = ?code.key, "code installed concurrently");
                code.invalidate();
                occupied.get().clone()
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(code.clone());
                code
            }
            Entry::Vacant(vacant) => {
                vacant.insert(code.clone());
                code
            }
        }
    }
    fn fail(
        &self,
        code: InstalledCode,
        program: Option<NativeProgram>,
        build_log: String,
        source_extension: Option<&str>,
    ) -> Result<Arc<InstalledCode>, CodeCacheError> {
        let stem = code.key.file_stem();
        let logs = self.logs_dir()?;
        tracing::error!(
            task = %code.key.task_id,
            entry_point = %code.key.entry_point,
            %build_log,
            "failed to install code"
        );
        write_file(&logs.join(format!("{stem}.log")), build_log.as_bytes());
        if let Some(extension) = source_extension {
            write_file(&logs.join(format!("{stem}.{extension}")), &code.code);
        }
        code.set_failed(program, build_log);
        Ok(Arc::new(code))
    }
    /// Builds `program` and creates the kernel.
    ///
    /// Returns the build log, or the log and the program on failure.
    fn build(
        &self,
        program: NativeProgram,
        entry_point: &str,
        build_options: &str,
    ) -> Result<(NativeKernel, String), String> {
        let device = self.device();
        let build = self.driver.build_program(program, device, build_options);
        let status = self
            .driver
            .program_build_status(program, device)
            .unwrap_or_else(|error| {
                tracing::error!(%error, "failed to query build status");
                BuildStatus::Error
            });
        let mut build_log = self
            .driver
            .program_build_log(program, device)
            .unwrap_or_default();
        if let Err(error) = build {
            if build_log.is_empty() {
                build_log = error.to_string();
            }
            return Err(build_log);
        }
        if !status.is_success() {
            return Err(build_log);
        }
        match self.driver.create_kernel(program, entry_point) {
            Ok(kernel) => Ok((kernel, build_log)),
            Err(error) => {
                build_log.push_str(&format!("\n{entry_point}: {error}"));
                Err(build_log)
            }
        }
    }
    /// Path of the persisted binary of `entry_point`.
    ///
    /// **errors**
    /// - The device directories could not be resolved.
    pub fn binary_path(&self, task_id: &str, entry_point: &str) -> Result<PathBuf, CodeCacheError> {
        Ok(self
            .codecache_dir()?
            .join(CacheKey::new(task_id, entry_point).binary_path()))
    }
    /// Writes `binary` to the binary path of `key`, failures are logged.
    fn persist(&self, key: &CacheKey, binary: &[u8]) {
        let path = match self.binary_path(&key.task_id, &key.entry_point) {
            Ok(path) => path,
            Err(error) => {
                tracing::error!(?key, %error, "failed to persist binary");
                return;
            }
        };
        if let Some(dir) = path.parent() {
            if let Err(error) = fs::create_dir_all(dir) {
                tracing::error!(?dir, %error, "failed to persist binary");
                return;
            }
        }
        write_file(&path, binary);
        tracing::debug!(?path, "persisted binary");
    }
    fn persist_allowed(&self) -> bool {
        if !self.options.persist_binaries() {
            return false;
        }
        if !self.options.binaries_allowed(&self.info.vendor) {
            tracing::debug!(vendor = %self.info.vendor, "binaries are not persisted for vendor");
            return false;
        }
        true
    }
    /// Compiles `source` and installs `entry_point`.
    ///
    /// Valid installed code is returned unchanged. A build failure is not an
    /// error, the returned code is [failed](CacheStatus::Failed) and not cached.
    ///
    /// **errors**
    /// - The device directories could not be resolved.
    pub fn install_from_source(
        &self,
        task_id: &str,
        entry_point: &str,
        source: &[u8],
        build_options: &str,
    ) -> Result<Arc<InstalledCode>, CodeCacheError> {
        let key = CacheKey::new(task_id, entry_point);
        if let Some(code) = self.get_valid(&key) {
            return Ok(code);
        }
        if self.options.dump_source {
            let path = self.source_dir()?.join(format!("{}.cl", key.file_stem()));
            write_file(&path, source);
        }
        if self.options.print_source {
            tracing::info!(
                task = task_id,
                entry_point,
                source = %String::from_utf8_lossy(source),
                "building source"
            );
        }
        let code = InstalledCode::pending(self.driver.clone(), key, source);
        let program = match self.driver.create_program_with_source(self.device(), source) {
            Ok(program) => program,
            Err(error) => return self.fail(code, None, error.to_string(), Some("cl")),
        };
        let (kernel, build_log) = match self.build(program, entry_point, build_options) {
            Ok(built) => built,
            Err(build_log) => return self.fail(code, Some(program), build_log, Some("cl")),
        };
        code.set_built(program, kernel, build_log);
        tracing::debug!(task = task_id, entry_point, "built source");
        let code = self.insert(code);
        if code.kernel() == Some(kernel) && self.persist_allowed() {
            match self.driver.program_binary(program, self.device()) {
                Ok(binary) => self.persist(&code.key, &binary),
                Err(error) => tracing::warn!(%error, "failed to get program binary"),
            }
        }
        Ok(code)
    }
    /// Installs `entry_point` from `binary`.
    ///
    /// SPIR-V is loaded as IL, anything else as a vendor binary. The binary is
    /// persisted unless `already_cached`.
    ///
    /// **errors**
    /// - The device directories could not be resolved.
    pub fn install_from_binary(
        &self,
        task_id: &str,
        entry_point: &str,
        binary: &[u8],
        already_cached: bool,
    ) -> Result<Arc<InstalledCode>, CodeCacheError> {
        let key = CacheKey::new(task_id, entry_point);
        if let Some(code) = self.get_valid(&key) {
            return Ok(code);
        }
        let code = InstalledCode::pending(self.driver.clone(), key, binary);
        let program = if is_spirv(binary) {
            self.driver.create_program_with_il(self.device(), binary)
        } else {
            self.driver.create_program_with_binary(self.device(), binary)
        };
        let program = match program {
            Ok(program) => program,
            Err(error) => return self.fail(code, None, error.to_string(), None),
        };
        let (kernel, build_log) = match self.build(program, entry_point, "") {
            Ok(built) => built,
            Err(build_log) => return self.fail(code, Some(program), build_log, None),
        };
        code.set_built(program, kernel, build_log);
        tracing::debug!(task = task_id, entry_point, already_cached, "loaded binary");
        let code = self.insert(code);
        if !already_cached && code.kernel() == Some(kernel) && self.persist_allowed() {
            self.persist(&code.key, binary);
        }
        Ok(code)
    }
    /// Installs the configured precompiled binary of `task_id`, if any.
    ///
    /// **errors**
    /// - The binary could not be read.
    pub fn install_precompiled(
        &self,
        task_id: &str,
        entry_point: &str,
    ) -> Result<Option<Arc<InstalledCode>>, CodeCacheError> {
        let precompiled = if let Some(precompiled) = self.options.precompiled_binary(task_id) {
            precompiled
        } else {
            return Ok(None);
        };
        let binary = fs::read(&precompiled.path).map_err(|source| CodeCacheError::Io {
            path: precompiled.path.clone(),
            source,
        })?;
        tracing::info!(task = task_id, path = ?precompiled.path, "installing precompiled binary");
        self.install_from_binary(task_id, entry_point, &binary, false)
            .map(Some)
    }
    /// Installs every persisted binary, when caching is enabled.
    ///
    /// The key of each binary is recovered from its `<task>/<entry>` path.
    /// Returns the number of installed entries. Files that are empty, not
    /// regular, outside a task directory or that fail to load are skipped.
    ///
    /// **errors**
    /// - The device directories could not be resolved or read.
    pub fn load_all_cached(&self) -> Result<usize, CodeCacheError> {
        if !self.options.cache_enable {
            return Ok(0);
        }
        let dir = self.codecache_dir()?;
        let mut installed = 0;
        for task_dir in read_dir(dir)? {
            let task_id = match dir_entry_name(&task_dir, |x| x.is_dir()) {
                Some(task_id) => task_id,
                None => continue,
            };
            let binaries = match read_dir(&task_dir) {
                Ok(binaries) => binaries,
                Err(error) => {
                    tracing::warn!(%error, "skipping task directory");
                    continue;
                }
            };
            for path in binaries {
                let entry_point =
                    match dir_entry_name(&path, |x| x.is_file() && x.len() > 0) {
                        Some(entry_point) => entry_point,
                        None => continue,
                    };
                let binary = match fs::read(&path) {
                    Ok(binary) => binary,
                    Err(error) => {
                        tracing::warn!(?path, %error, "skipping cached binary");
                        continue;
                    }
                };
                let code = self.install_from_binary(&task_id, &entry_point, &binary, true)?;
                if code.is_valid() {
                    installed += 1;
                } else {
                    tracing::warn!(?path, "cached binary failed to load");
                }
            }
        }
        tracing::debug!(installed, ?dir, "loaded cached binaries");
        Ok(installed)
    }
    /// Invalidates and removes all code.
    pub fn reset(&self) {
        for entry in self.entries.iter() {
            entry.value().invalidate();
        }
        self.entries.clear();
    }
}

impl Debug for CodeCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CodeCache")
            .field("device", &self.info.dir_name())
            .field("entries", &self.entries.len())
            .finish()
    }
}
