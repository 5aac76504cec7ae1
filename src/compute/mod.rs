//! Device discovery, queues, programs and profiling.
//!
//! [`Context`] is the only owner of devices and queues. Operations borrow it,
//! take queues from its round-robin rotation and allocate buffers through it.

pub mod buffer;
pub mod platform;
pub mod program;
pub mod queue;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{error, info};

pub use buffer::{Buffer, MemAccess};
pub use platform::{Device, DeviceInfo, DeviceKind, Platform};
pub use program::{Kernel, KernelArg, NdRange, Program};
pub use queue::{Event, Queue};

use crate::error::{Error, Result};
use crate::kernels;

/// Kernel strategy family chosen from a device's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStrategy {
    /// Few coarse work items, one per compute unit.
    Cpu,
    /// Many work-groups cooperating through local memory.
    Gpu,
}

impl DeviceStrategy {
    pub fn for_device(device: &Device) -> Self {
        match device.kind() {
            DeviceKind::Cpu => DeviceStrategy::Cpu,
            DeviceKind::Gpu => DeviceStrategy::Gpu,
        }
    }
}

/// Tag to cumulative time accumulator.
#[derive(Debug, Default)]
pub struct Profiler {
    enabled: AtomicBool,
    times: Mutex<BTreeMap<String, Duration>>,
}

impl Profiler {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn add(&self, tags: &[&str], elapsed: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let mut times = self.times.lock()?;
        for tag in tags {
            *times.entry(tag.to_string()).or_default() += elapsed;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, Duration>> {
        Ok(self.times.lock()?.clone())
    }
}

pub struct Context {
    platform: Platform,
    devices: Vec<Device>,
    queues: Vec<Queue>,
    cursor: Mutex<usize>,
    profiler: Profiler,
}

impl Context {
    pub fn platform_count() -> usize {
        Platform::all().len()
    }

    /// Opens platform `platform_index`, keeping at most `device_limit` of its
    /// devices and dropping those without double precision support.
    pub fn new(platform_index: usize, device_limit: Option<usize>) -> Result<Self> {
        let mut platforms = Platform::all();
        if platform_index >= platforms.len() {
            return Err(Error::Configuration(format!(
                "invalid platform index {} ({} platforms available)",
                platform_index,
                platforms.len()
            )));
        }
        let platform = platforms.swap_remove(platform_index);
        Self::with_platform(platform, device_limit)
    }

    pub fn with_platform(platform: Platform, device_limit: Option<usize>) -> Result<Self> {
        if platform.devices.is_empty() {
            return Err(Error::Configuration(format!(
                "no devices found for platform `{}`",
                platform.name
            )));
        }

        let mut infos = platform.devices.clone();
        if let Some(limit) = device_limit {
            infos.truncate(limit);
        }
        infos.retain(|info| info.double_precision);

        if infos.is_empty() {
            return Err(Error::Configuration(format!(
                "no device of platform `{}` supports double precision",
                platform.name
            )));
        }

        let devices = infos
            .into_iter()
            .enumerate()
            .map(|(id, info)| Device::new(id, info))
            .collect::<Result<Vec<_>>>()?;
        let queues = devices
            .iter()
            .map(|device| Queue::new(device.id(), device.clone()))
            .collect::<Result<Vec<_>>>()?;

        info!(
            platform = %platform.name,
            devices = devices.len(),
            "compute context created"
        );

        Ok(Self {
            platform,
            devices,
            queues,
            cursor: Mutex::new(0),
            profiler: Profiler::default(),
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Builds the device code registered under `source` for every device.
    pub fn create_program(&self, source: &str) -> Result<Program> {
        let infos = self
            .devices
            .iter()
            .map(|d| d.info().clone())
            .collect::<Vec<_>>();

        let built = match kernels::source(source) {
            Some(source) => Program::build(&source, &infos),
            None => Err(Error::Compile {
                program: source.to_string(),
                logs: infos
                    .iter()
                    .map(|info| crate::error::BuildLog {
                        device: info.name.clone(),
                        log: format!("error: no program source named `{}`", source),
                    })
                    .collect(),
            }),
        };

        if let Err(Error::Compile { program, logs }) = &built {
            for log in logs {
                error!(program = %program, device = %log.device, "{}", log.log);
            }
        }
        built
    }

    pub fn create_buffer(&self, access: MemAccess, size: usize) -> Buffer {
        Buffer::new(access, size)
    }

    /// Next queue of the round-robin rotation.
    pub fn next_queue(&self) -> Queue {
        // a poisoned cursor still holds a valid index
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let queue = self.queues[*cursor].clone();
        *cursor = (*cursor + 1) % self.queues.len();
        queue
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn set_profiling(&self, enabled: bool) {
        self.profiler.set_enabled(enabled);
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiler.is_enabled()
    }

    /// Adds the execution time of `event` under every tag. Waits for the event.
    pub fn record_event(&self, tags: &[&str], event: &Event) -> Result<()> {
        if !self.profiling_enabled() {
            return Ok(());
        }
        event.wait()?;
        self.profiler
            .add(tags, event.elapsed().unwrap_or(Duration::ZERO))
    }

    pub fn record_time(&self, tags: &[&str], elapsed: Duration) -> Result<()> {
        self.profiler.add(tags, elapsed)
    }

    pub fn profile(&self) -> Result<BTreeMap<String, Duration>> {
        self.profiler.snapshot()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Platform")?;
        writeln!(f, "\tName   : {}", self.platform.name)?;
        writeln!(f, "\tVendor : {}", self.platform.vendor)?;
        writeln!(f, "\tVersion: {}", self.platform.version)?;
        writeln!(f)?;
        writeln!(f, "Devices")?;
        for device in &self.devices {
            let info = device.info();
            writeln!(f, "\tName               : {}", info.name)?;
            writeln!(f, "\tType               : {}", info.kind)?;
            writeln!(f, "\tVendor             : {}", info.vendor)?;
            writeln!(f, "\tGlobal Mem Size    : {} Mb", info.global_mem_size / (1024 * 1024))?;
            writeln!(f, "\tLocal Mem Size     : {} Kb", info.local_mem_size / 1024)?;
            writeln!(f, "\tMax Work Group Size: {}", info.max_work_group_size)?;
            writeln!(f, "\tMax Compute Units  : {}", info.compute_units)?;
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("platform", &self.platform.name)
            .field("devices", &self.devices)
            .finish()
    }
}
