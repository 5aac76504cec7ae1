use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu => write!(f, "GPU"),
        }
    }
}

/// Static description of a compute device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    pub compute_units: usize,
    pub max_work_group_size: usize,
    /// Bytes of work-group local memory.
    pub local_mem_size: usize,
    pub global_mem_size: u64,
    pub double_precision: bool,
}

impl DeviceInfo {
    pub fn cpu(name: &str, compute_units: usize) -> Self {
        Self {
            name: name.to_string(),
            vendor: HOST_VENDOR.to_string(),
            kind: DeviceKind::Cpu,
            compute_units: compute_units.max(1),
            max_work_group_size: 8192,
            local_mem_size: 32 * 1024,
            global_mem_size: 4 << 30,
            double_precision: true,
        }
    }

    pub fn gpu(name: &str, compute_units: usize) -> Self {
        Self {
            name: name.to_string(),
            vendor: HOST_VENDOR.to_string(),
            kind: DeviceKind::Gpu,
            compute_units: compute_units.max(1),
            max_work_group_size: 1024,
            local_mem_size: 48 * 1024,
            global_mem_size: 2 << 30,
            double_precision: true,
        }
    }

    pub fn with_double_precision(mut self, supported: bool) -> Self {
        self.double_precision = supported;
        self
    }

    pub fn with_local_mem_size(mut self, bytes: usize) -> Self {
        self.local_mem_size = bytes;
        self
    }

    pub fn with_max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }
}

const HOST_VENDOR: &str = "krigrid host runtime";

/// A named set of devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub devices: Vec<DeviceInfo>,
}

impl Platform {
    pub fn new(name: &str, devices: Vec<DeviceInfo>) -> Self {
        Self {
            name: name.to_string(),
            vendor: HOST_VENDOR.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            devices,
        }
    }

    /// Platforms available on this host.
    ///
    /// Index 0 runs kernels as coarse blocks on one CPU-class device. Index 1
    /// exposes two GPU-class devices that execute work-groups against emulated
    /// local memory, splitting the host cores between them.
    pub fn all() -> Vec<Platform> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let half = (cores / 2).max(1);

        vec![
            Platform::new("Host CPU", vec![DeviceInfo::cpu("host-cpu", cores)]),
            Platform::new(
                "Host SIMT",
                vec![
                    DeviceInfo::gpu("host-simt-0", half),
                    DeviceInfo::gpu("host-simt-1", half),
                ],
            ),
        ]
    }
}

struct DeviceInner {
    id: usize,
    info: DeviceInfo,
    pool: rayon::ThreadPool,
}

/// A device admitted into a context, with the threads that execute its kernels.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub(crate) fn new(id: usize, info: DeviceInfo) -> Result<Self> {
        let name = info.name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(info.compute_units)
            .thread_name(move |i| format!("{}-cu{}", name, i))
            .build()?;
        Ok(Self {
            inner: Arc::new(DeviceInner { id, info, pool }),
        })
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.inner.info.kind
    }

    pub fn compute_units(&self) -> usize {
        self.inner.info.compute_units
    }

    /// Run `op` on the device's compute units.
    pub(crate) fn execute<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.inner.pool.install(op)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("info", &self.inner.info)
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}
