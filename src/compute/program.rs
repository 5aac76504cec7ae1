use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use super::buffer::{Buffer, BufferRead, BufferWrite};
use super::platform::DeviceInfo;
use crate::error::{BuildLog, Error, Result};

/// Declared kind of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Global buffer the kernel only reads.
    Input,
    /// Global buffer the kernel writes.
    Output,
    /// Per-work-group scratch, sized in bytes at launch.
    Local,
    Int,
    Float,
    Double,
}

#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(Buffer),
    Local(usize),
    Int(i32),
    Float(f32),
    Double(f64),
}

impl KernelArg {
    fn kind(&self) -> &'static str {
        match self {
            KernelArg::Buffer(_) => "buffer",
            KernelArg::Local(_) => "local",
            KernelArg::Int(_) => "int",
            KernelArg::Float(_) => "float",
            KernelArg::Double(_) => "double",
        }
    }
}

impl From<&Buffer> for KernelArg {
    fn from(value: &Buffer) -> Self {
        KernelArg::Buffer(value.clone())
    }
}

impl From<i32> for KernelArg {
    fn from(value: i32) -> Self {
        KernelArg::Int(value)
    }
}

impl From<f32> for KernelArg {
    fn from(value: f32) -> Self {
        KernelArg::Float(value)
    }
}

impl From<f64> for KernelArg {
    fn from(value: f64) -> Self {
        KernelArg::Double(value)
    }
}

/// Global and optional local work sizes, one or two dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: [usize; 2],
    pub local: Option<[usize; 2]>,
}

impl NdRange {
    pub fn linear(global: usize) -> Self {
        Self {
            global: [global, 1],
            local: None,
        }
    }

    pub fn grouped(global: usize, local: usize) -> Self {
        Self {
            global: [global, 1],
            local: Some([local, 1]),
        }
    }

    pub fn grouped_2d(global: [usize; 2], local: [usize; 2]) -> Self {
        Self {
            global,
            local: Some(local),
        }
    }

    pub fn global_size(&self) -> usize {
        self.global[0] * self.global[1]
    }

    pub fn local_size(&self) -> [usize; 2] {
        self.local.unwrap_or([1, 1])
    }

    pub fn group_count(&self) -> [usize; 2] {
        let local = self.local_size();
        [self.global[0] / local[0], self.global[1] / local[1]]
    }
}

pub type KernelBody = fn(&Launch<'_>) -> Result<()>;

/// Device-side entry point: a name, its parameter list and the code.
#[derive(Clone, Copy)]
pub struct KernelDef {
    pub name: &'static str,
    pub params: &'static [Param],
    pub body: KernelBody,
}

impl KernelDef {
    fn uses_local_memory(&self) -> bool {
        self.params.contains(&Param::Local)
    }

    fn uses_double(&self) -> bool {
        self.params.contains(&Param::Double)
    }
}

/// Device code registered under a source identifier.
#[derive(Clone, Copy)]
pub struct ProgramSource {
    pub name: &'static str,
    pub kernels: &'static [KernelDef],
    /// Source needs double precision even without double parameters.
    pub requires_double: bool,
}

impl ProgramSource {
    /// Checks the source against one device and returns the build log on failure.
    pub(crate) fn build_for(&self, device: &DeviceInfo) -> std::result::Result<(), String> {
        let mut problems = Vec::new();
        if (self.requires_double || self.kernels.iter().any(KernelDef::uses_double))
            && !device.double_precision
        {
            problems.push("error: double precision floating point is not supported".to_string());
        }
        for kernel in self.kernels.iter().filter(|k| k.uses_local_memory()) {
            if device.local_mem_size == 0 {
                problems.push(format!(
                    "error: kernel `{}` declares local memory but the device has none",
                    kernel.name
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("\n"))
        }
    }
}

struct ProgramInner {
    name: String,
    kernels: HashMap<&'static str, KernelDef>,
}

/// A built program. Cheap to clone and shareable across workers.
#[derive(Clone)]
pub struct Program {
    inner: Arc<ProgramInner>,
}

impl Program {
    pub(crate) fn build(source: &ProgramSource, devices: &[DeviceInfo]) -> Result<Self> {
        let logs = devices
            .iter()
            .map(|device| (device, source.build_for(device)))
            .collect::<Vec<_>>();

        if logs.iter().any(|(_, result)| result.is_err()) {
            let logs = logs
                .into_iter()
                .map(|(device, result)| BuildLog {
                    device: device.name.clone(),
                    log: result.err().unwrap_or_else(|| "build succeeded".to_string()),
                })
                .collect();
            return Err(Error::Compile {
                program: source.name.to_string(),
                logs,
            });
        }

        Ok(Self {
            inner: Arc::new(ProgramInner {
                name: source.name.to_string(),
                kernels: source.kernels.iter().map(|k| (k.name, *k)).collect(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kernel(&self, name: &str) -> Result<Kernel> {
        self.inner
            .kernels
            .get(name)
            .map(|def| Kernel { def: *def })
            .ok_or_else(|| {
                Error::DeviceRuntime(format!(
                    "program `{}` has no kernel named `{}`",
                    self.inner.name, name
                ))
            })
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.inner.kernels.keys().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("Program")
            .field("name", &self.inner.name)
            .field("kernels", &names)
            .finish()
    }
}

#[derive(Clone, Copy)]
pub struct Kernel {
    def: KernelDef,
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        self.def.name
    }

    /// Checks a launch against the kernel signature and the device limits.
    pub(crate) fn validate(
        &self,
        args: &[KernelArg],
        range: &NdRange,
        device: &DeviceInfo,
    ) -> Result<()> {
        let name = self.def.name;
        if args.len() != self.def.params.len() {
            return Err(Error::DeviceRuntime(format!(
                "kernel `{}` takes {} arguments, {} given",
                name,
                self.def.params.len(),
                args.len()
            )));
        }

        let mut local_bytes = 0;
        for (index, (param, arg)) in self.def.params.iter().zip(args).enumerate() {
            let matches = match (param, arg) {
                (Param::Input | Param::Output, KernelArg::Buffer(_)) => true,
                (Param::Local, KernelArg::Local(bytes)) => {
                    local_bytes += bytes;
                    true
                }
                (Param::Int, KernelArg::Int(_)) => true,
                (Param::Float, KernelArg::Float(_)) => true,
                (Param::Double, KernelArg::Double(_)) => true,
                _ => false,
            };
            if !matches {
                return Err(Error::DeviceRuntime(format!(
                    "kernel `{}` argument {} expects {:?}, got {}",
                    name,
                    index,
                    param,
                    arg.kind()
                )));
            }

            if let (Param::Output, KernelArg::Buffer(buffer)) = (param, arg) {
                if !buffer.access().kernel_writable() {
                    return Err(Error::DeviceRuntime(format!(
                        "kernel `{}` writes argument {} but the buffer is read-only",
                        name, index
                    )));
                }
                let aliased = args.iter().enumerate().any(|(other, arg)| {
                    other != index
                        && matches!(arg, KernelArg::Buffer(b) if b.same_storage(buffer))
                });
                if aliased {
                    return Err(Error::DeviceRuntime(format!(
                        "kernel `{}` output argument {} aliases another buffer argument",
                        name, index
                    )));
                }
            }
        }

        let local = range.local_size();
        if local[0] == 0 || local[1] == 0 {
            return Err(Error::DeviceRuntime(format!(
                "kernel `{}` launched with an empty work-group",
                name
            )));
        }
        if range.global[0] % local[0] != 0 || range.global[1] % local[1] != 0 {
            return Err(Error::DeviceRuntime(format!(
                "kernel `{}`: local range {:?} does not divide global range {:?}",
                name, local, range.global
            )));
        }
        if local[0] * local[1] > device.max_work_group_size {
            return Err(Error::DeviceRuntime(format!(
                "kernel `{}`: work-group of {} items exceeds the device limit of {}",
                name,
                local[0] * local[1],
                device.max_work_group_size
            )));
        }
        if local_bytes > device.local_mem_size {
            return Err(Error::DeviceRuntime(format!(
                "kernel `{}` requests {} bytes of local memory, device has {}",
                name, local_bytes, device.local_mem_size
            )));
        }

        Ok(())
    }

    pub(crate) fn run(&self, launch: &Launch<'_>) -> Result<()> {
        (self.def.body)(launch)
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("name", &self.def.name).finish()
    }
}

/// What a kernel body sees: its arguments, launch geometry and device.
pub struct Launch<'a> {
    pub(crate) kernel: &'static str,
    pub(crate) args: &'a [KernelArg],
    pub range: NdRange,
    pub device: &'a DeviceInfo,
}

impl<'a> Launch<'a> {
    fn arg(&self, index: usize) -> Result<&'a KernelArg> {
        self.args.get(index).ok_or_else(|| {
            Error::DeviceRuntime(format!(
                "kernel `{}` has no argument {}",
                self.kernel, index
            ))
        })
    }

    fn buffer(&self, index: usize) -> Result<&'a Buffer> {
        match self.arg(index)? {
            KernelArg::Buffer(buffer) => Ok(buffer),
            other => Err(self.mismatch(index, "buffer", other)),
        }
    }

    fn mismatch(&self, index: usize, expected: &str, got: &KernelArg) -> Error {
        Error::DeviceRuntime(format!(
            "kernel `{}` argument {} is {}, expected {}",
            self.kernel,
            index,
            got.kind(),
            expected
        ))
    }

    pub fn read<T: Pod>(&self, index: usize) -> Result<BufferRead<'a, T>> {
        self.buffer(index)?.read()
    }

    pub fn write<T: Pod>(&self, index: usize) -> Result<BufferWrite<'a, T>> {
        self.buffer(index)?.write()
    }

    /// Number of `T` elements that fit in a local-memory argument.
    pub fn local_len<T>(&self, index: usize) -> Result<usize> {
        match self.arg(index)? {
            KernelArg::Local(bytes) => Ok(bytes / std::mem::size_of::<T>().max(1)),
            other => Err(self.mismatch(index, "local", other)),
        }
    }

    pub fn int(&self, index: usize) -> Result<i32> {
        match self.arg(index)? {
            KernelArg::Int(value) => Ok(*value),
            other => Err(self.mismatch(index, "int", other)),
        }
    }

    /// Non-negative int argument used as a count or size.
    pub fn count(&self, index: usize) -> Result<usize> {
        let value = self.int(index)?;
        usize::try_from(value).map_err(|_| {
            Error::DeviceRuntime(format!(
                "kernel `{}` argument {} must be non-negative, got {}",
                self.kernel, index, value
            ))
        })
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match self.arg(index)? {
            KernelArg::Float(value) => Ok(*value),
            other => Err(self.mismatch(index, "float", other)),
        }
    }

    pub fn double(&self, index: usize) -> Result<f64> {
        match self.arg(index)? {
            KernelArg::Double(value) => Ok(*value),
            other => Err(self.mismatch(index, "double", other)),
        }
    }

    /// Fails the kernel when `needed` elements do not fit in `available`.
    pub fn check_bounds(&self, what: &str, needed: usize, available: usize) -> Result<()> {
        if needed > available {
            return Err(Error::DeviceRuntime(format!(
                "kernel `{}`: {} needs {} elements, buffer holds {}",
                self.kernel, what, needed, available
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::compute::buffer::MemAccess;
    use crate::compute::platform::DeviceInfo;

    use super::*;

    fn noop(_: &Launch<'_>) -> Result<()> {
        Ok(())
    }

    const KERNELS: &[KernelDef] = &[KernelDef {
        name: "Scale",
        params: &[Param::Input, Param::Local, Param::Int, Param::Output],
        body: noop,
    }];

    const SOURCE: ProgramSource = ProgramSource {
        name: "test",
        kernels: KERNELS,
        requires_double: false,
    };

    fn args(input: &Buffer, output: &Buffer) -> Vec<KernelArg> {
        vec![
            input.into(),
            KernelArg::Local(64),
            4i32.into(),
            output.into(),
        ]
    }

    #[test]
    fn launch_validation() {
        let device = DeviceInfo::gpu("gpu", 2).with_max_work_group_size(64);
        let program = Program::build(&SOURCE, &[device.clone()]).unwrap();
        let kernel = program.kernel("Scale").unwrap();

        let input = Buffer::new(MemAccess::ReadOnly, 16);
        let output = Buffer::new(MemAccess::WriteOnly, 16);
        let range = NdRange::grouped(128, 64);

        assert!(kernel.validate(&args(&input, &output), &range, &device).is_ok());

        // wrong arity
        assert!(kernel.validate(&args(&input, &output)[..3], &range, &device).is_err());
        // writes a read-only buffer
        assert!(kernel.validate(&args(&output, &input), &range, &device).is_err());
        // aliasing output
        assert!(kernel.validate(&args(&output, &output), &range, &device).is_err());
        // local range does not divide
        assert!(kernel
            .validate(&args(&input, &output), &NdRange::grouped(100, 64), &device)
            .is_err());
        // oversized work-group
        assert!(kernel
            .validate(&args(&input, &output), &NdRange::grouped(256, 128), &device)
            .is_err());

        assert!(matches!(program.kernel("Missing"), Err(Error::DeviceRuntime(_))));
    }

    #[test]
    fn build_logs_every_device() {
        let good = DeviceInfo::gpu("good", 1);
        let bad = DeviceInfo::gpu("bad", 1).with_local_mem_size(0);
        let Err(Error::Compile { program, logs }) = Program::build(&SOURCE, &[good, bad]) else {
            panic!("build should fail");
        };
        assert_eq!(program, "test");
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].device, "good");
        assert!(logs[1].log.contains("local memory"));
    }
}
