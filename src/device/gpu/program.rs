//! Thin wrapper around `ocl`: device discovery, program compilation and
//! typed buffers with blocking reads/writes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgramError {
    #[error("OclCore Error: {0}")]
    OclCoreError(#[from] ocl::OclCoreError),
    #[error("Ocl Error: {0}")]
    OclError(#[from] ocl::Error),
    #[error("no OpenCL GPU device found")]
    NoDevice,
}

#[derive(Debug, Clone)]
pub struct Device {
    vendor: String,
    name: String,
    platform: ocl::Platform,
    device: ocl::Device,
}

impl Device {
    pub fn vendor(&self) -> &str {
        &self.vendor
    }
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every GPU device across every platform, with its vendor/name strings.
    pub fn all() -> Vec<Device> {
        let mut found = Vec::new();
        for platform in ocl::Platform::list() {
            let devices = match ocl::Device::list(platform, Some(ocl::flags::DEVICE_TYPE_GPU)) {
                Ok(devices) => devices,
                Err(_) => continue,
            };
            for device in devices {
                let vendor = device.vendor().unwrap_or_default();
                let name = device.name().unwrap_or_default();
                found.push(Device {
                    vendor,
                    name,
                    platform,
                    device,
                });
            }
        }
        found
    }

    /// First device whose vendor or name contains `preferred` (case
    /// insensitive), or the first device at all when no preference is given.
    pub fn select(preferred: Option<&str>) -> Result<Device, ProgramError> {
        let all = Self::all();
        match preferred {
            Some(pref) => {
                let pref = pref.to_uppercase();
                all.into_iter()
                    .find(|d| {
                        d.vendor.to_uppercase().contains(&pref)
                            || d.name.to_uppercase().contains(&pref)
                    })
                    .ok_or(ProgramError::NoDevice)
            }
            None => all.into_iter().next().ok_or(ProgramError::NoDevice),
        }
    }
}

pub struct Program {
    program: ocl::Program,
    queue: ocl::Queue,
}

impl Program {
    pub fn from_opencl(device: &Device, src: &str) -> Result<Program, ProgramError> {
        let context = ocl::Context::builder().platform(device.platform).build()?;
        let program = ocl::Program::builder()
            .src(src)
            .devices(ocl::builders::DeviceSpecifier::Single(device.device))
            .build(&context)?;
        let queue = ocl::Queue::new(&context, device.device, None)?;
        Ok(Program { program, queue })
    }

    pub fn create_buffer<T>(&self, length: usize) -> Result<Buffer<T>, ProgramError> {
        assert!(length > 0);
        let buffer = ocl::Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .flags(ocl::MemFlags::new().read_write())
            .len(length * std::mem::size_of::<T>())
            .build()?;
        Ok(Buffer::<T> {
            buffer,
            _phantom: std::marker::PhantomData,
        })
    }

    pub fn create_buffer_from_slice<T>(&self, vals: &[T]) -> Result<Buffer<T>, ProgramError> {
        let mut buf = self.create_buffer::<T>(vals.len())?;
        buf.write_from(vals)?;
        Ok(buf)
    }

    pub fn create_kernel(&self, name: &str, gws: usize) -> Kernel<'_> {
        let mut builder = ocl::Kernel::builder();
        builder.name(name);
        builder.program(&self.program);
        builder.queue(self.queue.clone());
        builder.global_work_size([gws]);
        Kernel::<'_> { builder }
    }

    /// Blocks until everything enqueued so far has finished.
    pub fn finish(&self) -> Result<(), ProgramError> {
        self.queue.finish()?;
        Ok(())
    }
}

pub struct Buffer<T> {
    buffer: ocl::Buffer<u8>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> Buffer<T> {
    pub fn length(&self) -> usize {
        self.buffer.len() / std::mem::size_of::<T>()
    }

    pub fn write_from(&mut self, data: &[T]) -> Result<(), ProgramError> {
        assert!(data.len() <= self.length());
        self.buffer
            .write(unsafe {
                std::slice::from_raw_parts(
                    data.as_ptr() as *const u8,
                    data.len() * std::mem::size_of::<T>(),
                )
            })
            .enq()?;
        Ok(())
    }

    pub fn read_into(&self, data: &mut [T]) -> Result<(), ProgramError> {
        assert!(data.len() <= self.length());
        self.buffer
            .read(unsafe {
                std::slice::from_raw_parts_mut(
                    data.as_mut_ptr() as *mut u8,
                    data.len() * std::mem::size_of::<T>(),
                )
            })
            .enq()?;
        Ok(())
    }
}

pub trait KernelArgument<'a> {
    fn push(&self, kernel: &mut Kernel<'a>);
}

impl<'a, T> KernelArgument<'a> for &'a Buffer<T> {
    fn push(&self, kernel: &mut Kernel<'a>) {
        kernel.builder.arg(&self.buffer);
    }
}

impl<T: ocl::OclPrm> KernelArgument<'_> for T {
    fn push(&self, kernel: &mut Kernel) {
        kernel.builder.arg(*self);
    }
}

pub struct Kernel<'a> {
    builder: ocl::builders::KernelBuilder<'a>,
}

impl<'a> Kernel<'a> {
    pub fn arg<T: KernelArgument<'a>>(mut self, t: T) -> Self {
        t.push(&mut self);
        self
    }
    pub fn run(self) -> Result<(), ProgramError> {
        let kern = self.builder.build()?;
        unsafe {
            kern.enq()?;
        }
        Ok(())
    }
}
