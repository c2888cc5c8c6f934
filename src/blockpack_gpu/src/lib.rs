//! Accelerator-offloaded decompression of blockpack containers.
//!
//! The host never decompresses anything. It uploads the whole container,
//! binds it next to an output buffer sized from the header, launches an
//! externally compiled kernel once, and reads the result back after the
//! completion counter says the device is done:
//!
//! 1. [`context`] picks the device and owns the queue, recorder and counter.
//! 2. [`layout`] loads the kernel against the two-view binding layout.
//! 3. [`transfer`] stages host bytes into device-local input.
//! 4. [`views`] allocates the output and the view table.
//! 5. [`dispatch`] records the dispatch and the copy-out barriers.
//! 6. [`sync`] submits, waits on the counter and reads back.
//!
//! [`Decompressor`] wraps all of it; [`GpuDecompressor`] is the `wgpu` flavour.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use blockpack::ContainerError;
use thiserror::Error;
use tracing::info;

pub mod backend;
pub mod context;
pub mod dispatch;
mod gpu;
pub mod layout;
mod pipeline;
pub mod state;
mod sync;
mod transfer;
mod views;

#[cfg(test)]
mod mock;

pub use backend::{Backend, BufferDesc, ViewDesc};
pub use context::{
    AcceleratorContext, AdapterCandidate, AdapterSelector, CompletionCounter, DeviceClass,
    PreferDiscrete, select_adapter,
};
pub use dispatch::{DEFAULT_WORK_GROUPS, DispatchGrid};
pub use gpu::{WgpuBackend, WgpuBuffer, WgpuKernel, WgpuViewTable};
pub use layout::{BindingLayout, ComputeKernel, KernelSource, ShaderStage, ViewAccess};
pub use state::{Barrier, BufferRole, DeviceBuffer, ResourceState};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ENTRY_POINT: &str = "main";
const DEFAULT_BYTES_PER_GROUP: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum AcceleratorError {
    #[error("setup error: {0}")]
    Setup(String),
    #[error("binding layout error: {0}")]
    Layout(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error("sync error: {0}")]
    Sync(String),
    #[error("device hang: completion value {target} not reached within {timeout:?}")]
    DeviceHang { target: u64, timeout: Duration },
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error(transparent)]
    InvalidContainer(#[from] ContainerError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcceleratorError {
    /// Whether the accelerator context has to be rebuilt before retrying.
    pub fn requires_context_recreation(&self) -> bool {
        matches!(self, Self::Setup(_) | Self::Sync(_) | Self::DeviceHang { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DecompressOptions {
    pub grid: DispatchGrid,
    // None waits forever.
    pub wait_timeout: Option<Duration>,
    // Backend validation and debug labels.
    pub validation: bool,
    pub entry_point: String,
    pub allow_software_adapter: bool,
}

impl Default for DecompressOptions {
    fn default() -> Self {
        Self {
            grid: DispatchGrid::default(),
            wait_timeout: Some(DEFAULT_WAIT_TIMEOUT),
            validation: cfg!(debug_assertions),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            allow_software_adapter: false,
        }
    }
}

impl DecompressOptions {
    /// Defaults overridden by `BLOCKPACK_GPU_*` environment variables.
    pub fn from_env() -> Result<Self, AcceleratorError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`DecompressOptions::from_env`], reading variables through `get`.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AcceleratorError> {
        let mut options = Self::default();

        let work_groups = lookup_u32(&get, "BLOCKPACK_GPU_WORK_GROUPS")?;
        let bytes_per_group = lookup_u32(&get, "BLOCKPACK_GPU_BYTES_PER_GROUP")?;
        options.grid = match get("BLOCKPACK_GPU_GRID").as_deref() {
            None | Some("fixed") => {
                if bytes_per_group.is_some() {
                    return Err(AcceleratorError::InvalidOptions(
                        "BLOCKPACK_GPU_BYTES_PER_GROUP needs BLOCKPACK_GPU_GRID=bytes",
                    ));
                }
                DispatchGrid::Fixed(work_groups.unwrap_or(DEFAULT_WORK_GROUPS))
            }
            Some("lod" | "bytes") if work_groups.is_some() => {
                return Err(AcceleratorError::InvalidOptions(
                    "BLOCKPACK_GPU_WORK_GROUPS needs BLOCKPACK_GPU_GRID=fixed",
                ));
            }
            Some("lod") if bytes_per_group.is_some() => {
                return Err(AcceleratorError::InvalidOptions(
                    "BLOCKPACK_GPU_BYTES_PER_GROUP needs BLOCKPACK_GPU_GRID=bytes",
                ));
            }
            Some("lod") => DispatchGrid::PerLodBlock,
            Some("bytes") => DispatchGrid::PerOutputBytes {
                bytes_per_group: bytes_per_group.unwrap_or(DEFAULT_BYTES_PER_GROUP),
            },
            Some(_) => {
                return Err(AcceleratorError::InvalidOptions(
                    "BLOCKPACK_GPU_GRID must be fixed, lod or bytes",
                ));
            }
        };
        if let Some(ms) = lookup_u32(&get, "BLOCKPACK_GPU_WAIT_TIMEOUT_MS")? {
            options.wait_timeout = (ms != 0).then(|| Duration::from_millis(u64::from(ms)));
        }
        if let Some(validation) = get("BLOCKPACK_GPU_VALIDATION") {
            options.validation = parse_flag(&validation);
        }
        if let Some(entry_point) = get("BLOCKPACK_GPU_ENTRY_POINT") {
            options.entry_point = entry_point;
        }
        if let Some(allow) = get("BLOCKPACK_GPU_ALLOW_SOFTWARE") {
            options.allow_software_adapter = parse_flag(&allow);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), AcceleratorError> {
        if self.entry_point.is_empty() {
            return Err(AcceleratorError::InvalidOptions("entry_point must not be empty"));
        }
        if self.wait_timeout == Some(Duration::ZERO) {
            return Err(AcceleratorError::InvalidOptions(
                "wait_timeout must be non-zero; use None to wait indefinitely",
            ));
        }
        match self.grid {
            DispatchGrid::Fixed(0) => Err(AcceleratorError::InvalidOptions(
                "fixed grid needs at least one work group",
            )),
            DispatchGrid::PerOutputBytes { bytes_per_group: 0 } => Err(
                AcceleratorError::InvalidOptions("bytes_per_group must be non-zero"),
            ),
            _ => Ok(()),
        }
    }
}

pub(crate) fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn lookup_u32(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<u32>, AcceleratorError> {
    get(name)
        .map(|value| value.trim().parse::<u32>())
        .transpose()
        .map_err(|_| {
            AcceleratorError::InvalidOptions("numeric BLOCKPACK_GPU_* variable is not a u32")
        })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecompressStats {
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub work_groups: u32,
    pub upload_ms: f64,
    pub dispatch_wait_ms: f64,
    pub readback_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone)]
pub struct DecompressedOutput {
    pub bytes: Vec<u8>,
    pub stats: DecompressStats,
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Context plus a loaded kernel, ready to take containers one at a time.
pub struct Decompressor<B: Backend> {
    context: AcceleratorContext<B>,
    kernel: ComputeKernel<B>,
    grid: DispatchGrid,
}

pub type GpuDecompressor = Decompressor<WgpuBackend>;

impl<B: Backend> Decompressor<B> {
    pub fn with_backend(
        backend: B,
        kernel: &KernelSource,
        options: &DecompressOptions,
    ) -> Result<Self, AcceleratorError> {
        options.validate()?;
        let mut context = AcceleratorContext::new(backend, options.wait_timeout);
        let kernel = ComputeKernel::build(&mut context, kernel, &options.entry_point)?;
        Ok(Self {
            context,
            kernel,
            grid: options.grid,
        })
    }

    /// Decompressed bytes of `container`, exactly `rawDecompressedSize` long.
    pub fn decompress(&mut self, container: &[u8]) -> Result<Vec<u8>, AcceleratorError> {
        self.decompress_with_stats(container).map(|out| out.bytes)
    }

    pub fn decompress_with_stats(
        &mut self,
        container: &[u8],
    ) -> Result<DecompressedOutput, AcceleratorError> {
        pipeline::run(&mut self.context, &self.kernel, self.grid, container)
    }

    /// Reads a container from `input`, decompresses it and writes the result to
    /// `output`. Nothing is written when decompression fails.
    pub fn decompress_file(
        &mut self,
        input: &Path,
        output: &Path,
    ) -> Result<DecompressStats, AcceleratorError> {
        let container = fs::read(input)?;
        let decompressed = self.decompress_with_stats(&container)?;
        fs::write(output, &decompressed.bytes)?;
        info!(
            input = %input.display(),
            output = %output.display(),
            bytes = decompressed.bytes.len(),
            "wrote decompressed output"
        );
        Ok(decompressed.stats)
    }

    pub fn context(&self) -> &AcceleratorContext<B> {
        &self.context
    }

    pub fn kernel(&self) -> &ComputeKernel<B> {
        &self.kernel
    }
}

impl GpuDecompressor {
    /// Picks an adapter with [`PreferDiscrete`] and loads `kernel` on it.
    pub fn new(
        kernel: &KernelSource,
        options: &DecompressOptions,
    ) -> Result<Self, AcceleratorError> {
        let selector = PreferDiscrete {
            allow_software: options.allow_software_adapter,
        };
        Self::with_selector(kernel, options, &selector)
    }

    pub fn with_selector(
        kernel: &KernelSource,
        options: &DecompressOptions,
        selector: &dyn AdapterSelector,
    ) -> Result<Self, AcceleratorError> {
        let backend = WgpuBackend::new(options.validation, selector)?;
        Self::with_backend(backend, kernel, options)
    }
}
