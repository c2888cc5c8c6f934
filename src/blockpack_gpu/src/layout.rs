//! Binding layout and kernel loading.
//!
//! The decompression kernel sees exactly two raw views, both from the compute
//! stage only:
//!
//! * binding 0: the uploaded container, read-only `array<u32>`
//! * binding 1: the decompressed output, read/write `array<u32>`
//!
//! Building a [`ComputeKernel`] only loads the kernel against this layout. It
//! says nothing about whether the kernel decompresses correctly.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::AcceleratorError;
use crate::backend::Backend;
use crate::context::AcceleratorContext;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewAccess {
    RawRead,
    RawReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableParameter {
    pub slot: u32,
    pub access: ViewAccess,
    pub visibility: ShaderStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayout {
    parameters: Vec<TableParameter>,
    denied_stages: Vec<ShaderStage>,
}

/// Validated, backend-neutral form of a [`BindingLayout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedLayout {
    pub entries: Vec<LayoutEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub binding: u32,
    pub read_only: bool,
}

impl BindingLayout {
    pub fn new(parameters: Vec<TableParameter>, denied_stages: Vec<ShaderStage>) -> Self {
        Self {
            parameters,
            denied_stages,
        }
    }

    /// The two-view layout the decompression kernel is compiled against.
    pub fn decompression() -> Self {
        Self::new(
            vec![
                TableParameter {
                    slot: 0,
                    access: ViewAccess::RawRead,
                    visibility: ShaderStage::Compute,
                },
                TableParameter {
                    slot: 1,
                    access: ViewAccess::RawReadWrite,
                    visibility: ShaderStage::Compute,
                },
            ],
            vec![ShaderStage::Vertex, ShaderStage::Fragment],
        )
    }

    pub fn parameters(&self) -> &[TableParameter] {
        &self.parameters
    }

    pub fn denied_stages(&self) -> &[ShaderStage] {
        &self.denied_stages
    }

    pub fn serialize(&self) -> Result<SerializedLayout, AcceleratorError> {
        if self.parameters.is_empty() {
            return Err(AcceleratorError::Layout("layout declares no parameters".to_string()));
        }
        if self.denied_stages.contains(&ShaderStage::Compute) {
            return Err(AcceleratorError::Layout(
                "compute stage cannot be denied root access".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(self.parameters.len());
        for (index, parameter) in self.parameters.iter().enumerate() {
            if parameter.slot as usize != index {
                return Err(AcceleratorError::Layout(format!(
                    "parameter {index} uses slot {}; slots must be contiguous from 0",
                    parameter.slot
                )));
            }
            if parameter.visibility != ShaderStage::Compute {
                return Err(AcceleratorError::Layout(format!(
                    "parameter {index} is visible to {:?}; only the compute stage may bind views",
                    parameter.visibility
                )));
            }
            entries.push(LayoutEntry {
                binding: parameter.slot,
                read_only: parameter.access == ViewAccess::RawRead,
            });
        }
        Ok(SerializedLayout { entries })
    }
}

/// Compiled kernel program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelSource {
    SpirV(Vec<u32>),
    Wgsl(String),
}

impl KernelSource {
    pub fn from_spirv_bytes(bytes: &[u8]) -> Result<Self, AcceleratorError> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(AcceleratorError::Setup(format!(
                "spir-v module length {} is not a positive multiple of 4",
                bytes.len()
            )));
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        if words[0] != SPIRV_MAGIC {
            return Err(AcceleratorError::Setup(format!(
                "bad spir-v magic {:#010x}",
                words[0]
            )));
        }
        Ok(Self::SpirV(words))
    }

    /// Loads `.spv` modules as SPIR-V and `.wgsl` files as WGSL source.
    pub fn load(path: &Path) -> Result<Self, AcceleratorError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("spv") => Self::from_spirv_bytes(&fs::read(path)?),
            Some("wgsl") => Ok(Self::Wgsl(fs::read_to_string(path)?)),
            _ => Err(AcceleratorError::Setup(format!(
                "unrecognized kernel file {} (expected .spv or .wgsl)",
                path.display()
            ))),
        }
    }
}

/// Executable pipeline object: kernel bound to the decompression layout.
pub struct ComputeKernel<B: Backend> {
    raw: B::Kernel,
    layout: SerializedLayout,
    entry_point: String,
}

impl<B: Backend> ComputeKernel<B> {
    pub fn build(
        context: &mut AcceleratorContext<B>,
        source: &KernelSource,
        entry_point: &str,
    ) -> Result<Self, AcceleratorError> {
        context.ensure_usable()?;
        let layout = BindingLayout::decompression().serialize()?;
        let raw = context
            .backend_mut()
            .create_kernel(&layout, source, entry_point)?;
        debug!(entry_point, "compute kernel loaded");
        Ok(Self {
            raw,
            layout,
            entry_point: entry_point.to_string(),
        })
    }

    pub fn raw(&self) -> &B::Kernel {
        &self.raw
    }

    pub fn layout(&self) -> &SerializedLayout {
        &self.layout
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }
}
