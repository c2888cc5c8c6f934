use blockpack::ContainerHeader;
use tracing::debug;

use crate::AcceleratorError;
use crate::backend::Backend;
use crate::context::AcceleratorContext;
use crate::layout::ComputeKernel;
use crate::state::{DeviceBuffer, ResourceState};
use crate::views::ViewTable;

pub const DEFAULT_WORK_GROUPS: u32 = 1024;

/// How many work groups one decompression dispatch launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchGrid {
    /// Constant grid regardless of input; the kernel is expected to bound
    /// itself by the block table.
    Fixed(u32),
    /// One group per LOD block.
    PerLodBlock,
    /// Enough groups that each covers `bytes_per_group` output bytes.
    PerOutputBytes { bytes_per_group: u32 },
}

impl Default for DispatchGrid {
    fn default() -> Self {
        Self::Fixed(DEFAULT_WORK_GROUPS)
    }
}

impl DispatchGrid {
    pub fn resolve(
        self,
        header: &ContainerHeader,
        max_per_dimension: u32,
    ) -> Result<[u32; 3], AcceleratorError> {
        let x = match self {
            Self::Fixed(groups) => groups,
            Self::PerLodBlock => header.lod_block_count,
            Self::PerOutputBytes { bytes_per_group } => {
                if bytes_per_group == 0 {
                    return Err(AcceleratorError::InvalidOptions(
                        "bytes_per_group must be non-zero",
                    ));
                }
                header.raw_decompressed_size.div_ceil(bytes_per_group)
            }
        };
        if x == 0 {
            return Err(AcceleratorError::InvalidOptions(
                "dispatch grid resolves to zero work groups",
            ));
        }
        if x > max_per_dimension {
            return Err(AcceleratorError::InvalidOptions(
                "dispatch grid exceeds the device work-group limit",
            ));
        }
        Ok([x, 1, 1])
    }
}

/// Records the decompression dispatch and the copy of its result into
/// readback staging, with the output barriers around both.
pub(crate) fn record_decompression<B: Backend>(
    context: &mut AcceleratorContext<B>,
    kernel: &ComputeKernel<B>,
    table: &ViewTable<B>,
    output: &mut DeviceBuffer<B::Buffer>,
    readback: &DeviceBuffer<B::Buffer>,
    groups: [u32; 3],
) -> Result<(), AcceleratorError> {
    context.transition(output, ResourceState::UnorderedAccess)?;
    context.dispatch(kernel.raw(), table.raw(), groups)?;

    context.transition(output, ResourceState::CopySource)?;
    context.copy(output, readback, output.len())?;
    // Leaves the output ready for another dispatch.
    context.transition(output, ResourceState::UnorderedAccess)?;

    debug!(
        groups = groups[0],
        input_words = table.input_elements(),
        output_words = table.output_elements(),
        "dispatch recorded"
    );
    Ok(())
}
