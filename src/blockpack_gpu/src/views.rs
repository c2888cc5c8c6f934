use crate::AcceleratorError;
use crate::backend::{Backend, ViewDesc};
use crate::context::AcceleratorContext;
use crate::layout::{ComputeKernel, ViewAccess};
use crate::state::{BufferRole, DeviceBuffer, raw_element_count};

/// Slot 0: read-only raw view over the input. Slot 1: read/write raw view over the output.
pub(crate) struct ViewTable<B: Backend> {
    raw: B::ViewTable,
    input_elements: u32,
    output_elements: u32,
}

impl<B: Backend> ViewTable<B> {
    pub fn raw(&self) -> &B::ViewTable {
        &self.raw
    }

    pub fn input_elements(&self) -> u32 {
        self.input_elements
    }

    pub fn output_elements(&self) -> u32 {
        self.output_elements
    }
}

/// Allocates the device-local output buffer. Its length is the header's
/// decompressed size as stored, never derived from the compressed length.
pub(crate) fn allocate_output<B: Backend>(
    context: &mut AcceleratorContext<B>,
    raw_decompressed_size: u32,
) -> Result<DeviceBuffer<B::Buffer>, AcceleratorError> {
    context.allocate(BufferRole::DeviceOutput, u64::from(raw_decompressed_size))
}

pub(crate) fn create_view_table<B: Backend>(
    context: &mut AcceleratorContext<B>,
    kernel: &ComputeKernel<B>,
    input: &DeviceBuffer<B::Buffer>,
    output: &DeviceBuffer<B::Buffer>,
) -> Result<ViewTable<B>, AcceleratorError> {
    let input_elements = raw_element_count("input", input.len())?;
    let output_elements = raw_element_count("output", output.len())?;

    let views = [
        ViewDesc {
            buffer: input.raw(),
            access: ViewAccess::RawRead,
            first_element: 0,
            element_count: input_elements,
        },
        ViewDesc {
            buffer: output.raw(),
            access: ViewAccess::RawReadWrite,
            first_element: 0,
            element_count: output_elements,
        },
    ];
    let raw = context
        .backend_mut()
        .create_view_table(kernel.raw(), &views)?;

    Ok(ViewTable {
        raw,
        input_elements,
        output_elements,
    })
}
