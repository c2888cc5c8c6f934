use tracing::debug;

use crate::AcceleratorError;
use crate::backend::Backend;
use crate::context::AcceleratorContext;
use crate::state::{BufferRole, DeviceBuffer, ResourceState};

/// Upload staging and the device-local input it was copied into.
///
/// The staging buffer has to stay alive until the upload submission completes.
pub(crate) struct StagedInput<R> {
    pub upload: DeviceBuffer<R>,
    pub input: DeviceBuffer<R>,
}

/// Writes `bytes` into fresh upload staging and records the copy into a
/// device-local input buffer, leaving the input `GenericReadable`.
///
/// Lengths are validated by the caller before anything is allocated.
pub(crate) fn stage_input<B: Backend>(
    context: &mut AcceleratorContext<B>,
    bytes: &[u8],
) -> Result<StagedInput<B::Buffer>, AcceleratorError> {
    let len = u64::try_from(bytes.len())
        .map_err(|_| AcceleratorError::Resource("input too large".to_string()))?;

    let upload = context.allocate(BufferRole::UploadStaging, len)?;
    let mut input = context.allocate(BufferRole::DeviceInput, len)?;

    context.backend_mut().write_mapped(upload.raw(), bytes)?;

    context.transition(&mut input, ResourceState::CopyDestination)?;
    context.copy(&upload, &input, len)?;
    context.transition(&mut input, ResourceState::GenericReadable)?;

    debug!(bytes = len, "input staged");
    Ok(StagedInput { upload, input })
}
