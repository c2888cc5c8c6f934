use std::time::Instant;

use blockpack::ContainerHeader;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::context::AcceleratorContext;
use crate::dispatch::{self, DispatchGrid};
use crate::layout::ComputeKernel;
use crate::state::{BufferRole, raw_element_count};
use crate::{
    AcceleratorError, DecompressStats, DecompressedOutput, elapsed_ms, sync, transfer, views,
};

/// Runs one container through the accelerator.
///
/// Every buffer and the view table belong to this call and are released when
/// it returns, whichever way it returns.
pub(crate) fn run<B: Backend>(
    context: &mut AcceleratorContext<B>,
    kernel: &ComputeKernel<B>,
    grid: DispatchGrid,
    container: &[u8],
) -> Result<DecompressedOutput, AcceleratorError> {
    let total_start = Instant::now();
    context.ensure_usable()?;

    let header = ContainerHeader::parse(container)?;
    if header.raw_decompressed_size == 0 {
        return Err(AcceleratorError::Resource(
            "container declares an empty decompressed size".to_string(),
        ));
    }
    let input_len = u64::try_from(container.len())
        .map_err(|_| AcceleratorError::Resource("input too large".to_string()))?;
    raw_element_count("input", input_len)?;
    raw_element_count("output", u64::from(header.raw_decompressed_size))?;
    let groups = grid.resolve(&header, context.backend().max_work_groups_per_dimension())?;
    debug!(
        input_bytes = input_len,
        output_bytes = header.raw_decompressed_size,
        lod_blocks = header.lod_block_count,
        "container accepted"
    );

    let upload_start = Instant::now();
    context.begin_commands()?;
    let staged = transfer::stage_input(context, container)?;
    let mut output = views::allocate_output(context, header.raw_decompressed_size)?;
    let table = views::create_view_table(context, kernel, &staged.input, &output)?;
    sync::submit_and_wait(context)?;
    drop(staged.upload);
    let upload_ms = elapsed_ms(upload_start);

    let dispatch_start = Instant::now();
    let readback = context.allocate(BufferRole::ReadbackStaging, output.len())?;
    context.begin_commands()?;
    dispatch::record_decompression(context, kernel, &table, &mut output, &readback, groups)?;
    sync::submit_and_wait(context)?;
    let dispatch_wait_ms = elapsed_ms(dispatch_start);

    let readback_start = Instant::now();
    let bytes = sync::read_back(context, &readback, header.raw_decompressed_len())?;
    let readback_ms = elapsed_ms(readback_start);

    let stats = DecompressStats {
        input_bytes: input_len,
        output_bytes: u64::from(header.raw_decompressed_size),
        work_groups: groups[0],
        upload_ms,
        dispatch_wait_ms,
        readback_ms,
        total_ms: elapsed_ms(total_start),
    };
    info!(
        took_ms = stats.dispatch_wait_ms,
        total_ms = stats.total_ms,
        output_bytes = stats.output_bytes,
        "container decompressed"
    );
    Ok(DecompressedOutput { bytes, stats })
}
