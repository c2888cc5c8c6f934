//! Device seam.
//!
//! The pipeline modules drive a [`Backend`] and never touch a concrete device
//! API. [`crate::WgpuBackend`] is the production implementation; the unit tests
//! use a recording backend that logs every call in order.

use std::time::Duration;

use crate::AcceleratorError;
use crate::layout::{KernelSource, SerializedLayout, ViewAccess};
use crate::state::{Barrier, BufferRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub role: BufferRole,
    pub len: u64,
}

/// One entry of a view table.
#[derive(Debug)]
pub struct ViewDesc<'a, R> {
    pub buffer: &'a R,
    pub access: ViewAccess,
    pub first_element: u32,
    pub element_count: u32,
}

pub trait Backend {
    type Buffer;
    type Kernel;
    type ViewTable;

    /// Short adapter description for diagnostics.
    fn describe(&self) -> String;

    /// Largest work-group count accepted in one dispatch dimension.
    fn max_work_groups_per_dimension(&self) -> u32;

    /// Allocates a buffer in the heap its role implies. Upload staging buffers
    /// come back host-mapped and ready for [`Backend::write_mapped`].
    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<Self::Buffer, AcceleratorError>;

    /// Copies `bytes` into a mapped upload staging buffer and unmaps it.
    fn write_mapped(
        &mut self,
        buffer: &Self::Buffer,
        bytes: &[u8],
    ) -> Result<(), AcceleratorError>;

    fn create_kernel(
        &mut self,
        layout: &SerializedLayout,
        source: &KernelSource,
        entry_point: &str,
    ) -> Result<Self::Kernel, AcceleratorError>;

    fn create_view_table(
        &mut self,
        kernel: &Self::Kernel,
        views: &[ViewDesc<'_, Self::Buffer>; 2],
    ) -> Result<Self::ViewTable, AcceleratorError>;

    /// Discards anything recorded so far and opens the recorder again.
    fn reset_commands(&mut self) -> Result<(), AcceleratorError>;

    fn record_barrier(
        &mut self,
        buffer: &Self::Buffer,
        barrier: Barrier,
    ) -> Result<(), AcceleratorError>;

    fn record_copy(
        &mut self,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        len: u64,
    ) -> Result<(), AcceleratorError>;

    fn record_dispatch(
        &mut self,
        kernel: &Self::Kernel,
        table: &Self::ViewTable,
        groups: [u32; 3],
    ) -> Result<(), AcceleratorError>;

    fn close_commands(&mut self) -> Result<(), AcceleratorError>;

    /// Submits the closed recording and arranges for the completion counter to
    /// reach `signal_value` once the device has finished it.
    fn submit(&mut self, signal_value: u64) -> Result<(), AcceleratorError>;

    /// Blocks until the completion counter reaches `value`. `None` waits forever.
    fn wait_for(&mut self, value: u64, timeout: Option<Duration>) -> Result<(), AcceleratorError>;

    /// Maps a readback staging buffer and copies its first `len` bytes out.
    fn read_mapped(
        &mut self,
        buffer: &Self::Buffer,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, AcceleratorError>;
}
