use std::borrow::Cow;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::AcceleratorError;
use crate::backend::{Backend, BufferDesc, ViewDesc};
use crate::context::{AdapterCandidate, AdapterSelector, DeviceClass, select_adapter};
use crate::layout::{KernelSource, SerializedLayout};
use crate::state::{Barrier, BufferRole, ResourceState};
use crate::sync::{Deadline, WAIT_POLL_INTERVAL};

pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    role: BufferRole,
    host_mapped: Cell<bool>,
}

pub struct WgpuKernel {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

pub struct WgpuViewTable {
    bind_group: wgpu::BindGroup,
}

/// `wgpu` device, queue and the single command recorder.
///
/// `wgpu` derives pipeline barriers from how each command uses a buffer, so
/// recorded transitions are checked against the buffer's usage flags rather
/// than forwarded. The completion counter is fed by
/// `Queue::on_submitted_work_done`, which fires from `Device::poll`.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    encoder: Option<wgpu::CommandEncoder>,
    closed: Option<wgpu::CommandBuffer>,
    completed: Arc<AtomicU64>,
    last_signaled: u64,
}

struct UnmapOnDrop<'a>(&'a wgpu::Buffer);

impl Drop for UnmapOnDrop<'_> {
    fn drop(&mut self) {
        self.0.unmap();
    }
}

fn describe_adapter(adapter: &wgpu::Adapter) -> AdapterCandidate {
    let info = adapter.get_info();
    let class = match info.device_type {
        wgpu::DeviceType::DiscreteGpu => DeviceClass::Discrete,
        wgpu::DeviceType::IntegratedGpu => DeviceClass::Integrated,
        wgpu::DeviceType::VirtualGpu => DeviceClass::Virtual,
        wgpu::DeviceType::Cpu => DeviceClass::Software,
        wgpu::DeviceType::Other => DeviceClass::Other,
    };
    AdapterCandidate {
        name: info.name,
        backend: format!("{:?}", info.backend),
        class,
        supports_compute: adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
        max_storage_buffer_binding_size: u64::from(
            adapter.limits().max_storage_buffer_binding_size,
        ),
    }
}

fn usage_for_role(role: BufferRole) -> wgpu::BufferUsages {
    match role {
        BufferRole::UploadStaging => wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
        BufferRole::DeviceInput => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        BufferRole::DeviceOutput => wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        BufferRole::ReadbackStaging => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
    }
}

fn usage_for_state(state: ResourceState) -> wgpu::BufferUsages {
    match state {
        ResourceState::Common => wgpu::BufferUsages::empty(),
        ResourceState::CopyDestination => wgpu::BufferUsages::COPY_DST,
        ResourceState::CopySource => wgpu::BufferUsages::COPY_SRC,
        ResourceState::GenericReadable | ResourceState::UnorderedAccess => {
            wgpu::BufferUsages::STORAGE
        }
    }
}

impl WgpuBackend {
    pub fn new(validation: bool, selector: &dyn AdapterSelector) -> Result<Self, AcceleratorError> {
        let flags = if validation {
            wgpu::InstanceFlags::DEBUG | wgpu::InstanceFlags::VALIDATION
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let candidates: Vec<AdapterCandidate> = adapters.iter().map(describe_adapter).collect();
        let index = select_adapter(&candidates, selector)?;
        let adapter = adapters
            .into_iter()
            .nth(index)
            .ok_or_else(|| AcceleratorError::Setup("selected adapter vanished".to_string()))?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("blockpack-gpu-device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
            },
            None,
        ))
        .map_err(|e| AcceleratorError::Setup(format!("request_device failed: {e}")))?;
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            error!(error = %e, "uncaptured wgpu error");
        }));

        debug!(
            adapter = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            validation,
            "wgpu device created"
        );
        Ok(Self {
            device,
            queue,
            info,
            limits,
            encoder: None,
            closed: None,
            completed: Arc::new(AtomicU64::new(0)),
            last_signaled: 0,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }

    /// Runs `build` inside validation and out-of-memory error scopes and maps
    /// whatever the device reports through `map_err`, diagnostic text intact.
    fn checked<T>(
        &self,
        map_err: fn(String) -> AcceleratorError,
        build: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T, AcceleratorError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let value = build(&self.device);
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        let validation = pollster::block_on(self.device.pop_error_scope());
        match out_of_memory.or(validation) {
            Some(e) => Err(map_err(e.to_string())),
            None => Ok(value),
        }
    }

    fn open_encoder(&mut self) -> Result<&mut wgpu::CommandEncoder, AcceleratorError> {
        self.encoder
            .as_mut()
            .ok_or_else(|| AcceleratorError::Sync("no open command recording".to_string()))
    }

    fn poll_once(&self, timeout: Option<Duration>) {
        if timeout.is_none() {
            let _ = self.device.poll(wgpu::Maintain::Wait);
        } else {
            let _ = self.device.poll(wgpu::Maintain::Poll);
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

impl Backend for WgpuBackend {
    type Buffer = WgpuBuffer;
    type Kernel = WgpuKernel;
    type ViewTable = WgpuViewTable;

    fn describe(&self) -> String {
        format!(
            "{} ({:?}, {:?})",
            self.info.name, self.info.backend, self.info.device_type
        )
    }

    fn max_work_groups_per_dimension(&self) -> u32 {
        self.limits.max_compute_workgroups_per_dimension
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<WgpuBuffer, AcceleratorError> {
        if desc.len == 0 {
            return Err(AcceleratorError::Resource(format!(
                "{} must not be empty",
                desc.role.label()
            )));
        }
        if desc.len > self.limits.max_buffer_size {
            return Err(AcceleratorError::Resource(format!(
                "{} of {} bytes exceeds max_buffer_size {}",
                desc.role.label(),
                desc.len,
                self.limits.max_buffer_size
            )));
        }
        let bound_as_view = matches!(desc.role, BufferRole::DeviceInput | BufferRole::DeviceOutput);
        let max_binding = u64::from(self.limits.max_storage_buffer_binding_size);
        if bound_as_view && desc.len > max_binding {
            return Err(AcceleratorError::Resource(format!(
                "{} of {} bytes exceeds max_storage_buffer_binding_size {max_binding}",
                desc.role.label(),
                desc.len
            )));
        }

        let mapped_at_creation = desc.role == BufferRole::UploadStaging;
        let buffer = self.checked(AcceleratorError::Resource, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.role.label()),
                size: desc.len,
                usage: usage_for_role(desc.role),
                mapped_at_creation,
            })
        })?;
        Ok(WgpuBuffer {
            buffer,
            role: desc.role,
            host_mapped: Cell::new(mapped_at_creation),
        })
    }

    fn write_mapped(&mut self, buffer: &WgpuBuffer, bytes: &[u8]) -> Result<(), AcceleratorError> {
        if buffer.role != BufferRole::UploadStaging || !buffer.host_mapped.get() {
            return Err(AcceleratorError::Resource(format!(
                "{} is not host-mapped for writing",
                buffer.role.label()
            )));
        }
        buffer.host_mapped.set(false);

        let _unmap = UnmapOnDrop(&buffer.buffer);
        let mut view = buffer.buffer.slice(..).get_mapped_range_mut();
        let dst = view.get_mut(..bytes.len()).ok_or_else(|| {
            AcceleratorError::Resource("upload staging is smaller than the input".to_string())
        })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn create_kernel(
        &mut self,
        layout: &SerializedLayout,
        source: &KernelSource,
        entry_point: &str,
    ) -> Result<WgpuKernel, AcceleratorError> {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = layout
            .entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: entry.read_only,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let bind_group_layout = self.checked(AcceleratorError::Layout, |device| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("blockpack-views-bgl"),
                entries: &entries,
            })
        })?;
        let pipeline_layout = self.checked(AcceleratorError::Layout, |device| {
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("blockpack-kernel-pl"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            })
        })?;

        let shader_source = match source {
            KernelSource::SpirV(words) => {
                wgpu::ShaderSource::SpirV(Cow::Borrowed(words.as_slice()))
            }
            KernelSource::Wgsl(text) => wgpu::ShaderSource::Wgsl(Cow::Borrowed(text.as_str())),
        };
        let module = self.checked(AcceleratorError::Setup, |device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("blockpack-kernel"),
                source: shader_source,
            })
        })?;
        let pipeline = self.checked(AcceleratorError::Setup, |device| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("blockpack-kernel-cp"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point,
            })
        })?;

        Ok(WgpuKernel {
            pipeline,
            bind_group_layout,
        })
    }

    fn create_view_table(
        &mut self,
        kernel: &WgpuKernel,
        views: &[ViewDesc<'_, WgpuBuffer>; 2],
    ) -> Result<WgpuViewTable, AcceleratorError> {
        let mut entries = Vec::with_capacity(views.len());
        for (binding, view) in (0_u32..).zip(views.iter()) {
            let size = wgpu::BufferSize::new(u64::from(view.element_count) * 4).ok_or_else(|| {
                AcceleratorError::Resource(format!("view {binding} has no elements"))
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &view.buffer.buffer,
                    offset: u64::from(view.first_element) * 4,
                    size: Some(size),
                }),
            });
        }

        let bind_group = self.checked(AcceleratorError::Resource, |device| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("blockpack-view-table"),
                layout: &kernel.bind_group_layout,
                entries: &entries,
            })
        })?;
        Ok(WgpuViewTable { bind_group })
    }

    fn reset_commands(&mut self) -> Result<(), AcceleratorError> {
        self.closed = None;
        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("blockpack-commands"),
                }),
        );
        Ok(())
    }

    fn record_barrier(
        &mut self,
        buffer: &WgpuBuffer,
        barrier: Barrier,
    ) -> Result<(), AcceleratorError> {
        self.open_encoder()?;
        let required = usage_for_state(barrier.after);
        if !buffer.buffer.usage().contains(required) {
            return Err(AcceleratorError::Resource(format!(
                "{} lacks usage {required:?} for state {:?}",
                buffer.role.label(),
                barrier.after
            )));
        }
        trace!(
            role = ?barrier.role,
            before = ?barrier.before,
            after = ?barrier.after,
            "barrier"
        );
        Ok(())
    }

    fn record_copy(
        &mut self,
        src: &WgpuBuffer,
        dst: &WgpuBuffer,
        len: u64,
    ) -> Result<(), AcceleratorError> {
        let encoder = self.open_encoder()?;
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, len);
        Ok(())
    }

    fn record_dispatch(
        &mut self,
        kernel: &WgpuKernel,
        table: &WgpuViewTable,
        groups: [u32; 3],
    ) -> Result<(), AcceleratorError> {
        let encoder = self.open_encoder()?;
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("blockpack-decompress-pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &table.bind_group, &[]);
        pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        Ok(())
    }

    fn close_commands(&mut self) -> Result<(), AcceleratorError> {
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| AcceleratorError::Sync("no open command recording".to_string()))?;
        let commands = self.checked(AcceleratorError::Sync, |_| encoder.finish())?;
        self.closed = Some(commands);
        Ok(())
    }

    fn submit(&mut self, signal_value: u64) -> Result<(), AcceleratorError> {
        if signal_value <= self.last_signaled {
            return Err(AcceleratorError::Sync(format!(
                "signal value {signal_value} does not advance past {}",
                self.last_signaled
            )));
        }
        let commands = self
            .closed
            .take()
            .ok_or_else(|| AcceleratorError::Sync("nothing closed to submit".to_string()))?;

        self.queue.submit(Some(commands));
        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(signal_value, Ordering::AcqRel);
        });
        self.last_signaled = signal_value;
        trace!(signal_value, "submitted");
        Ok(())
    }

    fn wait_for(&mut self, value: u64, timeout: Option<Duration>) -> Result<(), AcceleratorError> {
        if value > self.last_signaled {
            return Err(AcceleratorError::Sync(format!(
                "waiting for {value}, but only {} was signaled",
                self.last_signaled
            )));
        }
        let deadline = Deadline::after(timeout);
        loop {
            if self.completed.load(Ordering::Acquire) >= value {
                return Ok(());
            }
            if deadline.expired() {
                warn!(value, ?timeout, "device did not reach completion value");
                return Err(deadline.hang(value));
            }
            self.poll_once(timeout);
        }
    }

    fn read_mapped(
        &mut self,
        buffer: &WgpuBuffer,
        len: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, AcceleratorError> {
        if buffer.role != BufferRole::ReadbackStaging {
            return Err(AcceleratorError::Resource(format!(
                "{} is not host-readable",
                buffer.role.label()
            )));
        }
        let len_bytes = u64::try_from(len)
            .map_err(|_| AcceleratorError::Resource("readback length overflow".to_string()))?;
        if len_bytes == 0 || len_bytes > buffer.buffer.size() {
            return Err(AcceleratorError::Resource(format!(
                "readback of {len} bytes does not fit a {} byte buffer",
                buffer.buffer.size()
            )));
        }

        let slice = buffer.buffer.slice(..len_bytes);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        let deadline = Deadline::after(timeout);
        let map_result = loop {
            match rx.try_recv() {
                Ok(result) => break result,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(AcceleratorError::Sync(
                        "readback map_async completion channel disconnected".to_string(),
                    ));
                }
            }
            if deadline.expired() {
                warn!(?timeout, "readback mapping did not complete");
                return Err(deadline.hang(self.last_signaled));
            }
            self.poll_once(timeout);
        };
        map_result.map_err(|e| AcceleratorError::Sync(format!("readback map_async failed: {e}")))?;

        let _unmap = UnmapOnDrop(&buffer.buffer);
        let mapped = slice.get_mapped_range();
        Ok(mapped.to_vec())
    }
}
