use std::time::Duration;

use tracing::{debug, warn};

use crate::AcceleratorError;
use crate::backend::{Backend, BufferDesc};
use crate::state::{BufferRole, DeviceBuffer, ResourceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Discrete,
    Integrated,
    Virtual,
    Software,
    Other,
}

/// Capabilities of one adapter, as seen by an [`AdapterSelector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterCandidate {
    pub name: String,
    pub backend: String,
    pub class: DeviceClass,
    pub supports_compute: bool,
    pub max_storage_buffer_binding_size: u64,
}

/// Device selection strategy: `None` rejects a candidate, otherwise the
/// highest rank wins. Equal ranks go to the larger storage binding limit, then
/// to the earliest candidate.
pub trait AdapterSelector {
    fn rank(&self, candidate: &AdapterCandidate) -> Option<u32>;
}

/// Prefers discrete over integrated over virtual hardware. Software
/// rasterizers are only considered when explicitly allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferDiscrete {
    pub allow_software: bool,
}

impl AdapterSelector for PreferDiscrete {
    fn rank(&self, candidate: &AdapterCandidate) -> Option<u32> {
        if !candidate.supports_compute {
            return None;
        }
        match candidate.class {
            DeviceClass::Discrete => Some(4),
            DeviceClass::Integrated => Some(3),
            DeviceClass::Virtual => Some(2),
            DeviceClass::Other => Some(1),
            DeviceClass::Software if self.allow_software => Some(0),
            DeviceClass::Software => None,
        }
    }
}

pub fn select_adapter(
    candidates: &[AdapterCandidate],
    selector: &dyn AdapterSelector,
) -> Result<usize, AcceleratorError> {
    let mut best: Option<(usize, u32)> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        let Some(rank) = selector.rank(candidate) else {
            debug!(adapter = %candidate.name, "adapter rejected by selector");
            continue;
        };
        let better = best.is_none_or(|(best_index, best_rank)| {
            let best_binding = candidates[best_index].max_storage_buffer_binding_size;
            (rank, candidate.max_storage_buffer_binding_size) > (best_rank, best_binding)
        });
        if better {
            best = Some((index, rank));
        }
    }
    best.map(|(index, _)| index).ok_or_else(|| {
        AcceleratorError::Setup(format!(
            "no compatible compute adapter among {} candidate(s)",
            candidates.len()
        ))
    })
}

/// Host-side view of the device fence: the last value handed out for a
/// submission. Values only ever increase for the lifetime of the context.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    last_signaled: u64,
}

impl CompletionCounter {
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled
    }

    fn next_value(&mut self) -> u64 {
        self.last_signaled += 1;
        self.last_signaled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecorderState {
    Idle,
    Recording,
}

/// Accelerator context: one device, one queue, one recorder, one counter.
pub struct AcceleratorContext<B: Backend> {
    backend: B,
    counter: CompletionCounter,
    recorder: RecorderState,
    wait_timeout: Option<Duration>,
    poisoned: bool,
}

impl<B: Backend> AcceleratorContext<B> {
    pub fn new(backend: B, wait_timeout: Option<Duration>) -> Self {
        debug!(adapter = %backend.describe(), "accelerator context ready");
        Self {
            backend,
            counter: CompletionCounter::default(),
            recorder: RecorderState::Idle,
            wait_timeout,
            poisoned: false,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn counter(&self) -> &CompletionCounter {
        &self.counter
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    /// True once a synchronization failure left the device in an unknown state.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) fn ensure_usable(&self) -> Result<(), AcceleratorError> {
        if self.poisoned {
            return Err(AcceleratorError::Setup(
                "accelerator context is poisoned by an earlier sync failure; recreate it"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn allocate(
        &mut self,
        role: BufferRole,
        len: u64,
    ) -> Result<DeviceBuffer<B::Buffer>, AcceleratorError> {
        let raw = self.backend.create_buffer(&BufferDesc { role, len })?;
        Ok(DeviceBuffer::new(raw, role, len))
    }

    pub(crate) fn begin_commands(&mut self) -> Result<(), AcceleratorError> {
        self.ensure_usable()?;
        self.backend.reset_commands()?;
        self.recorder = RecorderState::Recording;
        Ok(())
    }

    fn ensure_recording(&self) -> Result<(), AcceleratorError> {
        if self.recorder != RecorderState::Recording {
            return Err(AcceleratorError::Sync("command recorder is not open".to_string()));
        }
        Ok(())
    }

    /// Records the barrier for `buffer` moving to `next`.
    pub(crate) fn transition(
        &mut self,
        buffer: &mut DeviceBuffer<B::Buffer>,
        next: ResourceState,
    ) -> Result<(), AcceleratorError> {
        self.ensure_recording()?;
        let barrier = buffer.transition(next)?;
        self.backend.record_barrier(buffer.raw(), barrier)
    }

    pub(crate) fn copy(
        &mut self,
        src: &DeviceBuffer<B::Buffer>,
        dst: &DeviceBuffer<B::Buffer>,
        len: u64,
    ) -> Result<(), AcceleratorError> {
        self.ensure_recording()?;
        self.backend.record_copy(src.raw(), dst.raw(), len)
    }

    pub(crate) fn dispatch(
        &mut self,
        kernel: &B::Kernel,
        table: &B::ViewTable,
        groups: [u32; 3],
    ) -> Result<(), AcceleratorError> {
        self.ensure_recording()?;
        self.backend.record_dispatch(kernel, table, groups)
    }

    /// Closes the open recording. Submission goes through [`crate::sync`].
    pub(crate) fn close_commands(&mut self) -> Result<(), AcceleratorError> {
        self.ensure_recording()?;
        self.recorder = RecorderState::Idle;
        self.backend.close_commands()
    }

    pub(crate) fn next_signal_value(&mut self) -> u64 {
        self.counter.next_value()
    }

    pub(crate) fn poison(&mut self, error: &AcceleratorError) {
        if error.requires_context_recreation() {
            warn!(%error, "accelerator context poisoned");
            self.poisoned = true;
        }
    }
}
