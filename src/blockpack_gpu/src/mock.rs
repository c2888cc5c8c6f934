use std::time::Duration;

use crate::AcceleratorError;
use crate::backend::{Backend, BufferDesc, ViewDesc};
use crate::layout::{KernelSource, SerializedLayout};
use crate::state::{Barrier, BufferRole};
use crate::sync::Deadline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    CreateBuffer { role: BufferRole, len: u64 },
    WriteMapped { len: usize },
    CreateKernel { bindings: usize, entry_point: String },
    CreateViewTable { input_elements: u32, output_elements: u32 },
    Reset,
    Barrier(Barrier),
    Copy { src: BufferRole, dst: BufferRole, len: u64 },
    Dispatch { groups: [u32; 3] },
    Close,
    Submit(u64),
    Wait(u64),
    ReadBack { len: usize },
}

#[derive(Debug)]
pub(crate) struct MockBuffer {
    id: usize,
    role: BufferRole,
}

#[derive(Debug)]
pub(crate) struct MockKernel;

#[derive(Debug)]
pub(crate) struct MockViewTable {
    input: usize,
    output: usize,
    input_elements: u32,
    output_elements: u32,
}

#[derive(Debug)]
enum Op {
    Copy { src: usize, dst: usize, len: usize },
    Dispatch { input: usize, output: usize, input_len: usize, output_len: usize },
}

/// Backend that logs every call and runs a stand-in kernel on host memory.
///
/// The stand-in writes `input[i % input_len] ^ (i as u8)` to every output byte,
/// which is enough to tell runs apart and to check determinism.
pub(crate) struct RecordingBackend {
    pub events: Vec<Event>,
    pub max_groups: u32,
    // 1-based index of the wait call that fails with a sync error.
    pub fail_wait_at: Option<usize>,
    // 1-based index of the wait call whose deadline runs out.
    pub hang_wait_at: Option<usize>,
    memory: Vec<Vec<u8>>,
    recording: Option<Vec<Op>>,
    closed: Option<Vec<Op>>,
    submitted: u64,
    completed: u64,
    waits: usize,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            max_groups: 65_535,
            fail_wait_at: None,
            hang_wait_at: None,
            memory: Vec::new(),
            recording: None,
            closed: None,
            submitted: 0,
            completed: 0,
            waits: 0,
        }
    }

    pub fn failing_wait(index: usize) -> Self {
        Self {
            fail_wait_at: Some(index),
            ..Self::new()
        }
    }

    pub fn hanging_wait(index: usize) -> Self {
        Self {
            hang_wait_at: Some(index),
            ..Self::new()
        }
    }

    fn record(&mut self, op: Op) -> Result<(), AcceleratorError> {
        self.recording
            .as_mut()
            .ok_or_else(|| AcceleratorError::Sync("mock recorder not open".to_string()))?
            .push(op);
        Ok(())
    }

    fn execute(&mut self, op: Op) {
        match op {
            Op::Copy { src, dst, len } => {
                let bytes = self.memory[src][..len].to_vec();
                self.memory[dst][..len].copy_from_slice(&bytes);
            }
            Op::Dispatch {
                input,
                output,
                input_len,
                output_len,
            } => {
                let source = self.memory[input][..input_len].to_vec();
                for (i, byte) in self.memory[output][..output_len].iter_mut().enumerate() {
                    *byte = source[i % source.len()] ^ (i as u8);
                }
            }
        }
    }
}

impl Backend for RecordingBackend {
    type Buffer = MockBuffer;
    type Kernel = MockKernel;
    type ViewTable = MockViewTable;

    fn describe(&self) -> String {
        "recording backend".to_string()
    }

    fn max_work_groups_per_dimension(&self) -> u32 {
        self.max_groups
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> Result<MockBuffer, AcceleratorError> {
        self.events.push(Event::CreateBuffer {
            role: desc.role,
            len: desc.len,
        });
        let len = usize::try_from(desc.len)
            .map_err(|_| AcceleratorError::Resource("mock buffer too large".to_string()))?;
        self.memory.push(vec![0; len]);
        Ok(MockBuffer {
            id: self.memory.len() - 1,
            role: desc.role,
        })
    }

    fn write_mapped(&mut self, buffer: &MockBuffer, bytes: &[u8]) -> Result<(), AcceleratorError> {
        if buffer.role != BufferRole::UploadStaging {
            return Err(AcceleratorError::Resource("not upload staging".to_string()));
        }
        self.events.push(Event::WriteMapped { len: bytes.len() });
        self.memory[buffer.id][..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn create_kernel(
        &mut self,
        layout: &SerializedLayout,
        _source: &KernelSource,
        entry_point: &str,
    ) -> Result<MockKernel, AcceleratorError> {
        self.events.push(Event::CreateKernel {
            bindings: layout.entries.len(),
            entry_point: entry_point.to_string(),
        });
        Ok(MockKernel)
    }

    fn create_view_table(
        &mut self,
        _kernel: &MockKernel,
        views: &[ViewDesc<'_, MockBuffer>; 2],
    ) -> Result<MockViewTable, AcceleratorError> {
        let [input, output] = views;
        self.events.push(Event::CreateViewTable {
            input_elements: input.element_count,
            output_elements: output.element_count,
        });
        Ok(MockViewTable {
            input: input.buffer.id,
            output: output.buffer.id,
            input_elements: input.element_count,
            output_elements: output.element_count,
        })
    }

    fn reset_commands(&mut self) -> Result<(), AcceleratorError> {
        self.events.push(Event::Reset);
        self.closed = None;
        self.recording = Some(Vec::new());
        Ok(())
    }

    fn record_barrier(
        &mut self,
        _buffer: &MockBuffer,
        barrier: Barrier,
    ) -> Result<(), AcceleratorError> {
        self.events.push(Event::Barrier(barrier));
        Ok(())
    }

    fn record_copy(
        &mut self,
        src: &MockBuffer,
        dst: &MockBuffer,
        len: u64,
    ) -> Result<(), AcceleratorError> {
        self.events.push(Event::Copy {
            src: src.role,
            dst: dst.role,
            len,
        });
        self.record(Op::Copy {
            src: src.id,
            dst: dst.id,
            len: len as usize,
        })
    }

    fn record_dispatch(
        &mut self,
        _kernel: &MockKernel,
        table: &MockViewTable,
        groups: [u32; 3],
    ) -> Result<(), AcceleratorError> {
        self.events.push(Event::Dispatch { groups });
        self.record(Op::Dispatch {
            input: table.input,
            output: table.output,
            input_len: table.input_elements as usize * 4,
            output_len: table.output_elements as usize * 4,
        })
    }

    fn close_commands(&mut self) -> Result<(), AcceleratorError> {
        self.events.push(Event::Close);
        let ops = self
            .recording
            .take()
            .ok_or_else(|| AcceleratorError::Sync("mock recorder not open".to_string()))?;
        self.closed = Some(ops);
        Ok(())
    }

    fn submit(&mut self, signal_value: u64) -> Result<(), AcceleratorError> {
        self.events.push(Event::Submit(signal_value));
        let ops = self
            .closed
            .take()
            .ok_or_else(|| AcceleratorError::Sync("nothing closed".to_string()))?;
        for op in ops {
            self.execute(op);
        }
        self.submitted = signal_value;
        Ok(())
    }

    fn wait_for(&mut self, value: u64, timeout: Option<Duration>) -> Result<(), AcceleratorError> {
        self.events.push(Event::Wait(value));
        self.waits += 1;
        if self.fail_wait_at == Some(self.waits) {
            return Err(AcceleratorError::Sync("injected wait failure".to_string()));
        }
        if self.hang_wait_at == Some(self.waits) {
            return Err(Deadline::after(timeout).hang(value));
        }
        if value > self.submitted {
            return Err(AcceleratorError::Sync("value never signaled".to_string()));
        }
        self.completed = self.completed.max(value);
        Ok(())
    }

    fn read_mapped(
        &mut self,
        buffer: &MockBuffer,
        len: usize,
        _timeout: Option<Duration>,
    ) -> Result<Vec<u8>, AcceleratorError> {
        if self.completed < self.submitted {
            return Err(AcceleratorError::Sync(
                "readback before the completion counter caught up".to_string(),
            ));
        }
        if buffer.role != BufferRole::ReadbackStaging {
            return Err(AcceleratorError::Resource("not readback staging".to_string()));
        }
        self.events.push(Event::ReadBack { len });
        Ok(self.memory[buffer.id][..len].to_vec())
    }
}
