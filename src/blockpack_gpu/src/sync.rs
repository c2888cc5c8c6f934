use std::time::{Duration, Instant};

use tracing::debug;

use crate::AcceleratorError;
use crate::backend::Backend;
use crate::context::AcceleratorContext;
use crate::state::DeviceBuffer;

/// Sleep between device polls while a bounded wait is pending.
pub(crate) const WAIT_POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Optional upper bound on a blocking wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    start: Instant,
    timeout: Option<Duration>,
}

impl Deadline {
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    pub fn expired(&self) -> bool {
        self.timeout
            .is_some_and(|timeout| self.start.elapsed() >= timeout)
    }

    pub fn hang(&self, target: u64) -> AcceleratorError {
        AcceleratorError::DeviceHang {
            target,
            timeout: self.timeout.unwrap_or_default(),
        }
    }
}

/// Closes the recording, submits it, signals the next counter value and blocks
/// until the device reports it. Returns the value that was reached.
///
/// Any failure past the close poisons the context: the device may still be
/// executing work that references buffers the caller is about to drop.
pub(crate) fn submit_and_wait<B: Backend>(
    context: &mut AcceleratorContext<B>,
) -> Result<u64, AcceleratorError> {
    context.close_commands()?;

    let value = context.next_signal_value();
    let timeout = context.wait_timeout();
    let waited = context
        .backend_mut()
        .submit(value)
        .and_then(|()| context.backend_mut().wait_for(value, timeout));
    if let Err(error) = waited {
        context.poison(&error);
        return Err(error);
    }

    debug!(value, "completion counter reached");
    Ok(value)
}

/// Copies `len` bytes out of readback staging. Only valid once the submission
/// that wrote it has been waited on.
pub(crate) fn read_back<B: Backend>(
    context: &mut AcceleratorContext<B>,
    readback: &DeviceBuffer<B::Buffer>,
    len: usize,
) -> Result<Vec<u8>, AcceleratorError> {
    let timeout = context.wait_timeout();
    let result = context
        .backend_mut()
        .read_mapped(readback.raw(), len, timeout);
    match result {
        Ok(bytes) if bytes.len() == len => Ok(bytes),
        Ok(bytes) => Err(AcceleratorError::Sync(format!(
            "readback returned {} bytes, expected {len}",
            bytes.len()
        ))),
        Err(error) => {
            context.poison(&error);
            Err(error)
        }
    }
}
