use super::AcceleratorError;

/// Access mode the device tracks for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    CopyDestination,
    CopySource,
    GenericReadable,
    UnorderedAccess,
}

/// What a buffer is used for within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// Host-writable, device-readable source of the upload copy.
    UploadStaging,
    /// Device-local copy of the container, bound as the read-only raw view.
    DeviceInput,
    /// Device-local result, bound as the read/write raw view.
    DeviceOutput,
    /// Device-writable, host-readable destination of the copy-out.
    ReadbackStaging,
}

impl BufferRole {
    /// State a freshly allocated buffer of this role starts in.
    pub fn initial_state(self) -> ResourceState {
        match self {
            Self::UploadStaging => ResourceState::GenericReadable,
            Self::DeviceInput | Self::DeviceOutput => ResourceState::Common,
            Self::ReadbackStaging => ResourceState::CopyDestination,
        }
    }

    /// Transitions a buffer of this role may go through. Staging buffers never move.
    fn allows(self, from: ResourceState, to: ResourceState) -> bool {
        use ResourceState::*;
        match self {
            Self::DeviceInput => matches!(
                (from, to),
                (Common, CopyDestination) | (CopyDestination, GenericReadable)
            ),
            Self::DeviceOutput => matches!(
                (from, to),
                (Common, UnorderedAccess)
                    | (UnorderedAccess, CopySource)
                    | (CopySource, UnorderedAccess)
            ),
            Self::UploadStaging | Self::ReadbackStaging => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::UploadStaging => "blockpack-upload-staging",
            Self::DeviceInput => "blockpack-device-input",
            Self::DeviceOutput => "blockpack-device-output",
            Self::ReadbackStaging => "blockpack-readback-staging",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub role: BufferRole,
    pub before: ResourceState,
    pub after: ResourceState,
}

/// A backend buffer together with its role, length and tracked state.
///
/// Owns the backend handle, so the device memory is released when this value
/// is dropped, on success and error paths alike.
#[derive(Debug)]
pub struct DeviceBuffer<R> {
    raw: R,
    role: BufferRole,
    len: u64,
    state: ResourceState,
}

impl<R> DeviceBuffer<R> {
    pub(crate) fn new(raw: R, role: BufferRole, len: u64) -> Self {
        Self {
            raw,
            role,
            len,
            state: role.initial_state(),
        }
    }

    pub fn raw(&self) -> &R {
        &self.raw
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    /// Moves the tracked state and returns the barrier that has to be recorded
    /// before the operation depending on `next`.
    pub(crate) fn transition(&mut self, next: ResourceState) -> Result<Barrier, AcceleratorError> {
        if !self.role.allows(self.state, next) {
            return Err(AcceleratorError::Resource(format!(
                "illegal transition for {}: {:?} -> {:?}",
                self.role.label(),
                self.state,
                next
            )));
        }
        let barrier = Barrier {
            role: self.role,
            before: self.state,
            after: next,
        };
        self.state = next;
        Ok(barrier)
    }
}

/// Number of 32-bit words a raw view over `byte_len` bytes addresses.
///
/// Raw views are word-addressed; a length that is not a multiple of four would
/// silently drop its tail, so it is refused instead.
pub fn raw_element_count(what: &str, byte_len: u64) -> Result<u32, AcceleratorError> {
    if byte_len % 4 != 0 {
        return Err(AcceleratorError::Resource(format!(
            "{what} length {byte_len} is not a multiple of 4"
        )));
    }
    u32::try_from(byte_len / 4).map_err(|_| {
        AcceleratorError::Resource(format!("{what} length {byte_len} exceeds raw view range"))
    })
}
