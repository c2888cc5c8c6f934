use thiserror::Error;

pub const CONTAINER_HEADER_LEN: usize = 24;
pub const LOD_BLOCK_DESCRIPTOR_LEN: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("truncated container: {0}")]
    Truncated(&'static str),
    #[error("invalid container header: {0}")]
    InvalidHeader(&'static str),
    #[error("lod block table out of range")]
    TableOutOfRange,
}

/// Fixed-size record at offset 0 of every container.
///
/// All six fields are little-endian `u32` in declaration order. Only
/// `raw_decompressed_size` matters to the host pipeline; the rest are carried
/// through for the kernel, which reads them from the uploaded bytes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerHeader {
    pub header_size: u32,
    pub kind: u32,
    pub raw_decompressed_size: u32,
    pub used_block_count: u32,
    pub allocated_block_count: u32,
    pub lod_block_count: u32,
}

impl ContainerHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        if bytes.len() < CONTAINER_HEADER_LEN {
            return Err(ContainerError::Truncated("shorter than container header"));
        }
        Ok(Self {
            header_size: read_u32(bytes, 0)?,
            kind: read_u32(bytes, 4)?,
            raw_decompressed_size: read_u32(bytes, 8)?,
            used_block_count: read_u32(bytes, 12)?,
            allocated_block_count: read_u32(bytes, 16)?,
            lod_block_count: read_u32(bytes, 20)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; CONTAINER_HEADER_LEN] {
        let mut out = [0_u8; CONTAINER_HEADER_LEN];
        let fields = [
            self.header_size,
            self.kind,
            self.raw_decompressed_size,
            self.used_block_count,
            self.allocated_block_count,
            self.lod_block_count,
        ];
        for (slot, value) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Output length in bytes, exactly as stored.
    pub fn raw_decompressed_len(&self) -> usize {
        self.raw_decompressed_size as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LodBlockDescriptor {
    pub compressed_offset: u32,
    pub compressed_size: u32,
    pub decompressed_size: u32,
    pub block_offset: u32,
    pub block_count: u32,
}

impl LodBlockDescriptor {
    fn parse_at(bytes: &[u8], offset: usize) -> Result<Self, ContainerError> {
        Ok(Self {
            compressed_offset: read_u32(bytes, offset)?,
            compressed_size: read_u32(bytes, offset + 4)?,
            decompressed_size: read_u32(bytes, offset + 8)?,
            block_offset: read_u32(bytes, offset + 12)?,
            block_count: read_u32(bytes, offset + 16)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; LOD_BLOCK_DESCRIPTOR_LEN] {
        let mut out = [0_u8; LOD_BLOCK_DESCRIPTOR_LEN];
        let fields = [
            self.compressed_offset,
            self.compressed_size,
            self.decompressed_size,
            self.block_offset,
            self.block_count,
        ];
        for (slot, value) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        out
    }
}

/// Reads the LOD block table that follows the header.
///
/// Host-side inspection only: the decompression kernel walks this table on the
/// device and the upload path never depends on it.
pub fn lod_blocks(container: &[u8]) -> Result<Vec<LodBlockDescriptor>, ContainerError> {
    let header = ContainerHeader::parse(container)?;
    let count = header.lod_block_count as usize;
    let table_len = count
        .checked_mul(LOD_BLOCK_DESCRIPTOR_LEN)
        .ok_or(ContainerError::TableOutOfRange)?;
    let table_end = CONTAINER_HEADER_LEN
        .checked_add(table_len)
        .ok_or(ContainerError::TableOutOfRange)?;
    if table_end > container.len() {
        return Err(ContainerError::TableOutOfRange);
    }

    (0..count)
        .map(|index| {
            LodBlockDescriptor::parse_at(
                container,
                CONTAINER_HEADER_LEN + index * LOD_BLOCK_DESCRIPTOR_LEN,
            )
        })
        .collect()
}

/// Bytes after the fixed header. Empty when the container is exactly one header.
pub fn payload(container: &[u8]) -> Result<&[u8], ContainerError> {
    container
        .get(CONTAINER_HEADER_LEN..)
        .ok_or(ContainerError::Truncated("shorter than container header"))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ContainerError> {
    let end = offset
        .checked_add(4)
        .ok_or(ContainerError::InvalidHeader("u32 overflow"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or(ContainerError::Truncated("u32 out of range"))?;
    let array: [u8; 4] = slice
        .try_into()
        .map_err(|_| ContainerError::InvalidHeader("u32 parse failed"))?;
    Ok(u32::from_le_bytes(array))
}

#[cfg(test)]
mod tests;
