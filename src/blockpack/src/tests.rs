use super::*;

fn sample_header() -> ContainerHeader {
    ContainerHeader {
        header_size: 24,
        kind: 4,
        raw_decompressed_size: 65536,
        used_block_count: 16,
        allocated_block_count: 16,
        lod_block_count: 2,
    }
}

#[test]
fn header_fields_are_little_endian_in_order() {
    let mut bytes = Vec::new();
    for value in [24_u32, 4, 65536, 16, 16, 2] {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    let header = ContainerHeader::parse(&bytes).expect("header should parse");
    assert_eq!(header, sample_header());
    assert_eq!(header.raw_decompressed_len(), 65536);
    assert_eq!(header.to_bytes().as_slice(), bytes.as_slice());
}

#[test]
fn short_header_is_rejected() {
    let bytes = [0_u8; CONTAINER_HEADER_LEN - 1];
    let error = ContainerHeader::parse(&bytes).expect_err("short header should fail");
    assert!(matches!(error, ContainerError::Truncated(_)));
}

#[test]
fn lod_table_follows_header() {
    let blocks = [
        LodBlockDescriptor {
            compressed_offset: 64,
            compressed_size: 1000,
            decompressed_size: 32768,
            block_offset: 0,
            block_count: 8,
        },
        LodBlockDescriptor {
            compressed_offset: 1064,
            compressed_size: 800,
            decompressed_size: 32768,
            block_offset: 8,
            block_count: 8,
        },
    ];
    let mut container = sample_header().to_bytes().to_vec();
    for block in &blocks {
        container.extend_from_slice(&block.to_bytes());
    }
    container.extend_from_slice(&[0xAB; 16]);

    let parsed = lod_blocks(&container).expect("table should parse");
    assert_eq!(parsed, blocks);
    assert_eq!(payload(&container).expect("payload").len(), 2 * 20 + 16);
}

#[test]
fn lod_table_past_end_is_rejected() {
    let mut container = sample_header().to_bytes().to_vec();
    container.extend_from_slice(&[0_u8; LOD_BLOCK_DESCRIPTOR_LEN]);
    let error = lod_blocks(&container).expect_err("second entry is missing");
    assert_eq!(error, ContainerError::TableOutOfRange);
}

#[test]
fn header_only_container_has_empty_payload() {
    let container = sample_header().to_bytes();
    assert!(payload(&container).expect("payload").is_empty());
}
