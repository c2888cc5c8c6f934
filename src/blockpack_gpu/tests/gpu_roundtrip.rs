use blockpack::ContainerHeader;
use blockpack_gpu::{
    AcceleratorError, DecompressOptions, Decompressor, DispatchGrid, KernelSource, PreferDiscrete,
    WgpuBackend,
};
use tracing_subscriber::EnvFilter;

// Copies input words to the output, wrapping around the input, so the result
// is predictable without a real block decoder.
const PASS_THROUGH: &str = r#"
@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;

@compute @workgroup_size(64)
fn main(
    @builtin(global_invocation_id) id: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let stride = groups.x * 64u;
    let n_src = arrayLength(&src);
    let n_dst = arrayLength(&dst);
    for (var i = id.x; i < n_dst; i = i + stride) {
        dst[i] = src[i % n_src];
    }
}
"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn container(raw_decompressed_size: u32, payload_len: usize) -> Vec<u8> {
    let header = ContainerHeader {
        header_size: 24,
        kind: 4,
        raw_decompressed_size,
        used_block_count: 4,
        allocated_block_count: 4,
        lod_block_count: 4,
    };
    let mut bytes = header.to_bytes().to_vec();
    bytes.extend((0..payload_len).map(|i| (i % 251) as u8));
    bytes
}

fn expected(input: &[u8], len: usize) -> Vec<u8> {
    let words = input.len() / 4;
    (0..len)
        .map(|i| input[((i / 4) % words) * 4 + i % 4])
        .collect()
}

fn gpu_decompressor(options: &DecompressOptions) -> Option<Decompressor<WgpuBackend>> {
    let selector = PreferDiscrete {
        allow_software: options.allow_software_adapter,
    };
    let backend = match WgpuBackend::new(options.validation, &selector) {
        Ok(backend) => backend,
        Err(AcceleratorError::Setup(reason)) => {
            eprintln!("skipping: no usable compute adapter ({reason})");
            return None;
        }
        Err(other) => panic!("unexpected setup failure: {other}"),
    };
    let kernel = KernelSource::Wgsl(PASS_THROUGH.to_string());
    Some(
        Decompressor::with_backend(backend, &kernel, options)
            .expect("pass-through kernel should load"),
    )
}

#[test]
fn pass_through_kernel_fills_declared_output() {
    init_tracing();
    let options = DecompressOptions {
        allow_software_adapter: true,
        validation: true,
        ..DecompressOptions::default()
    };
    let Some(mut decompressor) = gpu_decompressor(&options) else {
        return;
    };

    let input = container(65536, 20000);
    let first = decompressor
        .decompress_with_stats(&input)
        .expect("first run should succeed");
    assert_eq!(first.bytes.len(), 65536);
    assert_eq!(first.bytes, expected(&input, 65536));

    let second = decompressor.decompress(&input).expect("second run should succeed");
    assert_eq!(first.bytes, second);
    assert_eq!(decompressor.context().counter().last_signaled(), 4);
}

#[test]
fn per_output_bytes_grid_covers_small_outputs() {
    init_tracing();
    let options = DecompressOptions {
        allow_software_adapter: true,
        grid: DispatchGrid::PerOutputBytes {
            bytes_per_group: 256,
        },
        ..DecompressOptions::default()
    };
    let Some(mut decompressor) = gpu_decompressor(&options) else {
        return;
    };

    let input = container(1024, 8);
    let output = decompressor
        .decompress_with_stats(&input)
        .expect("run should succeed");
    assert_eq!(output.stats.work_groups, 4);
    assert_eq!(output.bytes, expected(&input, 1024));
}

#[test]
fn zero_sized_output_never_reaches_the_device() {
    init_tracing();
    let options = DecompressOptions {
        allow_software_adapter: true,
        ..DecompressOptions::default()
    };
    let Some(mut decompressor) = gpu_decompressor(&options) else {
        return;
    };

    let error = decompressor
        .decompress(&container(0, 8))
        .expect_err("empty output should be rejected");
    assert!(matches!(error, AcceleratorError::Resource(_)));
    assert!(!decompressor.context().is_poisoned());
    assert_eq!(decompressor.context().counter().last_signaled(), 0);
}
