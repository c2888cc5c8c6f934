use std::path::PathBuf;
use std::time::Duration;

use blockpack_gpu::{DecompressOptions, DispatchGrid, GpuDecompressor, KernelSource};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Config {
    kernel: PathBuf,
    input: PathBuf,
    output: PathBuf,
    runs: usize,
    options: DecompressOptions,
}

fn parse_u32(args: &[String], i: usize, flag: &str) -> Result<u32, String> {
    args.get(i)
        .ok_or(format!("{flag} requires value"))?
        .parse::<u32>()
        .map_err(|e| format!("invalid {flag}: {e}"))
}

fn parse_args() -> Result<Config, String> {
    let mut options = DecompressOptions::from_env().map_err(|e| e.to_string())?;
    let mut kernel = None;
    let mut input = None;
    let mut output = None;
    let mut runs = 1usize;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--kernel" => {
                i += 1;
                kernel = Some(PathBuf::from(args.get(i).ok_or("--kernel requires value")?));
            }
            "--input" => {
                i += 1;
                input = Some(PathBuf::from(args.get(i).ok_or("--input requires value")?));
            }
            "--output" => {
                i += 1;
                output = Some(PathBuf::from(args.get(i).ok_or("--output requires value")?));
            }
            "--entry-point" => {
                i += 1;
                options.entry_point = args.get(i).ok_or("--entry-point requires value")?.clone();
            }
            "--grid" => {
                i += 1;
                let v = args.get(i).ok_or("--grid requires value")?;
                options.grid = match v.as_str() {
                    "fixed" => DispatchGrid::default(),
                    "lod" => DispatchGrid::PerLodBlock,
                    "bytes" => DispatchGrid::PerOutputBytes {
                        bytes_per_group: 64 * 1024,
                    },
                    x => return Err(format!("invalid --grid: {x} (fixed, lod or bytes)")),
                };
            }
            "--work-groups" => {
                i += 1;
                options.grid = DispatchGrid::Fixed(parse_u32(&args, i, "--work-groups")?);
            }
            "--bytes-per-group" => {
                i += 1;
                options.grid = DispatchGrid::PerOutputBytes {
                    bytes_per_group: parse_u32(&args, i, "--bytes-per-group")?,
                };
            }
            "--timeout-ms" => {
                i += 1;
                let ms = parse_u32(&args, i, "--timeout-ms")?;
                options.wait_timeout = (ms != 0).then(|| Duration::from_millis(u64::from(ms)));
            }
            "--runs" => {
                i += 1;
                let v = args.get(i).ok_or("--runs requires value")?;
                runs = v
                    .parse::<usize>()
                    .map_err(|e| format!("invalid --runs: {e}"))?;
            }
            "--validation" => {
                options.validation = true;
            }
            "--no-validation" => {
                options.validation = false;
            }
            "--allow-software" => {
                options.allow_software_adapter = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            x => {
                return Err(format!("unknown argument: {x}"));
            }
        }
        i += 1;
    }

    Ok(Config {
        kernel: kernel.ok_or("--kernel is required")?,
        input: input.ok_or("--input is required")?,
        output: output.ok_or("--output is required")?,
        runs: runs.max(1),
        options,
    })
}

fn print_help() {
    println!(
        "usage: cargo run -p blockpack_gpu --example decompress_file -- \\
  --kernel PATH.{{spv,wgsl}} --input PATH --output PATH \\
  [--entry-point NAME] [--grid fixed|lod|bytes] [--work-groups N] [--bytes-per-group N] \\
  [--timeout-ms N (0 = wait forever)] [--runs N] [--validation|--no-validation] \\
  [--allow-software]"
    );
}

fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = parse_args()?;
    let kernel = KernelSource::load(&cfg.kernel).map_err(|e| e.to_string())?;
    let mut decompressor =
        GpuDecompressor::new(&kernel, &cfg.options).map_err(|e| e.to_string())?;

    println!("adapter={}", decompressor.context().backend().adapter_info().name);
    println!(
        "grid={:?} timeout={:?} entry_point={} runs={}",
        cfg.options.grid, cfg.options.wait_timeout, cfg.options.entry_point, cfg.runs
    );

    for run in 1..=cfg.runs {
        let stats = decompressor
            .decompress_file(&cfg.input, &cfg.output)
            .map_err(|e| e.to_string())?;
        println!(
            "run={run} in={} out={} groups={} upload_ms={:.3} dispatch_ms={:.3} \
             readback_ms={:.3} total_ms={:.3}",
            stats.input_bytes,
            stats.output_bytes,
            stats.work_groups,
            stats.upload_ms,
            stats.dispatch_wait_ms,
            stats.readback_ms,
            stats.total_ms
        );
    }
    Ok(())
}
