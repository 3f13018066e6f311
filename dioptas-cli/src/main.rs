//! dioptas-batch: command-line batch integration.
//!
//! Integrates every frame of a set of image files to 2θ with one
//! calibration and writes the stacked patterns to an HDF5 file.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, ValueEnum};
use dioptas_algorithms::{IntegrationConfig, IntegrationMethod};
use dioptas_core::calibration::Calibration;
use dioptas_core::mask::Mask;
use dioptas_core::units::IntegrationUnit;
use dioptas_io::{
    Configuration, FileLoader, FrameSource, IntegrationSettings, ProcessInfo, StoredBatch,
};
use log::LevelFilter;
use memmap2::MmapMut;
use ndarray::Array2;
use rayon::prelude::*;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;
use sysinfo::System;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    DioptasIo(#[from] dioptas_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] dioptas_core::Error),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("{0}")]
    Input(String),
}

/// Binning method selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Method {
    /// Cached sparse lookup with pixel splitting
    Csr,
    /// Pixel centres only
    Histogram,
}

impl From<Method> for IntegrationMethod {
    fn from(method: Method) -> Self {
        match method {
            Method::Csr => IntegrationMethod::Csr,
            Method::Histogram => IntegrationMethod::Histogram,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// Batch azimuthal integration of diffraction images.
#[derive(Parser, Debug)]
#[command(name = "dioptas-batch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Calibration (PONI) file
    #[arg(long = "cal_file")]
    cal_file: PathBuf,

    /// Output HDF5 file
    #[arg(long = "out_path")]
    out_path: PathBuf,

    /// Image files or directories of image files
    #[arg(long = "data_path", required = true, num_args = 1..)]
    data_path: Vec<PathBuf>,

    /// Mask file (TIFF, nonzero = masked)
    #[arg(long = "mask_file")]
    mask_file: Option<PathBuf>,

    /// Integration method
    #[arg(long = "int_method", value_enum, default_value = "csr")]
    int_method: Method,

    /// Number of radial bins
    #[arg(long = "num_points", default_value_t = 1500)]
    num_points: usize,

    /// Number of worker threads
    #[arg(long = "n_proc", default_value_t = 1)]
    n_proc: usize,

    /// Upper bound on worker threads (default: physical cores)
    #[arg(long = "n_cores")]
    n_cores: Option<usize>,

    /// Write log records to this file instead of stderr
    #[arg(long = "log_file")]
    log_file: Option<PathBuf>,

    /// Log verbosity
    #[arg(long = "log_level", value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Integration settings (JSON)
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(cli.log_level.into());
    if let Some(path) = &cli.log_file {
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// Expands directories into their files, sorted by name.
fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            entries.sort();
            files.extend(entries);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn worker_count(n_proc: usize, n_cores: Option<usize>) -> usize {
    let cores = n_cores.unwrap_or_else(|| {
        System::new()
            .physical_core_count()
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, usize::from))
    });
    n_proc.clamp(1, cores.max(1))
}

/// Warns when the output buffer exceeds the memory currently available.
fn check_memory(bytes: usize) {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    if bytes as u64 > available {
        log::warn!(
            "output buffer of {:.1} MB exceeds available memory ({:.1} MB)",
            bytes as f64 / 1e6,
            available as f64 / 1e6
        );
    }
}

fn write_row(row: &mut [u8], values: &[f64]) {
    for (cell, value) in row.chunks_exact_mut(4).zip(values) {
        cell.copy_from_slice(&(*value as f32).to_le_bytes());
    }
}

fn read_rows(buffer: &[u8], keep: &[bool], n: usize) -> Array2<f64> {
    let rows: Vec<f64> = buffer
        .chunks_exact(n * 4)
        .zip(keep)
        .filter(|(_, &k)| k)
        .flat_map(|(row, _)| {
            row.chunks_exact(4)
                .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
        })
        .collect();
    let m = rows.len() / n.max(1);
    Array2::from_shape_vec((m, n), rows).unwrap_or_else(|_| Array2::zeros((0, n)))
}

/// Geometry, mask and settings every worker starts from.
#[derive(Clone)]
struct WorkerSeed {
    calibration: Calibration,
    mask: Mask,
    settings: IntegrationSettings,
}

impl WorkerSeed {
    fn from_template(template: &Configuration) -> Self {
        Self {
            calibration: template.calibration.clone(),
            mask: template.mask.clone(),
            settings: template.settings.clone(),
        }
    }

    /// Each worker owns its configuration, so integrator caches are never
    /// shared.
    fn configuration(&self) -> Configuration {
        let mut config = Configuration::new();
        config.calibration = self.calibration.clone();
        config.mask = self.mask.clone();
        config.settings = self.settings.clone();
        config
    }
}

fn run(cli: &Cli) -> Result<()> {
    let start = Instant::now();
    let files = expand_paths(&cli.data_path)?;
    if files.is_empty() {
        return Err(CliError::Input("no input files".to_string()));
    }

    let mut settings = match &cli.settings {
        Some(path) => IntegrationSettings::from_file(path)?,
        None => IntegrationSettings::default(),
    };
    settings.unit = IntegrationUnit::TwoThetaDeg;
    settings.method = cli.int_method.into();
    settings.num_points = Some(cli.num_points);
    settings.auto_integrate = false;
    settings.trim_trailing_zeros = false;

    let mut template = Configuration::new();
    template.apply_settings(settings)?;
    template.load_calibration(&cli.cal_file)?;

    let mut file_map = vec![0];
    let mut positions = Vec::new();
    for (file_index, path) in files.iter().enumerate() {
        let count = template.loader_mut().frame_count(path)?;
        positions.extend((0..count).map(|frame| (file_index, frame)));
        file_map.push(positions.len());
    }
    if positions.is_empty() {
        return Err(CliError::Input("input files contain no frames".to_string()));
    }
    log::info!("{} frames in {} files", positions.len(), files.len());

    template.load_image(&files[0], None)?;
    if let Some(mask) = &cli.mask_file {
        template.load_mask(mask)?;
    }
    let int_config: IntegrationConfig = template.settings.integration_config();
    let first = template.image.img_data();
    let binning = template.integrate_array_1d(first.view(), &int_config)?.x;
    let n = binning.len();
    if n == 0 {
        return Err(CliError::Input("calibration yields an empty radial axis".to_string()));
    }

    let bytes = positions.len() * n * 4;
    check_memory(bytes);
    let mut buffer = MmapMut::map_anon(bytes)?;

    let threads = worker_count(cli.n_proc, cli.n_cores);
    log::info!("integrating with {threads} workers");
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()?;

    let seed = WorkerSeed::from_template(&template);
    let rows: Vec<&mut [u8]> = buffer.chunks_exact_mut(n * 4).collect();
    let keep: Vec<bool> = pool.install(|| {
        rows.into_par_iter()
            .zip(positions.par_iter())
            .map_init(
                || (seed.configuration(), FileLoader::new()),
                |(config, loader), (row, &(file_index, frame))| -> Result<bool> {
                    let path = &files[file_index];
                    let loaded = match loader.load_frame(path, frame) {
                        Ok(loaded) => loaded,
                        Err(e) => {
                            log::warn!("skipping frame {frame} of {}: {e}", path.display());
                            return Ok(false);
                        }
                    };
                    let pattern = config.integrate_array_1d(loaded.img_data.view(), &int_config)?;
                    write_row(row, &pattern.y);
                    Ok(true)
                },
            )
            .collect::<Result<Vec<bool>>>()
    })?;

    let data = read_rows(&buffer, &keep, n);
    let pos_map: Vec<(usize, usize)> = positions
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(p, _)| *p)
        .collect();
    let skipped = positions.len() - pos_map.len();
    let stored = StoredBatch {
        data,
        binning,
        bkg: None,
        files,
        file_map,
        pos_map,
        process: ProcessInfo {
            cal_file: Some(cli.cal_file.clone()),
            mask_file: cli.mask_file.clone(),
            mask_shape: cli.mask_file.as_ref().map(|_| template.mask.shape()),
            int_method: template.settings.method.as_str().to_string(),
            int_unit: IntegrationUnit::TwoThetaDeg.as_str().to_string(),
            num_points: n,
        },
    };
    dioptas_io::write_batch_hdf5(&cli.out_path, &stored)?;

    println!(
        "Integrated {} frames ({skipped} skipped) in {:.2}s",
        stored.pos_map.len(),
        start.elapsed().as_secs_f64()
    );
    println!("Output: {}", cli.out_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    run(&cli).inspect_err(|e| log::error!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_arguments() {
        let cli = Cli::try_parse_from([
            "dioptas-batch",
            "--cal_file",
            "ceo2.poni",
            "--out_path",
            "out.h5",
            "--data_path",
            "a.h5",
            "b.h5",
        ])
        .unwrap();
        assert_eq!(cli.data_path.len(), 2);
        assert_eq!(cli.num_points, 1500);
        assert_eq!(cli.n_proc, 1);
        assert!(matches!(cli.int_method, Method::Csr));

        assert!(Cli::try_parse_from(["dioptas-batch", "--cal_file", "x.poni"]).is_err());
    }

    #[test]
    fn test_rows_survive_the_buffer() {
        let mut buffer = vec![0u8; 3 * 2 * 4];
        let mut rows: Vec<&mut [u8]> = buffer.chunks_exact_mut(8).collect();
        write_row(&mut *rows[0], &[1.0, 2.0]);
        write_row(&mut *rows[2], &[5.0, 6.0]);
        let data = read_rows(&buffer, &[true, false, true], 2);
        assert_eq!(data.dim(), (2, 2));
        assert_eq!(data[[1, 1]], 6.0);
    }

    #[test]
    fn test_directories_expand_sorted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.tif"), b"").unwrap();
        std::fs::write(dir.path().join("a.tif"), b"").unwrap();
        let files = expand_paths(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(files, vec![dir.path().join("a.tif"), dir.path().join("b.tif")]);
    }

    #[test]
    fn test_worker_count_is_capped() {
        assert_eq!(worker_count(8, Some(2)), 2);
        assert_eq!(worker_count(0, Some(4)), 1);
    }
}
