// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! repack - transcode a telemetry/datalink XML recording into APXTLM.
//!
//! Usage:
//!   repack --in flight_042.telemetry --out flight_042.apxtlm
//!   repack --in dump.datalink.xml --out dump.apxtlm --utc 10800 --with-jso

use apxtlm_repack::{repack_file, RepackConfig};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "repack")]
#[command(about = "Repack telemetry/datalink XML recordings into APXTLM containers")]
#[command(version)]
struct Args {
    /// Input XML recording (.telemetry or .datalink)
    #[arg(long = "in", value_name = "PATH")]
    input: PathBuf,

    /// Output APXTLM container
    #[arg(long = "out", value_name = "PATH")]
    output: PathBuf,

    /// UTC offset of the recording site, in seconds
    #[arg(long = "utc", value_name = "SECONDS", default_value = "0", allow_hyphen_values = true)]
    utc_offset: i32,

    /// Capture non-record sub-trees as embedded JSON documents
    #[arg(long = "with-jso")]
    with_jso: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Quiet mode (minimal output)
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    // Exit 1 on argument errors; clap's default of 2 does not fit the
    // tool's 0/1 contract. --help and --version still exit 0.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };

    let level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let config = RepackConfig::default()
        .utc_offset(args.utc_offset)
        .include_jso(args.with_jso);

    let stats = match repack_file(&args.input, &args.output, &config) {
        Ok(stats) => stats,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(1);
        }
    };

    if !args.quiet {
        info!("Repacked {} -> {}", args.input.display(), args.output.display());
        info!("  Dialect: {:?}", stats.dialect);
        info!("  Fields: {}", stats.encoder.fields);
        info!("  Samples: {} ({} suppressed)", stats.encoder.samples, stats.encoder.samples_suppressed);
        info!("  Events: {}", stats.encoder.events);
        info!("  Bytes: {}", stats.encoder.bytes_written);
        info!("  Duration: {:.3}s", stats.duration_secs);
    }

    ExitCode::SUCCESS
}
