use std::{path::PathBuf, process::Command};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "xtask")]
struct Cli {
	#[command(subcommand)]
	command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
	/// Build the probe object for `bpfel-unknown-none`
	BuildEbpf {
		#[arg(long)]
		debug: bool,
		#[arg(long, env = "PAGEWATCH_EBPF_TOOLCHAIN", default_value = "nightly")]
		toolchain: String,
	},
}

fn main() -> Result<()> {
	match Cli::parse().command {
		Cmd::BuildEbpf { debug, toolchain } => build_ebpf(debug, &toolchain),
	}
}

fn build_ebpf(debug: bool, toolchain: &str) -> Result<()> {
	let mut cmd = Command::new("cargo");
	cmd.args([
		"build",
		"--package",
		"pagewatch-ebpf",
		"--target",
		"bpfel-unknown-none",
		"-Z",
		"build-std=core",
	])
	.env("RUSTUP_TOOLCHAIN", toolchain);
	if !debug {
		cmd.arg("--release");
	}

	let status = cmd.status().context("failed to run cargo build for the probe object")?;
	if !status.success() {
		bail!("probe object build failed: {status}");
	}

	let profile = if debug { "debug" } else { "release" };
	let object: PathBuf = ["target", "bpfel-unknown-none", profile, "pagewatch"].iter().collect();
	println!("probe object at {}", object.display());
	Ok(())
}
