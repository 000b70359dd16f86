use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use humantime::Duration;

use crate::lifecycle::HookSet;

#[derive(Parser, Debug)]
#[command(name = "pagewatch", about = "Trace page faults through eBPF probes")]
pub struct Cli {
	#[arg(long, value_enum, default_value = "ringbuf")]
	pub transport: TransportArg,

	#[arg(long, value_enum, default_value = "auto")]
	pub hooks: HookSet,

	#[arg(long, default_value = "100ms", help = "Longest a single poll blocks (e.g., 100ms, 1s)")]
	pub poll_timeout: Duration,

	#[arg(long, default_value_t = 256, help = "Records handled per poll at most")]
	pub batch: usize,

	#[arg(long, help = "Only report faults of this process")]
	pub pid: Option<u32>,

	#[arg(long, conflicts_with = "kernel_only")]
	pub user_only: bool,

	#[arg(long)]
	pub kernel_only: bool,

	#[arg(long, help = "log2 of the page size, read from the system when absent")]
	pub page_shift: Option<u32>,

	#[arg(long, env = "PAGEWATCH_OBJECT", help = "Compiled probe object")]
	pub object: Option<PathBuf>,

	#[arg(long, help = "Stop after this long (e.g., 20s, 5m). Runs until Ctrl-C otherwise")]
	pub duration: Option<Duration>,
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum TransportArg {
	Ringbuf,
	PerfArray,
}
