use std::io::{self, Stdout, Write};

use pagewatch_common::FaultSource;
use tracing::warn;

use crate::decode::{FaultDetail, FaultRecord};

/// Receives decoded records one at a time, in delivery order.
pub trait Reporter {
	fn report(&mut self, record: &FaultRecord);
}

// region:    --- Filter

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FaultScope {
	#[default]
	All,
	UserOnly,
	KernelOnly,
}

/// Which decoded records reach the reporter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordFilter {
	pub pid: Option<u32>,
	pub scope: FaultScope,
}

impl RecordFilter {
	pub fn accepts(&self, record: &FaultRecord) -> bool {
		if self.pid.is_some_and(|pid| pid != record.pid) {
			return false;
		}
		match self.scope {
			FaultScope::All => true,
			FaultScope::UserOnly => !record.is_kernel_mode(),
			FaultScope::KernelOnly => record.is_kernel_mode(),
		}
	}
}

// endregion: --- Filter

// region:    --- Console

/// One numbered line per record.
pub struct ConsoleReporter<W: Write> {
	out: W,
	count: u64,
}

impl ConsoleReporter<Stdout> {
	pub fn stdout() -> Self {
		Self::new(io::stdout())
	}
}

impl<W: Write> ConsoleReporter<W> {
	pub fn new(out: W) -> Self {
		Self { out, count: 0 }
	}

	pub fn count(&self) -> u64 {
		self.count
	}

	pub fn into_inner(self) -> W {
		self.out
	}
}

impl<W: Write> Reporter for ConsoleReporter<W> {
	fn report(&mut self, record: &FaultRecord) {
		self.count += 1;
		if let Err(err) = writeln!(self.out, "{}", render(self.count, record)) {
			warn!("failed to write record {}: {err}", self.count);
		}
	}
}

pub fn render(seq: u64, record: &FaultRecord) -> String {
	let head = format!(
		"[{seq:6}] {:6} | PID: {:6} TID: {:6} | COMM: {:16} | ADDR: 0x{:016x}",
		source_label(record.source),
		record.pid,
		record.tid,
		record.comm,
		record.address
	);

	match record.detail {
		FaultDetail::FileBacked { filename, file_offset } => {
			let filename = match filename.is_empty() {
				true => "?".to_string(),
				false => filename.to_string(),
			};
			format!("{head} | FILE: {filename} | OFFSET: 0x{file_offset:x}")
		}
		FaultDetail::Hook { ip, error_code } => match record.source {
			FaultSource::UserTracepoint | FaultSource::KernelTracepoint => format!(
				"{head} | IP: 0x{ip:016x} | ERR: 0x{error_code:x} ({})",
				x86_fault_flags(error_code)
			),
			_ => format!("{head} | IP: 0x{ip:016x} | ERR: 0x{error_code:x}"),
		},
	}
}

fn source_label(source: FaultSource) -> &'static str {
	match source {
		FaultSource::UserTracepoint => "USER",
		FaultSource::KernelTracepoint => "KERNEL",
		FaultSource::FallbackProbe => "KPROBE",
		FaultSource::FileMap => "FILE",
	}
}

/// x86 page fault error code bits, for display. The record keeps the raw value.
pub fn x86_fault_flags(error_code: u32) -> String {
	let mut flags = vec![
		if error_code & 0x1 != 0 { "PROTECTION" } else { "NOT_PRESENT" },
		if error_code & 0x2 != 0 { "WRITE" } else { "READ" },
		if error_code & 0x4 != 0 { "USER" } else { "KERNEL" },
	];
	if error_code & 0x8 != 0 {
		flags.push("RESERVED");
	}
	if error_code & 0x10 != 0 {
		flags.push("INSTRUCTION");
	}
	flags.join(" | ")
}

// endregion: --- Console

// region:    --- Tests


// endregion: --- Tests
