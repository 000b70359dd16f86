use std::{path::PathBuf, time::Duration};

use pagewatch_common::TransportKind;

use crate::{
	cli::args::{Cli, TransportArg},
	lifecycle::{HookSet, ObjectSource},
	report::{FaultScope, RecordFilter},
	Error, Result,
};

const PAGE_SHIFTS: std::ops::RangeInclusive<u32> = 12..=16;

/// Validated run configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
	pub transport: TransportKind,
	pub hooks: HookSet,
	pub poll_timeout: Duration,
	pub batch: usize,
	pub filter: RecordFilter,
	pub page_shift: Option<u32>,
	pub object: ObjectSource,
	pub duration: Option<Duration>,
}

impl TryFrom<Cli> for Config {
	type Error = Error;

	fn try_from(cli: Cli) -> Result<Self> {
		let poll_timeout: Duration = cli.poll_timeout.into();
		if poll_timeout.is_zero() {
			return Err(Error::InvalidPollTimeout);
		}
		if cli.batch == 0 {
			return Err(Error::InvalidBatch);
		}
		if let Some(shift) = cli.page_shift {
			if !PAGE_SHIFTS.contains(&shift) {
				return Err(Error::InvalidPageShift(shift));
			}
		}

		let transport = match cli.transport {
			TransportArg::Ringbuf => TransportKind::RingBuf,
			TransportArg::PerfArray => TransportKind::PerCpuArray,
		};
		let scope = match (cli.user_only, cli.kernel_only) {
			(true, _) => FaultScope::UserOnly,
			(_, true) => FaultScope::KernelOnly,
			_ => FaultScope::All,
		};
		let object = match cli.object {
			Some(path) => ObjectSource::File(path),
			None if cfg!(feature = "embed-ebpf") => ObjectSource::Embedded,
			None => ObjectSource::File(PathBuf::from(ObjectSource::DEFAULT_PATH)),
		};

		Ok(Self {
			transport,
			hooks: cli.hooks,
			poll_timeout,
			batch: cli.batch,
			filter: RecordFilter { pid: cli.pid, scope },
			page_shift: cli.page_shift,
			object,
			duration: cli.duration.map(Into::into),
		})
	}
}

// region:    --- Tests


// endregion: --- Tests
