use derive_more::{Display, From};

use crate::lifecycle::Stage;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Display, From)]
#[display("{self:?}")]
pub enum Error {
	#[from(String, &String, &str)]
	Custom(String),

	// -- Setup
	EbpfProgNotFound,
	#[display("Map '{_0}' not found in the probe object")]
	MapNotFound(&'static str),
	#[display("Invalid lifecycle transition {from:?} -> {to:?}")]
	InvalidTransition {
		from: Stage,
		to: Stage,
	},
	#[display("No fault hook could be attached")]
	NoHookAttached,
	#[display("Transport already taken")]
	TransportTaken,
	#[display("Poll timeout must be greater than zero")]
	InvalidPollTimeout,
	#[display("Batch size must be greater than zero")]
	InvalidBatch,
	#[display("Unsupported page shift {_0} (expected 12..=16)")]
	InvalidPageShift(u32),

	// -- Consumer
	#[display("Invalid event size {len}")]
	InvalidEventSize {
		len: usize,
	},
	UnknownSource(u32),
	/// Benign early return from a poll. The loop carries on.
	Interrupted,
	LockPoison,

	// -- Externals
	#[display("Kernel layout discovery failed: {_0}")]
	#[from]
	Layout(anyhow::Error),
	#[from]
	AyaEbpf(aya::EbpfError),
	#[from]
	AyaMaps(aya::maps::MapError),
	#[from]
	AyaProgram(aya::programs::ProgramError),
	#[from]
	PerfBuffer(aya::maps::perf::PerfBufferError),
	#[from]
	Io(std::io::Error),
}

impl Error {
	/// Process status for this error: the OS errno when there is one, else 1.
	pub fn exit_code(&self) -> u8 {
		let errno = match self {
			Self::Io(err) => err.raw_os_error(),
			Self::AyaProgram(aya::programs::ProgramError::SyscallError(err)) => err.io_error.raw_os_error(),
			Self::AyaMaps(aya::maps::MapError::SyscallError(err)) => err.io_error.raw_os_error(),
			_ => None,
		};

		match errno {
			Some(code) if (1..=255).contains(&code) => code as u8,
			_ => 1,
		}
	}
}

impl<T> From<std::sync::PoisonError<T>> for Error {
	fn from(_val: std::sync::PoisonError<T>) -> Self {
		Self::LockPoison
	}
}

// region:    --- Custom

impl Error {
	pub fn custom(val: impl Into<String>) -> Self {
		Self::Custom(val.into())
	}
}

// endregion: --- Custom

// region:    --- Error Boilerplate

impl std::error::Error for Error {}

// endregion: --- Error Boilerplate

// region:    --- Tests


// endregion: --- Tests
