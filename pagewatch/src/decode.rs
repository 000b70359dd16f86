//! Raw record bytes to [`FaultRecord`].

use std::{borrow::Cow, fmt};

use pagewatch_common::{FaultEvent, FaultSource, FAULT_EVENT_SIZE, FILENAME_LEN, TASK_COMM_LEN};
use zerocopy::FromBytes;

use crate::{Error, Result};

// Perf samples round the record up to 8 bytes.
const MAX_TRAILING_PADDING: usize = 7;

/// A truncating kernel name buffer, with its length made explicit.
///
/// The name ends at the first NUL or at the end of the buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Name<const N: usize> {
	bytes: [u8; N],
	len: usize,
}

impl<const N: usize> Name<N> {
	pub fn from_raw(raw: &[u8; N]) -> Self {
		let len = raw.iter().position(|&b| b == 0).unwrap_or(N);
		Self { bytes: *raw, len }
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.bytes[..self.len]
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// The buffer was full, the name may have been cut.
	pub fn is_truncated(&self) -> bool {
		self.len == N
	}

	pub fn to_string_lossy(&self) -> Cow<'_, str> {
		String::from_utf8_lossy(self.as_bytes())
	}
}

impl<const N: usize> fmt::Display for Name<N> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.pad(&self.to_string_lossy())
	}
}

impl<const N: usize> fmt::Debug for Name<N> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.to_string_lossy(), f)
	}
}

pub type Comm = Name<TASK_COMM_LEN>;
pub type FileName = Name<FILENAME_LEN>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultDetail {
	FileBacked { filename: FileName, file_offset: u64 },
	Hook { ip: u64, error_code: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultRecord {
	pub source: FaultSource,
	pub pid: u32,
	pub tid: u32,
	pub comm: Comm,
	pub address: u64,
	pub detail: FaultDetail,
}

impl FaultRecord {
	pub fn is_kernel_mode(&self) -> bool {
		self.source.is_kernel_mode()
	}

	pub fn filename(&self) -> Option<&FileName> {
		match &self.detail {
			FaultDetail::FileBacked { filename, .. } => Some(filename),
			FaultDetail::Hook { .. } => None,
		}
	}

	pub fn file_offset(&self) -> Option<u64> {
		match self.detail {
			FaultDetail::FileBacked { file_offset, .. } => Some(file_offset),
			FaultDetail::Hook { .. } => None,
		}
	}
}

/// Decodes one record. The input must be exactly one [`FaultEvent`], possibly
/// followed by perf sample padding. Anything else is a transport bug.
pub fn decode(bytes: &[u8]) -> Result<FaultRecord> {
	let len = bytes.len();
	if len < FAULT_EVENT_SIZE || len - FAULT_EVENT_SIZE > MAX_TRAILING_PADDING {
		return Err(Error::InvalidEventSize { len });
	}

	let (event, _) = FaultEvent::read_from_prefix(bytes).map_err(|_| Error::InvalidEventSize { len })?;
	let source = FaultSource::from_raw(event.source).ok_or(Error::UnknownSource(event.source))?;

	let detail = match source.is_file_backed() {
		true => FaultDetail::FileBacked {
			filename: Name::from_raw(&event.filename),
			file_offset: event.file_offset,
		},
		false => FaultDetail::Hook {
			ip: event.ip,
			error_code: event.error_code,
		},
	};

	Ok(FaultRecord {
		source,
		pid: event.pid,
		tid: event.tid,
		comm: Name::from_raw(&event.comm),
		address: event.address,
		detail,
	})
}

// region:    --- Tests


// endregion: --- Tests
