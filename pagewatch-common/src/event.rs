use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const TASK_COMM_LEN: usize = 16;
pub const FILENAME_LEN: usize = 32;

/// 4 KiB pages.
pub const DEFAULT_PAGE_SHIFT: u32 = 12;

pub const RINGBUF_BYTE_SIZE: u32 = 256 * 1024;

pub const FAULT_EVENT_SIZE: usize = core::mem::size_of::<FaultEvent>();

/// Which hook produced a [`FaultEvent`]. Tells the reader which optional fields carry data.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultSource {
	UserTracepoint = 0,
	KernelTracepoint = 1,
	FallbackProbe = 2,
	FileMap = 3,
}

impl FaultSource {
	pub const fn from_raw(raw: u32) -> Option<Self> {
		match raw {
			0 => Some(Self::UserTracepoint),
			1 => Some(Self::KernelTracepoint),
			2 => Some(Self::FallbackProbe),
			3 => Some(Self::FileMap),
			_ => None,
		}
	}

	pub const fn as_raw(self) -> u32 {
		self as u32
	}

	/// `filename` and `file_offset` are only meaningful for these records.
	pub const fn is_file_backed(self) -> bool {
		matches!(self, Self::FileMap)
	}

	pub const fn is_kernel_mode(self) -> bool {
		matches!(self, Self::KernelTracepoint)
	}
}

/// Transport the probe handlers submit into. Written as a global before load.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
	RingBuf = 0,
	PerCpuArray = 1,
}

impl TransportKind {
	pub const fn from_raw(raw: u32) -> Option<Self> {
		match raw {
			0 => Some(Self::RingBuf),
			1 => Some(Self::PerCpuArray),
			_ => None,
		}
	}

	pub const fn as_raw(self) -> u32 {
		self as u32
	}
}

/// Fixed-layout record shared by the probe object and the consumer.
///
/// `comm` and `filename` are truncating byte buffers, NUL padded but not
/// NUL terminated when the name fills the whole buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FaultEvent {
	pub source: u32,
	pub pid: u32,
	pub tid: u32,
	pub error_code: u32, // opaque, hook supplied
	pub comm: [u8; TASK_COMM_LEN],
	pub filename: [u8; FILENAME_LEN],
	pub address: u64,
	pub ip: u64,
	pub file_offset: u64,
}

impl FaultEvent {
	pub const fn zeroed() -> Self {
		Self {
			source: 0,
			pid: 0,
			tid: 0,
			error_code: 0,
			comm: [0u8; TASK_COMM_LEN],
			filename: [0u8; FILENAME_LEN],
			address: 0,
			ip: 0,
			file_offset: 0,
		}
	}
}

/// Offset into the backing file of `address`, given the mapping start and its
/// page offset (`vm_pgoff`).
#[inline(always)]
pub fn file_offset(address: u64, vm_start: u64, vm_pgoff: u64, page_shift: u32) -> u64 {
	address.wrapping_sub(vm_start).wrapping_add(vm_pgoff.wrapping_shl(page_shift))
}

/// Copies as much of `src` as fits into `dst` and returns the copied length.
#[inline(always)]
pub fn copy_truncated(dst: &mut [u8], src: &[u8]) -> usize {
	let len = core::cmp::min(dst.len(), src.len());
	dst[..len].copy_from_slice(&src[..len]);
	len
}

// region:    --- Tests


// endregion: --- Tests
