//! Record construction for the probe handlers.
//!
//! Written against small traits so the same code runs inside the probe object
//! (helpers, maps) and inside the user-space simulator (plain structs, lanes).
//! Nothing here allocates or blocks: a failed reservation drops the fault.

use crate::{file_offset, FaultEvent, FaultSource, FILENAME_LEN, TASK_COMM_LEN};

/// Identity of the task that faulted.
pub trait TaskInfo {
	/// tgid in the upper half, thread id in the lower half.
	fn pid_tgid(&self) -> u64;
	fn comm(&self) -> [u8; TASK_COMM_LEN];
}

/// The faulting mapping as seen from the file-backed hook.
pub trait MappedFault {
	fn address(&self) -> u64;
	fn vm_start(&self) -> u64;
	fn vm_pgoff(&self) -> u64;
	fn is_file_backed(&self) -> bool;
	/// Writes the (truncated) backing file name into `dst`. Must leave `dst`
	/// zeroed when the name cannot be resolved.
	fn read_file_name(&self, dst: &mut [u8; FILENAME_LEN]);
}

/// A reserved, not yet visible, record slot.
pub trait EventSlot {
	fn event_mut(&mut self) -> &mut FaultEvent;
	/// Publishes the record to the consumer side.
	fn commit(self);
}

/// Producer side of a transport.
pub trait EventSink {
	type Slot<'a>: EventSlot
	where
		Self: 'a;

	/// Claims room for one [`FaultEvent`]. `None` when the transport is full.
	fn reserve(&self) -> Option<Self::Slot<'_>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
	Emitted,
	/// Anonymous mapping or unresolved layout, nothing to report.
	Skipped,
	/// Transport full.
	Dropped,
}

/// Values handed over by a generic fault hook.
#[derive(Clone, Copy, Debug)]
pub struct HookArgs {
	pub source: FaultSource,
	pub address: u64,
	pub ip: u64,
	pub error_code: u32,
}

impl HookArgs {
	/// Fields the hook could not read are reported as zero, the record is
	/// still emitted.
	#[inline(always)]
	pub fn from_reads(source: FaultSource, address: Option<u64>, ip: Option<u64>, error_code: Option<u64>) -> Self {
		Self {
			source,
			address: address.unwrap_or(0),
			ip: ip.unwrap_or(0),
			error_code: error_code.unwrap_or(0) as u32,
		}
	}
}

#[inline(always)]
pub fn on_filemap_fault<T, F, S>(task: &T, fault: &F, sink: &S, page_shift: u32) -> Outcome
where
	T: TaskInfo,
	F: MappedFault,
	S: EventSink,
{
	if !fault.is_file_backed() {
		return Outcome::Skipped;
	}

	let Some(mut slot) = sink.reserve() else {
		return Outcome::Dropped;
	};

	let pid_tgid = task.pid_tgid();
	let address = fault.address();

	let event = slot.event_mut();
	event.source = FaultSource::FileMap.as_raw();
	event.pid = (pid_tgid >> 32) as u32;
	event.tid = pid_tgid as u32;
	event.comm = task.comm();
	fault.read_file_name(&mut event.filename);
	event.address = address;
	event.file_offset = file_offset(address, fault.vm_start(), fault.vm_pgoff(), page_shift);

	slot.commit();
	Outcome::Emitted
}

#[inline(always)]
pub fn on_fault_hook<T, S>(task: &T, args: HookArgs, sink: &S) -> Outcome
where
	T: TaskInfo,
	S: EventSink,
{
	let Some(mut slot) = sink.reserve() else {
		return Outcome::Dropped;
	};

	let pid_tgid = task.pid_tgid();

	let event = slot.event_mut();
	event.source = args.source.as_raw();
	event.pid = (pid_tgid >> 32) as u32;
	event.tid = pid_tgid as u32;
	event.comm = task.comm();
	event.address = args.address;
	event.ip = args.ip;
	event.error_code = args.error_code;

	slot.commit();
	Outcome::Emitted
}

// region:    --- Tests


// endregion: --- Tests
