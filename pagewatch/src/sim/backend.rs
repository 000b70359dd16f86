use std::{
	collections::HashSet,
	sync::{Arc, Mutex, MutexGuard},
};

use pagewatch_common::{
	copy_truncated,
	probe::{on_fault_hook, on_filemap_fault, HookArgs, MappedFault, Outcome, TaskInfo},
	FaultSource, TransportKind, DEFAULT_PAGE_SHIFT, FILENAME_LEN, RINGBUF_BYTE_SIZE, TASK_COMM_LEN,
};
use tracing::debug;

use super::transport::{sim_channel, SimProducer, SimTransport};
use crate::{
	lifecycle::{HookPoint, ProbeBackend},
	Error, Result,
};

// region:    --- Fixtures

/// A simulated faulting task.
#[derive(Clone, Debug)]
pub struct SimTask {
	pub pid: u32,
	pub tid: u32,
	pub comm: String,
}

impl SimTask {
	pub fn new(pid: u32, comm: impl Into<String>) -> Self {
		Self {
			pid,
			tid: pid,
			comm: comm.into(),
		}
	}
}

impl TaskInfo for SimTask {
	fn pid_tgid(&self) -> u64 {
		((self.pid as u64) << 32) | self.tid as u64
	}

	fn comm(&self) -> [u8; TASK_COMM_LEN] {
		let mut comm = [0u8; TASK_COMM_LEN];
		copy_truncated(&mut comm, self.comm.as_bytes());
		comm
	}
}

#[derive(Clone, Debug)]
pub struct SimMapping {
	/// `None` for anonymous memory.
	pub file: Option<String>,
	pub vm_start: u64,
	pub vm_pgoff: u64,
}

#[derive(Clone, Debug)]
pub struct SimFault {
	pub address: u64,
	pub ip: u64,
	pub error_code: u32,
	pub kernel_mode: bool,
	pub mapping: Option<SimMapping>,
}

struct MappedSimFault<'a> {
	address: u64,
	mapping: &'a SimMapping,
}

impl MappedFault for MappedSimFault<'_> {
	fn address(&self) -> u64 {
		self.address
	}

	fn vm_start(&self) -> u64 {
		self.mapping.vm_start
	}

	fn vm_pgoff(&self) -> u64 {
		self.mapping.vm_pgoff
	}

	fn is_file_backed(&self) -> bool {
		self.mapping.file.is_some()
	}

	fn read_file_name(&self, dst: &mut [u8; FILENAME_LEN]) {
		if let Some(file) = &self.mapping.file {
			copy_truncated(dst, file.as_bytes());
		}
	}
}

// endregion: --- Fixtures

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimFailure {
	Open,
	Load,
	Detach,
	Unload,
}

#[derive(Default)]
struct SimState {
	opened: bool,
	producer: Option<SimProducer>,
	attached: Vec<(u64, HookPoint)>,
	detach_calls: usize,
	unload_calls: usize,
}

/// [`ProbeBackend`] that runs the handlers in process.
pub struct SimBackend {
	kind: TransportKind,
	cpus: usize,
	capacity: usize,
	page_shift: u32,
	unavailable: HashSet<HookPoint>,
	failures: HashSet<SimFailure>,
	state: Arc<Mutex<SimState>>,
	transport: Option<SimTransport>,
	next_link: u64,
}

impl SimBackend {
	pub fn new(kind: TransportKind) -> Self {
		Self {
			kind,
			cpus: 4,
			capacity: RINGBUF_BYTE_SIZE as usize,
			page_shift: DEFAULT_PAGE_SHIFT,
			unavailable: HashSet::new(),
			failures: HashSet::new(),
			state: Arc::new(Mutex::new(SimState::default())),
			transport: None,
			next_link: 1,
		}
	}

	pub fn with_cpus(mut self, cpus: usize) -> Self {
		self.cpus = cpus;
		self
	}

	/// Lane capacity in bytes.
	pub fn with_capacity(mut self, capacity: usize) -> Self {
		self.capacity = capacity;
		self
	}

	pub fn with_page_shift(mut self, page_shift: u32) -> Self {
		self.page_shift = page_shift;
		self
	}

	/// Makes attaching `point` fail, as on a kernel without that hook.
	pub fn with_unavailable(mut self, point: HookPoint) -> Self {
		self.unavailable.insert(point);
		self
	}

	pub fn with_failure(mut self, failure: SimFailure) -> Self {
		self.failures.insert(failure);
		self
	}

	pub fn kernel(&self) -> SimKernel {
		SimKernel {
			state: self.state.clone(),
			page_shift: self.page_shift,
		}
	}

	fn state(&self) -> Result<MutexGuard<'_, SimState>> {
		Ok(self.state.lock()?)
	}

	fn inject(&self, failure: SimFailure) -> Result<()> {
		match self.failures.contains(&failure) {
			true => Err(Error::custom(format!("injected {failure:?} failure").to_lowercase())),
			false => Ok(()),
		}
	}
}

impl ProbeBackend for SimBackend {
	type Link = u64;
	type Transport = SimTransport;

	fn open(&mut self) -> Result<()> {
		self.inject(SimFailure::Open)?;
		self.state()?.opened = true;
		Ok(())
	}

	fn load(&mut self) -> Result<()> {
		self.inject(SimFailure::Load)?;
		let (producer, transport) = sim_channel(self.kind, self.cpus, self.capacity);
		self.state()?.producer = Some(producer);
		self.transport = Some(transport);
		Ok(())
	}

	fn attach(&mut self, point: &HookPoint) -> Result<u64> {
		if self.unavailable.contains(point) {
			return Err(Error::custom(format!("{point} does not exist")));
		}
		let link = self.next_link;
		self.next_link += 1;
		self.state()?.attached.push((link, *point));
		debug!("sim attached {point} as link {link}");
		Ok(link)
	}

	fn detach(&mut self, link: u64) -> Result<()> {
		let mut state = self.state()?;
		state.detach_calls += 1;
		state.attached.retain(|(id, _)| *id != link);
		drop(state);
		self.inject(SimFailure::Detach)
	}

	fn take_transport(&mut self) -> Result<SimTransport> {
		self.transport.take().ok_or(Error::TransportTaken)
	}

	fn dropped_events(&self) -> Result<u64> {
		let state = self.state()?;
		Ok(state.producer.as_ref().map(|p| p.dropped()).unwrap_or(0))
	}

	fn unload(&mut self) -> Result<()> {
		let mut state = self.state()?;
		state.unload_calls += 1;
		state.opened = false;
		state.producer = None;
		drop(state);
		self.transport = None;
		self.inject(SimFailure::Unload)
	}
}

/// Fires the attached handlers for synthetic faults.
#[derive(Clone)]
pub struct SimKernel {
	state: Arc<Mutex<SimState>>,
	page_shift: u32,
}

impl SimKernel {
	/// Runs every handler attached to a hook this fault would trigger, on `cpu`.
	/// Returns one outcome per handler run.
	pub fn fault(&self, cpu: usize, task: &SimTask, fault: &SimFault) -> Result<Vec<Outcome>> {
		let state = self.state.lock()?;
		let Some(producer) = state.producer.as_ref() else {
			return Ok(Vec::new());
		};
		let sink = producer.on_cpu(cpu);

		let mut outcomes = Vec::new();
		for (_, point) in state.attached.iter() {
			let hook_source = match *point {
				HookPoint::FILEMAP_FAULT => {
					if let Some(mapping) = &fault.mapping {
						let mapped = MappedSimFault {
							address: fault.address,
							mapping,
						};
						outcomes.push(on_filemap_fault(task, &mapped, &sink, self.page_shift));
					}
					continue;
				}
				HookPoint::PAGE_FAULT_USER if !fault.kernel_mode => FaultSource::UserTracepoint,
				HookPoint::PAGE_FAULT_KERNEL if fault.kernel_mode => FaultSource::KernelTracepoint,
				HookPoint::DO_PAGE_FAULT => FaultSource::FallbackProbe,
				_ => continue,
			};

			let args = HookArgs {
				source: hook_source,
				address: fault.address,
				ip: fault.ip,
				error_code: fault.error_code,
			};
			outcomes.push(on_fault_hook(task, args, &sink));
		}

		Ok(outcomes)
	}

	pub fn attached(&self) -> Result<Vec<HookPoint>> {
		Ok(self.state.lock()?.attached.iter().map(|(_, point)| *point).collect())
	}

	pub fn is_loaded(&self) -> Result<bool> {
		Ok(self.state.lock()?.producer.is_some())
	}

	pub fn is_opened(&self) -> Result<bool> {
		Ok(self.state.lock()?.opened)
	}

	pub fn detach_calls(&self) -> Result<usize> {
		Ok(self.state.lock()?.detach_calls)
	}

	pub fn unload_calls(&self) -> Result<usize> {
		Ok(self.state.lock()?.unload_calls)
	}
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>; // For tests.

	use super::*;
	use crate::{
		lifecycle::{Controller, HookSet},
		sim::record_charge,
	};
	use pagewatch_common::FAULT_EVENT_SIZE;

	fn fx_fault(mapping: Option<SimMapping>) -> SimFault {
		SimFault {
			address: 0x7f00_0000_1000,
			ip: 0x55_0000_1234,
			error_code: 0x4,
			kernel_mode: false,
			mapping,
		}
	}

	fn fx_file_mapping() -> SimMapping {
		SimMapping {
			file: Some("data.bin".to_string()),
			vm_start: 0x7f00_0000_0000,
			vm_pgoff: 0,
		}
	}

	#[test]
	fn only_matching_hooks_fire() -> Result<()> {
		// -- Setup & Fixtures
		let backend = SimBackend::new(TransportKind::RingBuf);
		let kernel = backend.kernel();
		let mut ctrl = Controller::new(backend);
		ctrl.start(HookSet::All)?;
		let fx_task = SimTask::new(1, "init");

		// -- Exec
		let user_file = kernel.fault(0, &fx_task, &fx_fault(Some(fx_file_mapping())))?;
		let user_anon = kernel.fault(0, &fx_task, &fx_fault(None))?;
		let kernel_anon = kernel.fault(
			0,
			&fx_task,
			&SimFault {
				kernel_mode: true,
				..fx_fault(None)
			},
		)?;

		// -- Check
		assert_eq!(user_file, [Outcome::Emitted, Outcome::Emitted]);
		assert_eq!(user_anon, [Outcome::Emitted]);
		assert_eq!(kernel_anon, [Outcome::Emitted]);

		Ok(())
	}

	#[test]
	fn anonymous_mapping_is_skipped_by_filemap_hook() -> Result<()> {
		// -- Setup & Fixtures
		let backend = SimBackend::new(TransportKind::RingBuf);
		let kernel = backend.kernel();
		let mut ctrl = Controller::new(backend);
		ctrl.start(HookSet::FileMap)?;
		let fx_mapping = SimMapping {
			file: None,
			..fx_file_mapping()
		};

		// -- Exec
		let outcomes = kernel.fault(0, &SimTask::new(2, "anon"), &fx_fault(Some(fx_mapping)))?;

		// -- Check
		assert_eq!(outcomes, [Outcome::Skipped]);

		Ok(())
	}

	#[test]
	fn full_transport_counts_drops() -> Result<()> {
		// -- Setup & Fixtures
		let backend = SimBackend::new(TransportKind::RingBuf).with_capacity(record_charge(FAULT_EVENT_SIZE));
		let kernel = backend.kernel();
		let mut ctrl = Controller::new(backend);
		ctrl.start(HookSet::Generic)?;
		let fx_task = SimTask::new(3, "burst");

		// -- Exec
		let first = kernel.fault(0, &fx_task, &fx_fault(None))?;
		let second = kernel.fault(0, &fx_task, &fx_fault(None))?;

		// -- Check
		assert_eq!(first, [Outcome::Emitted]);
		assert_eq!(second, [Outcome::Dropped]);
		assert_eq!(ctrl.dropped_events()?, 1);

		Ok(())
	}

	#[test]
	fn faults_after_unload_go_nowhere() -> Result<()> {
		// -- Setup & Fixtures
		let backend = SimBackend::new(TransportKind::RingBuf);
		let kernel = backend.kernel();
		let mut ctrl = Controller::new(backend);
		ctrl.start(HookSet::Auto)?;
		ctrl.teardown()?;

		// -- Exec
		let outcomes = kernel.fault(0, &SimTask::new(4, "late"), &fx_fault(Some(fx_file_mapping())))?;

		// -- Check
		assert!(outcomes.is_empty());
		assert!(!kernel.is_opened()?);

		Ok(())
	}
}

// endregion: --- Tests
