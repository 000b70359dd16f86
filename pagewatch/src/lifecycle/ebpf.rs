use std::{borrow::Cow, fs, path::PathBuf};

use aya::{
	maps::{PerCpuArray, PerfEventArray, RingBuf},
	programs::{kprobe::KProbeLinkId, trace_point::TracePointLinkId, KProbe, TracePoint},
	Ebpf, EbpfLoader,
};
use pagewatch_common::{KernelLayout, TransportKind};
use tracing::{debug, info, warn};

use super::{HookPoint, HookTarget, ProbeBackend};
use crate::{
	layout,
	transport::{AyaTransport, PerfArrayTransport, RingBufTransport},
	Error, Result,
};

/// Where the compiled probe object comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectSource {
	File(PathBuf),
	/// Built and embedded by the build script (`embed-ebpf` feature).
	Embedded,
}

impl ObjectSource {
	pub const DEFAULT_PATH: &'static str = "target/bpfel-unknown-none/release/pagewatch";

	fn read(&self) -> Result<Cow<'static, [u8]>> {
		match self {
			ObjectSource::File(path) => {
				debug!("reading probe object {}", path.display());
				Ok(Cow::Owned(fs::read(path)?))
			}
			ObjectSource::Embedded => embedded(),
		}
	}
}

#[cfg(feature = "embed-ebpf")]
fn embedded() -> Result<Cow<'static, [u8]>> {
	Ok(Cow::Borrowed(aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/pagewatch"))))
}

#[cfg(not(feature = "embed-ebpf"))]
fn embedded() -> Result<Cow<'static, [u8]>> {
	Err(Error::custom("probe object not embedded, rebuild with --features embed-ebpf or pass --object"))
}

pub enum AyaLink {
	KProbe { program: &'static str, id: KProbeLinkId },
	TracePoint { program: &'static str, id: TracePointLinkId },
}

/// [`ProbeBackend`] over the kernel, through aya.
pub struct AyaBackend {
	object: ObjectSource,
	transport: TransportKind,
	page_shift: Option<u32>,
	bytes: Option<Cow<'static, [u8]>>,
	layout: KernelLayout,
	ebpf: Option<Ebpf>,
}

impl AyaBackend {
	pub fn new(object: ObjectSource, transport: TransportKind, page_shift: Option<u32>) -> Self {
		Self {
			object,
			transport,
			page_shift,
			bytes: None,
			layout: KernelLayout::zeroed(),
			ebpf: None,
		}
	}

	fn ebpf_mut(&mut self) -> Result<&mut Ebpf> {
		self.ebpf.as_mut().ok_or_else(|| Error::custom("probe object not loaded"))
	}
}

impl ProbeBackend for AyaBackend {
	type Link = AyaLink;
	type Transport = AyaTransport;

	fn open(&mut self) -> Result<()> {
		let bytes = self.object.read()?;

		let page_shift = self.page_shift.unwrap_or_else(layout::system_page_shift);
		self.layout = match layout::discover(page_shift) {
			Ok(layout) => layout,
			Err(err) => {
				// filemap_fault stays loadable but refuses to attach
				warn!("{err}");
				KernelLayout {
					page_shift,
					..KernelLayout::zeroed()
				}
			}
		};
		self.bytes = Some(bytes);
		Ok(())
	}

	fn load(&mut self) -> Result<()> {
		let bytes = self.bytes.as_deref().ok_or_else(|| Error::custom("probe object not opened"))?;
		let transport = self.transport.as_raw();

		let mut ebpf = EbpfLoader::new()
			.set_global("FAULT_LAYOUT", &self.layout, true)
			.set_global("TRANSPORT", &transport, true)
			.load(bytes)?;
		if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
			// This can happen if you remove all log statements from your eBPF program.
			warn!("failed to initialize eBPF logger: {e}");
		}

		for point in HookPoint::ALL {
			let program = ebpf.program_mut(point.program).ok_or(Error::EbpfProgNotFound)?;
			match point.target {
				HookTarget::KProbe { .. } => {
					let program: &mut KProbe = program.try_into()?;
					program.load()?;
				}
				HookTarget::TracePoint { .. } => {
					let program: &mut TracePoint = program.try_into()?;
					program.load()?;
				}
			}
		}

		self.ebpf = Some(ebpf);
		Ok(())
	}

	fn attach(&mut self, point: &HookPoint) -> Result<AyaLink> {
		if *point == HookPoint::FILEMAP_FAULT && !self.layout.is_resolved() {
			return Err(Error::custom("kernel layout unresolved"));
		}

		let ebpf = self.ebpf_mut()?;
		let program = ebpf.program_mut(point.program).ok_or(Error::EbpfProgNotFound)?;
		let link = match point.target {
			HookTarget::KProbe { function } => {
				let program: &mut KProbe = program.try_into()?;
				AyaLink::KProbe {
					program: point.program,
					id: program.attach(function, 0)?,
				}
			}
			HookTarget::TracePoint { category, name } => {
				let program: &mut TracePoint = program.try_into()?;
				AyaLink::TracePoint {
					program: point.program,
					id: program.attach(category, name)?,
				}
			}
		};
		Ok(link)
	}

	fn detach(&mut self, link: AyaLink) -> Result<()> {
		let ebpf = self.ebpf_mut()?;
		match link {
			AyaLink::KProbe { program, id } => {
				let program: &mut KProbe = ebpf.program_mut(program).ok_or(Error::EbpfProgNotFound)?.try_into()?;
				program.detach(id)?;
			}
			AyaLink::TracePoint { program, id } => {
				let program: &mut TracePoint = ebpf.program_mut(program).ok_or(Error::EbpfProgNotFound)?.try_into()?;
				program.detach(id)?;
			}
		}
		Ok(())
	}

	fn take_transport(&mut self) -> Result<AyaTransport> {
		let kind = self.transport;
		let ebpf = self.ebpf_mut()?;
		let transport = match kind {
			TransportKind::RingBuf => {
				let map = ebpf.take_map("EVENTS").ok_or(Error::MapNotFound("EVENTS"))?;
				AyaTransport::RingBuf(RingBufTransport::new(RingBuf::try_from(map)?)?)
			}
			TransportKind::PerCpuArray => {
				let map = ebpf.take_map("PERF_EVENTS").ok_or(Error::MapNotFound("PERF_EVENTS"))?;
				AyaTransport::PerfArray(PerfArrayTransport::new(PerfEventArray::try_from(map)?)?)
			}
		};
		info!("consuming from {kind:?} transport");
		Ok(transport)
	}

	fn dropped_events(&self) -> Result<u64> {
		let ebpf = self.ebpf.as_ref().ok_or_else(|| Error::custom("probe object not loaded"))?;
		let map = ebpf.map("DROPPED").ok_or(Error::MapNotFound("DROPPED"))?;
		let dropped: PerCpuArray<_, u64> = PerCpuArray::try_from(map)?;
		let per_cpu = dropped.get(&0, 0)?;
		Ok(per_cpu.iter().sum())
	}

	fn unload(&mut self) -> Result<()> {
		// Dropping the object closes every remaining program and map fd.
		self.ebpf = None;
		self.bytes = None;
		Ok(())
	}
}
