use aya_ebpf::{
	maps::{ring_buf::RingBufEntry, PerCpuArray, PerfEventArray, RingBuf},
	EbpfContext,
};
use pagewatch_common::{
	probe::{EventSink, EventSlot},
	FaultEvent, TransportKind,
};

/// Producer side of whichever transport user space selected at load time.
pub struct Sink<'c, C> {
	ctx: &'c C,
	kind: TransportKind,
	ring: &'static RingBuf,
	perf: &'static PerfEventArray<FaultEvent>,
}

impl<'c, C: EbpfContext> Sink<'c, C> {
	#[inline(always)]
	pub fn new(
		ctx: &'c C,
		kind: TransportKind,
		ring: &'static RingBuf,
		perf: &'static PerfEventArray<FaultEvent>,
	) -> Self {
		Self { ctx, kind, ring, perf }
	}
}

pub enum Slot<'c, C> {
	Ring(RingBufEntry<FaultEvent>),
	/// Perf samples are copied out in one go, the record is staged on the stack.
	Perf {
		ctx: &'c C,
		perf: &'static PerfEventArray<FaultEvent>,
		event: FaultEvent,
	},
}

impl<C: EbpfContext> EventSlot for Slot<'_, C> {
	#[inline(always)]
	fn event_mut(&mut self) -> &mut FaultEvent {
		match self {
			Slot::Ring(entry) => unsafe { &mut *entry.as_mut_ptr() },
			Slot::Perf { event, .. } => event,
		}
	}

	#[inline(always)]
	fn commit(self) {
		match self {
			Slot::Ring(entry) => entry.submit(0),
			Slot::Perf { ctx, perf, event } => perf.output(ctx, &event, 0),
		}
	}
}

impl<'c, C: EbpfContext> EventSink for Sink<'c, C> {
	type Slot<'a>
		= Slot<'c, C>
	where
		Self: 'a;

	#[inline(always)]
	fn reserve(&self) -> Option<Slot<'c, C>> {
		match self.kind {
			TransportKind::RingBuf => {
				let mut entry = self.ring.reserve::<FaultEvent>(0)?;
				entry.write(FaultEvent::zeroed());
				Some(Slot::Ring(entry))
			}
			TransportKind::PerCpuArray => Some(Slot::Perf {
				ctx: self.ctx,
				perf: self.perf,
				event: FaultEvent::zeroed(),
			}),
		}
	}
}

/// Adds one to this CPU's drop counter.
#[inline(always)]
pub fn count_drop(dropped: &PerCpuArray<u64>) {
	if let Some(counter) = dropped.get_ptr_mut(0) {
		unsafe { *counter += 1 };
	}
}
