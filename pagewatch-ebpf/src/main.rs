#![no_std]
#![no_main]

use aya_ebpf::{
	macros::{kprobe, map, tracepoint},
	maps::{PerCpuArray, PerfEventArray, RingBuf},
	programs::{ProbeContext, TracePointContext},
	EbpfContext,
};
use aya_log_ebpf::debug;
use pagewatch_common::{
	probe::{on_fault_hook, on_filemap_fault, HookArgs, Outcome},
	FaultEvent, FaultSource, KernelLayout, TransportKind, RINGBUF_BYTE_SIZE,
};

mod fault;
mod sink;
mod task;

use fault::KernelFault;
use sink::{count_drop, Sink};
use task::CurrentTask;

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RINGBUF_BYTE_SIZE, 0);

#[map]
static PERF_EVENTS: PerfEventArray<FaultEvent> = PerfEventArray::new(0);

#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

// Both globals are rewritten by the loader.
#[no_mangle]
static FAULT_LAYOUT: KernelLayout = KernelLayout::zeroed();

#[no_mangle]
static TRANSPORT: u32 = 0;

// exceptions/page_fault_{user,kernel} field offsets. These tracepoints only
// exist on x86, elsewhere `auto` attaches the do_page_fault kprobe instead.
const TP_ADDRESS_OFFSET: usize = 8;
const TP_IP_OFFSET: usize = 16;
const TP_ERROR_CODE_OFFSET: usize = 24;

#[kprobe]
pub fn filemap_fault(ctx: ProbeContext) -> u32 {
	match try_filemap_fault(ctx) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[tracepoint]
pub fn page_fault_user(ctx: TracePointContext) -> u32 {
	match try_page_fault_tp(ctx, FaultSource::UserTracepoint) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[tracepoint]
pub fn page_fault_kernel(ctx: TracePointContext) -> u32 {
	match try_page_fault_tp(ctx, FaultSource::KernelTracepoint) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[kprobe]
pub fn do_page_fault(ctx: ProbeContext) -> u32 {
	match try_do_page_fault(ctx) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[inline(always)]
fn transport() -> TransportKind {
	let raw = unsafe { core::ptr::read_volatile(&TRANSPORT) };
	TransportKind::from_raw(raw).unwrap_or(TransportKind::RingBuf)
}

#[inline(always)]
fn sink<C: EbpfContext>(ctx: &C) -> Sink<'_, C> {
	Sink::new(ctx, transport(), &EVENTS, &PERF_EVENTS)
}

#[inline(always)]
fn settle(outcome: Outcome) -> Result<u32, u32> {
	if outcome == Outcome::Dropped {
		count_drop(&DROPPED);
	}
	Ok(0)
}

fn try_filemap_fault(ctx: ProbeContext) -> Result<u32, u32> {
	let layout = unsafe { core::ptr::read_volatile(&FAULT_LAYOUT) };
	if !layout.is_resolved() {
		return Ok(0);
	}

	let vmf: *const u8 = ctx.arg(0).ok_or(1u32)?;
	let fault = match KernelFault::read(vmf, &layout) {
		Ok(fault) => fault,
		Err(e) => {
			debug!(&ctx, "vm_fault read failed ->> ERROR: {}", e);
			return Err(2);
		}
	};

	settle(on_filemap_fault(&CurrentTask, &fault, &sink(&ctx), layout.page_shift))
}

fn try_page_fault_tp(ctx: TracePointContext, source: FaultSource) -> Result<u32, u32> {
	let args = HookArgs::from_reads(
		source,
		unsafe { ctx.read_at::<u64>(TP_ADDRESS_OFFSET) }.ok(),
		unsafe { ctx.read_at::<u64>(TP_IP_OFFSET) }.ok(),
		unsafe { ctx.read_at::<u64>(TP_ERROR_CODE_OFFSET) }.ok(),
	);
	settle(on_fault_hook(&CurrentTask, args, &sink(&ctx)))
}

fn try_do_page_fault(ctx: ProbeContext) -> Result<u32, u32> {
	let args = HookArgs::from_reads(
		FaultSource::FallbackProbe,
		ctx.arg(0),
		Some(instruction_pointer(&ctx)),
		ctx.arg(1),
	);
	settle(on_fault_hook(&CurrentTask, args, &sink(&ctx)))
}

#[inline(always)]
fn instruction_pointer(ctx: &ProbeContext) -> u64 {
	#[cfg(bpf_target_arch = "x86_64")]
	{
		unsafe { (*ctx.regs).rip }
	}
	#[cfg(bpf_target_arch = "aarch64")]
	{
		unsafe { (*ctx.regs).pc }
	}
	#[cfg(not(any(bpf_target_arch = "x86_64", bpf_target_arch = "aarch64")))]
	{
		let _ = ctx;
		0
	}
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
	loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
