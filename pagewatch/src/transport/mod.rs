//! Consumer side of the probe-to-user-space transports.
//!
//! Every transport delivers raw record bytes in per-source FIFO order. Records
//! from different CPUs carry no global order.

// region:    --- Modules
mod perf;
mod ringbuf;

pub use perf::PerfArrayTransport;
pub use ringbuf::RingBufTransport;
// endregion: --- Modules

use std::time::Duration;

use crate::Result;

pub trait Transport {
	/// Waits up to `timeout` for records and hands at most `max` of them to
	/// `on_record`, in delivery order. Returns how many were handed over.
	///
	/// An error from `on_record` stops the poll and is returned as is.
	#[allow(async_fn_in_trait)]
	async fn poll<F>(&mut self, timeout: Duration, max: usize, on_record: F) -> Result<usize>
	where
		F: FnMut(&[u8]) -> Result<()>;

	/// Records the consumer side knows were lost, if the transport reports it.
	fn lost(&self) -> u64 {
		0
	}
}

/// The kernel transport picked at load time.
pub enum AyaTransport {
	RingBuf(RingBufTransport),
	PerfArray(PerfArrayTransport),
}

impl Transport for AyaTransport {
	async fn poll<F>(&mut self, timeout: Duration, max: usize, on_record: F) -> Result<usize>
	where
		F: FnMut(&[u8]) -> Result<()>,
	{
		match self {
			AyaTransport::RingBuf(ring) => ring.poll(timeout, max, on_record).await,
			AyaTransport::PerfArray(perf) => perf.poll(timeout, max, on_record).await,
		}
	}

	fn lost(&self) -> u64 {
		match self {
			AyaTransport::RingBuf(ring) => ring.lost(),
			AyaTransport::PerfArray(perf) => perf.lost(),
		}
	}
}
