use std::{io, time::Duration};

use aya::{
	maps::{
		perf::{PerfEventArray, PerfEventArrayBuffer},
		MapData,
	},
	util::online_cpus,
};
use bytes::BytesMut;
use futures::future;
use pagewatch_common::FAULT_EVENT_SIZE;
use tokio::{io::unix::AsyncFd, time};
use tracing::debug;

use super::Transport;
use crate::{Error, Result};

// Perf samples carry up to 7 bytes of alignment padding after the record.
const SAMPLE_CAPACITY: usize = FAULT_EVENT_SIZE + 8;
const READ_BATCH: usize = 64;

/// One perf buffer per online CPU. Per-CPU order is kept, CPUs are merged in
/// CPU index order.
pub struct PerfArrayTransport {
	buffers: Vec<AsyncFd<PerfEventArrayBuffer<MapData>>>,
	scratch: Vec<BytesMut>,
	lost: u64,
}

impl PerfArrayTransport {
	pub fn new(mut array: PerfEventArray<MapData>) -> Result<Self> {
		let cpus = online_cpus().map_err(|(_, e)| e)?;
		let mut buffers = Vec::with_capacity(cpus.len());
		for cpu in cpus {
			let buffer = array.open(cpu, None)?;
			buffers.push(AsyncFd::new(buffer)?);
		}
		if buffers.is_empty() {
			return Err(Error::custom("no online CPU to read perf buffers from"));
		}
		debug!("opened {} perf buffers", buffers.len());

		let scratch = (0..READ_BATCH).map(|_| BytesMut::with_capacity(SAMPLE_CAPACITY)).collect();

		Ok(Self {
			buffers,
			scratch,
			lost: 0,
		})
	}

	fn drain<F>(&mut self, max: usize, on_record: &mut F) -> Result<usize>
	where
		F: FnMut(&[u8]) -> Result<()>,
	{
		let mut count = 0;
		for fd in self.buffers.iter_mut() {
			while count < max && fd.get_ref().readable() {
				let want = (max - count).min(self.scratch.len());
				let out = &mut self.scratch[..want];
				for buf in out.iter_mut() {
					buf.clear();
				}

				let events = fd.get_mut().read_events(out)?;
				self.lost += events.lost as u64;
				for buf in &self.scratch[..events.read] {
					on_record(buf)?;
					count += 1;
				}
				if events.read == 0 {
					break;
				}
			}
		}
		Ok(count)
	}
}

impl Transport for PerfArrayTransport {
	async fn poll<F>(&mut self, timeout: Duration, max: usize, mut on_record: F) -> Result<usize>
	where
		F: FnMut(&[u8]) -> Result<()>,
	{
		let count = self.drain(max, &mut on_record)?;
		if count > 0 {
			return Ok(count);
		}

		{
			let waits = self.buffers.iter().map(|fd| Box::pin(fd.readable()));
			match time::timeout(timeout, future::select_all(waits)).await {
				Err(_) => return Ok(0),
				Ok((Err(e), _, _)) if e.kind() == io::ErrorKind::Interrupted => return Err(Error::Interrupted),
				Ok((ready, _, _)) => ready?.clear_ready(),
			}
		}

		self.drain(max, &mut on_record)
	}

	fn lost(&self) -> u64 {
		self.lost
	}
}
