use std::{
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
	time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use flume::{Receiver, Sender, TryRecvError};
use pagewatch_common::{
	probe::{EventSink, EventSlot},
	FaultEvent, TransportKind, FAULT_EVENT_SIZE,
};
use tokio::time;
use zerocopy::IntoBytes;

use crate::{transport::Transport, Result};

const RECORD_HEADER_LEN: usize = 8;

/// Size of a perf sample body holding one record (u32 size prefix plus data,
/// padded to 8 bytes, minus the prefix).
pub const PERF_SAMPLE_LEN: usize = (FAULT_EVENT_SIZE + 4 + 7) / 8 * 8 - 4;

/// Bytes a record of `len` bytes takes in a lane: header plus data, 8 byte aligned.
pub const fn record_charge(len: usize) -> usize {
	(len + RECORD_HEADER_LEN + 7) & !7
}

struct Lane {
	tx: Sender<Bytes>,
	rx: Receiver<Bytes>,
	used: AtomicUsize,
	capacity: usize,
	dropped: AtomicU64,
}

impl Lane {
	fn new(capacity: usize) -> Self {
		let (tx, rx) = flume::unbounded();
		Self {
			tx,
			rx,
			used: AtomicUsize::new(0),
			capacity,
			dropped: AtomicU64::new(0),
		}
	}

	fn try_charge(&self, charge: usize) -> bool {
		self.used
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
				(used + charge <= self.capacity).then_some(used + charge)
			})
			.is_ok()
	}

	fn release(&self, charge: usize) {
		self.used.fetch_sub(charge, Ordering::AcqRel);
	}
}

struct Shared {
	kind: TransportKind,
	lanes: Vec<Lane>,
	doorbell_tx: Sender<()>,
	doorbell_rx: Receiver<()>,
}

impl Shared {
	fn lane_for(&self, cpu: usize) -> usize {
		match self.kind {
			TransportKind::RingBuf => 0,
			TransportKind::PerCpuArray => cpu % self.lanes.len(),
		}
	}
}

/// Creates a simulated transport. `capacity` is in bytes, for the single ring
/// or for each CPU lane.
pub fn sim_channel(kind: TransportKind, cpus: usize, capacity: usize) -> (SimProducer, SimTransport) {
	let lanes = match kind {
		TransportKind::RingBuf => 1,
		TransportKind::PerCpuArray => cpus.max(1),
	};
	let (doorbell_tx, doorbell_rx) = flume::bounded(1);
	let shared = Arc::new(Shared {
		kind,
		lanes: (0..lanes).map(|_| Lane::new(capacity)).collect(),
		doorbell_tx,
		doorbell_rx,
	});

	let producer = SimProducer { shared: shared.clone() };
	let transport = SimTransport { shared, next_lane: 0 };
	(producer, transport)
}

// region:    --- Producer

#[derive(Clone)]
pub struct SimProducer {
	shared: Arc<Shared>,
}

impl SimProducer {
	/// The sink a handler running on `cpu` submits into.
	pub fn on_cpu(&self, cpu: usize) -> CpuSink<'_> {
		CpuSink {
			shared: &self.shared,
			lane: self.shared.lane_for(cpu),
		}
	}

	/// Reservations refused because the lane was full.
	pub fn dropped(&self) -> u64 {
		self.shared.lanes.iter().map(|lane| lane.dropped.load(Ordering::Relaxed)).sum()
	}
}

pub struct CpuSink<'a> {
	shared: &'a Shared,
	lane: usize,
}

impl EventSink for CpuSink<'_> {
	type Slot<'s>
		= SimSlot<'s>
	where
		Self: 's;

	fn reserve(&self) -> Option<SimSlot<'_>> {
		let lane = &self.shared.lanes[self.lane];
		let charge = record_charge(FAULT_EVENT_SIZE);
		if !lane.try_charge(charge) {
			lane.dropped.fetch_add(1, Ordering::Relaxed);
			return None;
		}

		Some(SimSlot {
			shared: self.shared,
			lane,
			event: FaultEvent::zeroed(),
			charge,
			committed: false,
		})
	}
}

/// Reserved room in a lane. Invisible to the consumer until committed,
/// dropping it uncommitted gives the room back.
pub struct SimSlot<'a> {
	shared: &'a Shared,
	lane: &'a Lane,
	event: FaultEvent,
	charge: usize,
	committed: bool,
}

impl EventSlot for SimSlot<'_> {
	fn event_mut(&mut self) -> &mut FaultEvent {
		&mut self.event
	}

	fn commit(mut self) {
		let mut record = BytesMut::with_capacity(PERF_SAMPLE_LEN);
		record.put_slice(self.event.as_bytes());
		if self.shared.kind == TransportKind::PerCpuArray {
			record.put_bytes(0, PERF_SAMPLE_LEN - FAULT_EVENT_SIZE);
		}

		// Unbounded, never blocks. The receiver lives as long as `shared`.
		if self.lane.tx.send(record.freeze()).is_ok() {
			self.committed = true;
		}
		let _ = self.shared.doorbell_tx.try_send(());
	}
}

impl Drop for SimSlot<'_> {
	fn drop(&mut self) {
		if !self.committed {
			self.lane.release(self.charge);
		}
	}
}

// endregion: --- Producer

// region:    --- Consumer

pub struct SimTransport {
	shared: Arc<Shared>,
	next_lane: usize,
}

impl SimTransport {
	/// Round robin over the lanes, one record at a time, so no lane starves.
	fn drain<F>(&mut self, max: usize, on_record: &mut F) -> Result<usize>
	where
		F: FnMut(&[u8]) -> Result<()>,
	{
		let lanes = &self.shared.lanes;
		let mut count = 0;
		let mut idle = 0;
		while count < max && idle < lanes.len() {
			let lane = &lanes[self.next_lane];
			self.next_lane = (self.next_lane + 1) % lanes.len();

			match lane.rx.try_recv() {
				Ok(record) => {
					idle = 0;
					let res = on_record(&record);
					lane.release(record_charge(FAULT_EVENT_SIZE));
					res?;
					count += 1;
				}
				Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => idle += 1,
			}
		}
		Ok(count)
	}
}

impl Transport for SimTransport {
	async fn poll<F>(&mut self, timeout: Duration, max: usize, mut on_record: F) -> Result<usize>
	where
		F: FnMut(&[u8]) -> Result<()>,
	{
		let count = self.drain(max, &mut on_record)?;
		if count > 0 {
			return Ok(count);
		}

		// `shared` keeps a sender alive, so this only ends on a ring or the timeout.
		match time::timeout(timeout, self.shared.doorbell_rx.recv_async()).await {
			Err(_) => Ok(0),
			Ok(_) => self.drain(max, &mut on_record),
		}
	}
}

// endregion: --- Consumer

// region:    --- Tests

#[cfg(test)]
mod tests {
	type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>; // For tests.

	use super::*;
	use crate::decode::{decode, FaultDetail};
	use pagewatch_common::{probe::EventSink, FaultSource};
	use std::time::Instant;

	const FX_TIMEOUT: Duration = Duration::from_millis(20);

	fn fx_event(pid: u32, address: u64) -> FaultEvent {
		let mut evt = FaultEvent::zeroed();
		evt.source = FaultSource::UserTracepoint.as_raw();
		evt.pid = pid;
		evt.tid = pid;
		evt.address = address;
		evt.ip = 0x40_1000;
		evt.error_code = 0x6;
		evt
	}

	fn submit(sink: &CpuSink<'_>, evt: FaultEvent) -> bool {
		match sink.reserve() {
			Some(mut slot) => {
				*slot.event_mut() = evt;
				slot.commit();
				true
			}
			None => false,
		}
	}

	async fn collect(transport: &mut SimTransport, max: usize) -> Result<Vec<Vec<u8>>> {
		let mut out = Vec::new();
		transport
			.poll(FX_TIMEOUT, max, |bytes| {
				out.push(bytes.to_vec());
				Ok(())
			})
			.await?;
		Ok(out)
	}

	#[tokio::test]
	async fn committed_record_is_byte_identical() -> Result<()> {
		// -- Setup & Fixtures
		let (producer, mut transport) = sim_channel(TransportKind::RingBuf, 1, 4096);
		let fx_evt = fx_event(1234, 0x7f00_0000_1000);

		// -- Exec
		assert!(submit(&producer.on_cpu(0), fx_evt));
		let records = collect(&mut transport, 16).await?;

		// -- Check
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].as_slice(), fx_evt.as_bytes());

		Ok(())
	}

	#[tokio::test]
	async fn perf_lanes_pad_like_perf_samples() -> Result<()> {
		// -- Setup & Fixtures
		let (producer, mut transport) = sim_channel(TransportKind::PerCpuArray, 2, 4096);
		let fx_evt = fx_event(7, 0x1000);

		// -- Exec
		assert!(submit(&producer.on_cpu(1), fx_evt));
		let records = collect(&mut transport, 16).await?;

		// -- Check
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].len(), PERF_SAMPLE_LEN);
		assert_eq!(&records[0][..FAULT_EVENT_SIZE], fx_evt.as_bytes());
		assert_eq!(decode(&records[0])?.pid, 7);

		Ok(())
	}

	#[tokio::test]
	async fn full_lane_refuses_without_blocking() -> Result<()> {
		// -- Setup & Fixtures
		let capacity = 3 * record_charge(FAULT_EVENT_SIZE);
		let (producer, mut transport) = sim_channel(TransportKind::RingBuf, 1, capacity);
		let sink = producer.on_cpu(0);

		// -- Exec
		let start = Instant::now();
		let accepted: Vec<bool> = (0..5).map(|i| submit(&sink, fx_event(i, 0))).collect();
		let elapsed = start.elapsed();

		// -- Check
		assert_eq!(accepted, [true, true, true, false, false]);
		assert!(elapsed < Duration::from_millis(50));
		assert_eq!(producer.dropped(), 2);

		// drained records give their room back
		assert_eq!(collect(&mut transport, 16).await?.len(), 3);
		assert!(submit(&sink, fx_event(9, 0)));

		Ok(())
	}

	#[tokio::test]
	async fn single_producer_order_is_kept() -> Result<()> {
		// -- Setup & Fixtures
		let (producer, mut transport) = sim_channel(TransportKind::RingBuf, 4, 64 * 1024);
		let sink = producer.on_cpu(2);
		for i in 0..50u32 {
			submit(&sink, fx_event(i, i as u64));
		}

		// -- Exec
		let mut pids = Vec::new();
		while pids.len() < 50 {
			let batch = collect(&mut transport, 7).await?;
			if batch.is_empty() {
				break;
			}
			for bytes in batch {
				pids.push(decode(&bytes)?.pid);
			}
		}

		// -- Check
		assert_eq!(pids, (0..50).collect::<Vec<u32>>());

		Ok(())
	}

	#[tokio::test]
	async fn per_cpu_order_is_kept_across_merge() -> Result<()> {
		// -- Setup & Fixtures
		let (producer, mut transport) = sim_channel(TransportKind::PerCpuArray, 2, 64 * 1024);
		for i in 0..10u32 {
			submit(&producer.on_cpu(0), fx_event(i, 0));
			submit(&producer.on_cpu(1), fx_event(100 + i, 0));
		}

		// -- Exec
		let records = collect(&mut transport, 64).await?;
		let pids: Vec<u32> = records.iter().map(|b| decode(b).map(|r| r.pid)).collect::<crate::Result<_>>()?;

		// -- Check
		let cpu0: Vec<u32> = pids.iter().copied().filter(|p| *p < 100).collect();
		let cpu1: Vec<u32> = pids.iter().copied().filter(|p| *p >= 100).collect();
		assert_eq!(cpu0, (0..10).collect::<Vec<u32>>());
		assert_eq!(cpu1, (100..110).collect::<Vec<u32>>());

		Ok(())
	}

	#[tokio::test]
	async fn concurrent_producers_keep_records_intact_and_ordered() -> Result<()> {
		const FX_THREADS: u32 = 4;
		const FX_PER_THREAD: u32 = 500;

		for kind in [TransportKind::RingBuf, TransportKind::PerCpuArray] {
			// -- Setup & Fixtures
			let (producer, mut transport) = sim_channel(kind, FX_THREADS as usize, 256 * 1024);

			// -- Exec
			let handles: Vec<_> = (0..FX_THREADS)
				.map(|t| {
					let producer = producer.clone();
					std::thread::spawn(move || {
						let sink = producer.on_cpu(t as usize);
						let mut accepted = 0usize;
						for seq in 0..FX_PER_THREAD {
							let mut evt = fx_event(seq, ((t as u64) << 32) | seq as u64);
							evt.tid = t;
							evt.comm[0] = b'a' + t as u8;
							if submit(&sink, evt) {
								accepted += 1;
							}
						}
						accepted
					})
				})
				.collect();
			let mut accepted = 0usize;
			for handle in handles {
				accepted += handle.join().map_err(|_| "producer thread panicked")?;
			}

			let mut per_thread: Vec<Vec<u32>> = vec![Vec::new(); FX_THREADS as usize];
			loop {
				let batch = collect(&mut transport, 256).await?;
				if batch.is_empty() {
					break;
				}
				for bytes in batch {
					let record = decode(&bytes)?;
					let t = record.tid;
					assert_eq!(record.address, ((t as u64) << 32) | record.pid as u64);
					assert_eq!(record.comm.as_bytes(), &[b'a' + t as u8]);
					assert_eq!(record.detail, FaultDetail::Hook { ip: 0x40_1000, error_code: 0x6 });
					per_thread[t as usize].push(record.pid);
				}
			}

			// -- Check
			assert_eq!(accepted, (FX_THREADS * FX_PER_THREAD) as usize, "{kind:?}");
			assert_eq!(producer.dropped(), 0, "{kind:?}");
			for seqs in per_thread {
				assert_eq!(seqs, (0..FX_PER_THREAD).collect::<Vec<u32>>(), "{kind:?}");
			}
		}

		Ok(())
	}

	#[tokio::test]
	async fn uncommitted_slot_is_invisible_and_released() -> Result<()> {
		// -- Setup & Fixtures
		let capacity = record_charge(FAULT_EVENT_SIZE);
		let (producer, mut transport) = sim_channel(TransportKind::RingBuf, 1, capacity);
		let sink = producer.on_cpu(0);

		// -- Exec
		let mut slot = sink.reserve().ok_or("first reservation should fit")?;
		slot.event_mut().pid = 55;
		assert!(sink.reserve().is_none());
		let seen = collect(&mut transport, 16).await?;
		drop(slot);

		// -- Check
		assert!(seen.is_empty());
		assert!(submit(&sink, fx_event(56, 0)));
		let records = collect(&mut transport, 16).await?;
		assert_eq!(records.len(), 1);
		assert_eq!(decode(&records[0])?.pid, 56);

		Ok(())
	}

	#[tokio::test]
	async fn empty_poll_returns_after_timeout() -> Result<()> {
		// -- Setup & Fixtures
		let (_producer, mut transport) = sim_channel(TransportKind::RingBuf, 1, 4096);

		// -- Exec
		let start = Instant::now();
		let count = transport.poll(FX_TIMEOUT, 16, |_| Ok(())).await?;
		let elapsed = start.elapsed();

		// -- Check
		assert_eq!(count, 0);
		assert!(elapsed >= FX_TIMEOUT);
		assert!(elapsed < FX_TIMEOUT * 10);

		Ok(())
	}

	#[tokio::test]
	async fn poll_wakes_on_commit() -> Result<()> {
		// -- Setup & Fixtures
		let (producer, mut transport) = sim_channel(TransportKind::RingBuf, 1, 4096);
		let fx_evt = fx_event(31, 0x31000);

		// -- Exec
		let handle = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(5)).await;
			submit(&producer.on_cpu(0), fx_evt)
		});
		let mut seen = Vec::new();
		transport
			.poll(Duration::from_secs(2), 16, |bytes| {
				seen.push(bytes.to_vec());
				Ok(())
			})
			.await?;

		// -- Check
		assert!(handle.await?);
		assert_eq!(seen.len(), 1);

		Ok(())
	}
}

// endregion: --- Tests
