use std::time::Duration;

use pagewatch::{
	consumer::ConsumerLoop,
	decode::{FaultDetail, FaultRecord},
	lifecycle::{Controller, HookPoint, HookSet},
	report::{ConsoleReporter, Reporter},
	sim::{SimBackend, SimFault, SimKernel, SimMapping, SimTask},
};
use pagewatch_common::{probe::Outcome, FaultSource, TransportKind};
use tokio_util::sync::CancellationToken;

type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>; // For tests.

const FX_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Keeps every record and stops the loop once `expected` arrived.
struct Collect {
	records: Vec<FaultRecord>,
	expected: usize,
	cancel: CancellationToken,
}

impl Reporter for Collect {
	fn report(&mut self, record: &FaultRecord) {
		self.records.push(*record);
		if self.records.len() >= self.expected {
			self.cancel.cancel();
		}
	}
}

fn fx_task() -> SimTask {
	SimTask::new(1234, "testproc")
}

fn fx_file_fault() -> SimFault {
	SimFault {
		address: 0x7f00_0000_1000,
		ip: 0x55_5555_1000,
		error_code: 0x4,
		kernel_mode: false,
		mapping: Some(SimMapping {
			file: Some("data.bin".to_string()),
			vm_start: 0x7f00_0000_0000,
			vm_pgoff: 0,
		}),
	}
}

async fn consume(
	controller: &mut Controller<SimBackend>,
	expected: usize,
	fire: impl FnOnce(&SimKernel) -> Result<()>,
) -> Result<Vec<FaultRecord>> {
	let kernel = controller.backend().kernel();
	let transport = controller.take_transport()?;
	let cancel = CancellationToken::new();
	let reporter = Collect {
		records: Vec::new(),
		expected,
		cancel: cancel.clone(),
	};

	fire(&kernel)?;

	// Guards against a hang if fewer records than expected show up.
	let watchdog = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_secs(2)).await;
		watchdog.cancel();
	});

	let mut consumer = ConsumerLoop::new(transport, reporter, cancel).with_poll_timeout(FX_POLL_TIMEOUT);
	consumer.run().await?;
	Ok(consumer.into_reporter().records)
}

#[tokio::test]
async fn file_backed_fault_end_to_end() -> Result<()> {
	// -- Setup & Fixtures
	let mut controller = Controller::new(SimBackend::new(TransportKind::RingBuf));
	controller.start(HookSet::Auto)?;

	// -- Exec
	let records = consume(&mut controller, 1, |kernel| {
		let outcomes = kernel.fault(0, &fx_task(), &fx_file_fault())?;
		assert_eq!(outcomes, [Outcome::Emitted]);
		Ok(())
	})
	.await?;
	controller.teardown()?;

	// -- Check
	assert_eq!(records.len(), 1);
	let record = &records[0];
	assert_eq!(record.source, FaultSource::FileMap);
	assert_eq!(record.pid, 1234);
	assert_eq!(record.comm.as_bytes(), b"testproc");
	let FaultDetail::FileBacked { filename, file_offset } = record.detail else {
		return Err("expected a file backed record".into());
	};
	assert_eq!(filename.as_bytes(), b"data.bin");
	assert_eq!(file_offset, 0x1000);

	Ok(())
}

#[tokio::test]
async fn file_offset_follows_page_shift() -> Result<()> {
	// -- Setup & Fixtures
	let backend = SimBackend::new(TransportKind::RingBuf).with_page_shift(14);
	let mut controller = Controller::new(backend);
	controller.start(HookSet::FileMap)?;
	let fx_fault = SimFault {
		address: 0x7f00_0000_0210,
		mapping: Some(SimMapping {
			file: Some("big.db".to_string()),
			vm_start: 0x7f00_0000_0000,
			vm_pgoff: 3,
		}),
		..fx_file_fault()
	};

	// -- Exec
	let records = consume(&mut controller, 1, |kernel| {
		assert_eq!(kernel.fault(0, &fx_task(), &fx_fault)?, [Outcome::Emitted]);
		Ok(())
	})
	.await?;
	controller.teardown()?;

	// -- Check
	assert_eq!(records.len(), 1);
	assert_eq!(records[0].file_offset(), Some(0x210 + 3 * 16 * 1024));

	Ok(())
}

#[tokio::test]
async fn generic_hooks_over_per_cpu_buffers() -> Result<()> {
	// -- Setup & Fixtures
	let backend = SimBackend::new(TransportKind::PerCpuArray)
		.with_cpus(2)
		.with_unavailable(HookPoint::FILEMAP_FAULT);
	let mut controller = Controller::new(backend);
	controller.start(HookSet::Auto)?;

	// -- Exec
	let records = consume(&mut controller, 4, |kernel| {
		for (cpu, kernel_mode) in [(0, false), (1, true), (0, false), (1, false)] {
			let fault = SimFault {
				kernel_mode,
				..fx_file_fault()
			};
			kernel.fault(cpu, &fx_task(), &fault)?;
		}
		Ok(())
	})
	.await?;

	// -- Check
	assert_eq!(records.len(), 4);
	let kernel_faults = records.iter().filter(|r| r.source == FaultSource::KernelTracepoint).count();
	assert_eq!(kernel_faults, 1);
	for record in &records {
		assert!(matches!(record.detail, FaultDetail::Hook { error_code: 0x4, .. }));
		assert_eq!(record.filename(), None);
	}

	Ok(())
}

#[tokio::test]
async fn all_hooks_report_both_shapes() -> Result<()> {
	// -- Setup & Fixtures
	let mut controller = Controller::new(SimBackend::new(TransportKind::RingBuf));
	controller.start(HookSet::All)?;

	// -- Exec
	let records = consume(&mut controller, 2, |kernel| {
		kernel.fault(0, &fx_task(), &fx_file_fault())?;
		Ok(())
	})
	.await?;

	// -- Check
	let mut sources: Vec<FaultSource> = records.iter().map(|r| r.source).collect();
	sources.sort_by_key(|s| s.as_raw());
	assert_eq!(sources, [FaultSource::UserTracepoint, FaultSource::FileMap]);

	Ok(())
}

#[tokio::test]
async fn overload_drops_at_producer() -> Result<()> {
	// -- Setup & Fixtures
	let backend = SimBackend::new(TransportKind::RingBuf).with_capacity(4 * pagewatch::sim::record_charge(88));
	let mut controller = Controller::new(backend);
	controller.start(HookSet::FileMap)?;

	// -- Exec
	let records = consume(&mut controller, 4, |kernel| {
		for _ in 0..10 {
			kernel.fault(0, &fx_task(), &fx_file_fault())?;
		}
		Ok(())
	})
	.await?;

	// -- Check
	assert_eq!(records.len(), 4);
	assert_eq!(controller.dropped_events()?, 6);

	Ok(())
}

#[tokio::test]
async fn console_output_for_scenario() -> Result<()> {
	// -- Setup & Fixtures
	let mut controller = Controller::new(SimBackend::new(TransportKind::RingBuf));
	controller.start(HookSet::FileMap)?;
	let kernel = controller.backend().kernel();
	let transport = controller.take_transport()?;
	kernel.fault(0, &fx_task(), &fx_file_fault())?;

	let cancel = CancellationToken::new();
	let stopper = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(50)).await;
		stopper.cancel();
	});

	// -- Exec
	let mut consumer =
		ConsumerLoop::new(transport, ConsoleReporter::new(Vec::new()), cancel).with_poll_timeout(FX_POLL_TIMEOUT);
	let stats = consumer.run().await?;

	// -- Check
	assert_eq!(stats.reported, 1);
	let out = String::from_utf8(consumer.into_reporter().into_inner())?;
	assert!(out.starts_with("[     1] FILE "));
	assert!(out.contains("COMM: testproc"));
	assert!(out.contains("FILE: data.bin | OFFSET: 0x1000"));

	Ok(())
}
