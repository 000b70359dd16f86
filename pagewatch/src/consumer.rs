//! The poll loop that owns the read side of the transport.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
	decode::decode,
	report::{RecordFilter, Reporter},
	transport::Transport,
	Error, Result,
};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_BATCH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
	Idle,
	Polling,
	ShuttingDown,
	Stopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
	pub polls: u64,
	pub received: u64,
	pub reported: u64,
	pub filtered: u64,
	/// As reported by the transport.
	pub lost: u64,
}

pub struct ConsumerLoop<T, R> {
	transport: T,
	reporter: R,
	filter: RecordFilter,
	cancel: CancellationToken,
	poll_timeout: Duration,
	batch: usize,
	state: LoopState,
	stats: LoopStats,
}

impl<T: Transport, R: Reporter> ConsumerLoop<T, R> {
	pub fn new(transport: T, reporter: R, cancel: CancellationToken) -> Self {
		Self {
			transport,
			reporter,
			filter: RecordFilter::default(),
			cancel,
			poll_timeout: DEFAULT_POLL_TIMEOUT,
			batch: DEFAULT_BATCH,
			state: LoopState::Idle,
			stats: LoopStats::default(),
		}
	}

	pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
		self.poll_timeout = poll_timeout;
		self
	}

	pub fn with_batch(mut self, batch: usize) -> Self {
		self.batch = batch;
		self
	}

	pub fn with_filter(mut self, filter: RecordFilter) -> Self {
		self.filter = filter;
		self
	}

	pub fn state(&self) -> LoopState {
		self.state
	}

	pub fn stats(&self) -> LoopStats {
		self.stats
	}

	pub fn reporter(&self) -> &R {
		&self.reporter
	}

	pub fn into_reporter(self) -> R {
		self.reporter
	}

	/// Polls until the token is cancelled or a fatal error occurs.
	///
	/// Cancellation is looked at between polls only, so a stop takes at most
	/// one poll timeout plus the batch in flight.
	pub async fn run(&mut self) -> Result<LoopStats> {
		self.state = LoopState::Polling;
		info!("polling every {:?}, batch {}", self.poll_timeout, self.batch);

		let Self {
			transport,
			reporter,
			filter,
			cancel,
			poll_timeout,
			batch,
			stats,
			..
		} = self;

		let res = loop {
			if cancel.is_cancelled() {
				break Ok(());
			}

			stats.polls += 1;
			let polled = transport
				.poll(*poll_timeout, *batch, |bytes| {
					let record = decode(bytes)?;
					stats.received += 1;
					match filter.accepts(&record) {
						true => {
							reporter.report(&record);
							stats.reported += 1;
						}
						false => stats.filtered += 1,
					}
					Ok(())
				})
				.await;

			match polled {
				Ok(_) => {}
				Err(Error::Interrupted) => debug!("poll interrupted"),
				Err(err) => break Err(err),
			}
		};

		self.state = LoopState::ShuttingDown;
		self.stats.lost = self.transport.lost();
		self.state = LoopState::Stopped;
		info!(
			"consumer stopped after {} polls, {} records",
			self.stats.polls, self.stats.received
		);

		res.map(|_| self.stats)
	}
}

// region:    --- Tests


// endregion: --- Tests
