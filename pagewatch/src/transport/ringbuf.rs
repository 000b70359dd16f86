use std::{io, time::Duration};

use aya::maps::{MapData, RingBuf};
use tokio::{io::unix::AsyncFd, time};

use super::Transport;
use crate::{Error, Result};

/// One shared ring, records come out in commit order.
pub struct RingBufTransport {
	fd: AsyncFd<RingBuf<MapData>>,
}

impl RingBufTransport {
	pub fn new(ring: RingBuf<MapData>) -> Result<Self> {
		Ok(Self {
			fd: AsyncFd::new(ring)?,
		})
	}
}

impl Transport for RingBufTransport {
	async fn poll<F>(&mut self, timeout: Duration, max: usize, mut on_record: F) -> Result<usize>
	where
		F: FnMut(&[u8]) -> Result<()>,
	{
		let mut guard = match time::timeout(timeout, self.fd.readable_mut()).await {
			Err(_) => return Ok(0),
			Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => return Err(Error::Interrupted),
			Ok(guard) => guard?,
		};

		let ring = guard.get_inner_mut();
		let mut count = 0;
		let mut drained = false;
		while count < max {
			let Some(item) = ring.next() else {
				drained = true;
				break;
			};
			on_record(&item)?;
			count += 1;
		}

		// Leave readiness set while records remain so the next poll returns at once.
		if drained {
			guard.clear_ready();
		}

		Ok(count)
	}
}
