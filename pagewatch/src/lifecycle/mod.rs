//! Probe lifecycle: open, load, attach, and the teardown that undoes them.

// region:    --- Modules
mod ebpf;
mod hooks;

pub use ebpf::{AyaBackend, AyaLink, ObjectSource};
pub use hooks::{HookPoint, HookSet, HookStep, HookTarget};
// endregion: --- Modules

use tracing::{debug, info, warn};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
	Unloaded,
	Opened,
	Loaded,
	Attached,
	/// Terminal. Reached through teardown only.
	Detached,
}

/// The attach capability the [`Controller`] drives.
pub trait ProbeBackend {
	type Link;
	type Transport;

	fn open(&mut self) -> Result<()>;
	fn load(&mut self) -> Result<()>;
	fn attach(&mut self, point: &HookPoint) -> Result<Self::Link>;
	fn detach(&mut self, link: Self::Link) -> Result<()>;
	/// Hands out the consumer side of the transport. Only valid once loaded.
	fn take_transport(&mut self) -> Result<Self::Transport>;
	/// Records discarded by the probe handlers because the transport was full.
	fn dropped_events(&self) -> Result<u64>;
	fn unload(&mut self) -> Result<()>;
}

pub struct Controller<B: ProbeBackend> {
	backend: B,
	stage: Stage,
	links: Vec<(HookPoint, B::Link)>,
}

impl<B: ProbeBackend> Controller<B> {
	pub fn new(backend: B) -> Self {
		Self {
			backend,
			stage: Stage::Unloaded,
			links: Vec::new(),
		}
	}

	pub fn stage(&self) -> Stage {
		self.stage
	}

	pub fn backend(&self) -> &B {
		&self.backend
	}

	pub fn attached(&self) -> impl Iterator<Item = &HookPoint> {
		self.links.iter().map(|(point, _)| point)
	}

	/// open, load and attach `hooks`. Any failure tears down what was already
	/// set up before the error is returned.
	pub fn start(&mut self, hooks: HookSet) -> Result<()> {
		self.open()?;
		self.load()?;
		self.attach(hooks)
	}

	pub fn open(&mut self) -> Result<()> {
		self.expect_stage(Stage::Unloaded, Stage::Opened)?;
		// A failed open leaves nothing behind to unwind.
		self.backend.open()?;
		self.stage = Stage::Opened;
		debug!("probe object opened");
		Ok(())
	}

	pub fn load(&mut self) -> Result<()> {
		self.expect_stage(Stage::Opened, Stage::Loaded)?;
		if let Err(err) = self.backend.load() {
			self.unwind();
			return Err(err);
		}
		self.stage = Stage::Loaded;
		debug!("probe object loaded");
		Ok(())
	}

	pub fn attach(&mut self, hooks: HookSet) -> Result<()> {
		self.expect_stage(Stage::Loaded, Stage::Attached)?;

		let attached = hooks.plan().iter().try_for_each(|step| self.run_step(step));
		let attached = attached.and_then(|_| match self.links.is_empty() {
			true => Err(Error::NoHookAttached),
			false => Ok(()),
		});
		if let Err(err) = attached {
			self.unwind();
			return Err(err);
		}

		self.stage = Stage::Attached;
		for point in self.attached() {
			info!("attached {point}");
		}
		Ok(())
	}

	pub fn take_transport(&mut self) -> Result<B::Transport> {
		match self.stage {
			Stage::Loaded | Stage::Attached => self.backend.take_transport(),
			from => Err(Error::InvalidTransition {
				from,
				to: Stage::Attached,
			}),
		}
	}

	pub fn dropped_events(&self) -> Result<u64> {
		self.backend.dropped_events()
	}

	/// Detaches every link and unloads the object. All steps run even when
	/// one fails, the first failure is returned. Calling it again is a no-op.
	pub fn teardown(&mut self) -> Result<()> {
		if matches!(self.stage, Stage::Unloaded | Stage::Detached) {
			return Ok(());
		}

		let mut first_err = None;
		for (point, link) in self.links.drain(..).rev() {
			match self.backend.detach(link) {
				Ok(()) => debug!("detached {point}"),
				Err(err) => {
					warn!("detach {point} failed: {err}");
					first_err.get_or_insert(err);
				}
			}
		}
		if let Err(err) = self.backend.unload() {
			warn!("unload failed: {err}");
			first_err.get_or_insert(err);
		}
		self.stage = Stage::Detached;

		match first_err {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	fn unwind(&mut self) {
		if let Err(err) = self.teardown() {
			warn!("teardown after failed start: {err}");
		}
	}

	fn expect_stage(&self, expected: Stage, to: Stage) -> Result<()> {
		match self.stage == expected {
			true => Ok(()),
			false => Err(Error::InvalidTransition { from: self.stage, to }),
		}
	}

	fn run_step(&mut self, step: &HookStep) -> Result<()> {
		match step {
			HookStep::Required(point) => {
				let link = self.backend.attach(point)?;
				self.links.push((*point, link));
				Ok(())
			}
			HookStep::AnyOf { points, fallback } => {
				let mut any = false;
				for point in points {
					match self.backend.attach(point) {
						Ok(link) => {
							self.links.push((*point, link));
							any = true;
						}
						Err(err) => info!("{point} unavailable: {err}"),
					}
				}
				if any {
					return Ok(());
				}
				fallback.iter().try_for_each(|step| self.run_step(step))
			}
		}
	}
}

impl<B: ProbeBackend> Drop for Controller<B> {
	fn drop(&mut self) {
		if let Err(err) = self.teardown() {
			warn!("teardown on drop failed: {err}");
		}
	}
}

// region:    --- Tests


// endregion: --- Tests
