use std::fmt;

use clap::ValueEnum;

/// Where a probe program gets bound in the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookTarget {
	KProbe { function: &'static str },
	TracePoint { category: &'static str, name: &'static str },
}

/// A probe program and the kernel hook it attaches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookPoint {
	pub program: &'static str,
	pub target: HookTarget,
}

impl HookPoint {
	pub const FILEMAP_FAULT: HookPoint = HookPoint {
		program: "filemap_fault",
		target: HookTarget::KProbe {
			function: "filemap_fault",
		},
	};
	pub const PAGE_FAULT_USER: HookPoint = HookPoint {
		program: "page_fault_user",
		target: HookTarget::TracePoint {
			category: "exceptions",
			name: "page_fault_user",
		},
	};
	pub const PAGE_FAULT_KERNEL: HookPoint = HookPoint {
		program: "page_fault_kernel",
		target: HookTarget::TracePoint {
			category: "exceptions",
			name: "page_fault_kernel",
		},
	};
	pub const DO_PAGE_FAULT: HookPoint = HookPoint {
		program: "do_page_fault",
		target: HookTarget::KProbe {
			function: "do_page_fault",
		},
	};

	/// Every program in the probe object.
	pub const ALL: [HookPoint; 4] = [
		Self::FILEMAP_FAULT,
		Self::PAGE_FAULT_USER,
		Self::PAGE_FAULT_KERNEL,
		Self::DO_PAGE_FAULT,
	];
}

impl fmt::Display for HookPoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.target {
			HookTarget::KProbe { function } => write!(f, "kprobe/{function}"),
			HookTarget::TracePoint { category, name } => write!(f, "tracepoint/{category}/{name}"),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookStep {
	/// Must attach, failure aborts the start.
	Required(HookPoint),
	/// Attach every point that is available. Only when none of them attaches
	/// are the `fallback` steps run.
	AnyOf {
		points: Vec<HookPoint>,
		fallback: Vec<HookStep>,
	},
}

/// Which hook families to run.
///
/// The precise and the generic families are alternatives unless `all` is
/// asked for, in which case one fault can be reported twice with different
/// shapes. Records are never deduplicated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum HookSet {
	/// `filemap_fault` when it attaches, the generic family otherwise.
	#[default]
	Auto,
	#[value(name = "filemap")]
	FileMap,
	Generic,
	All,
}

impl HookSet {
	pub fn plan(self) -> Vec<HookStep> {
		match self {
			HookSet::Auto => vec![HookStep::AnyOf {
				points: vec![HookPoint::FILEMAP_FAULT],
				fallback: vec![generic_step()],
			}],
			HookSet::FileMap => vec![HookStep::Required(HookPoint::FILEMAP_FAULT)],
			HookSet::Generic => vec![generic_step()],
			HookSet::All => vec![
				HookStep::AnyOf {
					points: vec![HookPoint::FILEMAP_FAULT],
					fallback: Vec::new(),
				},
				generic_step(),
			],
		}
	}
}

fn generic_step() -> HookStep {
	HookStep::AnyOf {
		points: vec![HookPoint::PAGE_FAULT_USER, HookPoint::PAGE_FAULT_KERNEL],
		fallback: vec![HookStep::Required(HookPoint::DO_PAGE_FAULT)],
	}
}

// region:    --- Tests


// endregion: --- Tests
