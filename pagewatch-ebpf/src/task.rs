use aya_ebpf::helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid};
use pagewatch_common::{probe::TaskInfo, TASK_COMM_LEN};

/// The task running on this CPU when the hook fired.
pub struct CurrentTask;

impl TaskInfo for CurrentTask {
	#[inline(always)]
	fn pid_tgid(&self) -> u64 {
		bpf_get_current_pid_tgid()
	}

	#[inline(always)]
	fn comm(&self) -> [u8; TASK_COMM_LEN] {
		bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN])
	}
}
