use crate::DEFAULT_PAGE_SHIFT;

/// Byte offsets of the kernel struct members the file-backed handler reads.
///
/// Discovered from kernel BTF in user space and written into the probe object
/// as the `FAULT_LAYOUT` global before load. Nested members are pre-summed:
/// `file_dentry` is `file.f_path` + `path.dentry`, `dentry_name` is
/// `dentry.d_name` + `qstr.name`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLayout {
	pub vm_fault_vma: u32,
	pub vm_fault_address: u32,
	pub vma_vm_start: u32,
	pub vma_vm_pgoff: u32,
	pub vma_vm_file: u32,
	pub file_dentry: u32,
	pub dentry_name: u32,
	pub page_shift: u32,
	pub resolved: u32,
	pub _pad: u32,
}

impl KernelLayout {
	pub const fn zeroed() -> Self {
		Self {
			vm_fault_vma: 0,
			vm_fault_address: 0,
			vma_vm_start: 0,
			vma_vm_pgoff: 0,
			vma_vm_file: 0,
			file_dentry: 0,
			dentry_name: 0,
			page_shift: DEFAULT_PAGE_SHIFT,
			resolved: 0,
			_pad: 0,
		}
	}

	pub const fn is_resolved(&self) -> bool {
		self.resolved != 0
	}
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for KernelLayout {}
