use aya_ebpf::helpers::{bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes};
use pagewatch_common::{probe::MappedFault, KernelLayout, FILENAME_LEN};

#[inline(always)]
unsafe fn read_at<T: Copy>(base: *const u8, offset: u32) -> Result<T, i64> {
	if base.is_null() {
		return Err(-1);
	}
	bpf_probe_read_kernel(base.add(offset as usize) as *const T)
}

/// `struct vm_fault` snapshot taken at `filemap_fault` entry.
pub struct KernelFault {
	address: u64,
	vm_start: u64,
	vm_pgoff: u64,
	vm_file: *const u8,
	file_dentry: u32,
	dentry_name: u32,
}

impl KernelFault {
	#[inline(always)]
	pub fn read(vmf: *const u8, layout: &KernelLayout) -> Result<Self, i64> {
		unsafe {
			let vma: *const u8 = read_at(vmf, layout.vm_fault_vma)?;
			let address: u64 = read_at(vmf, layout.vm_fault_address)?;
			let vm_start: u64 = read_at(vma, layout.vma_vm_start)?;
			let vm_pgoff: u64 = read_at(vma, layout.vma_vm_pgoff)?;
			let vm_file: *const u8 = read_at(vma, layout.vma_vm_file)?;

			Ok(Self {
				address,
				vm_start,
				vm_pgoff,
				vm_file,
				file_dentry: layout.file_dentry,
				dentry_name: layout.dentry_name,
			})
		}
	}

	#[inline(always)]
	unsafe fn name_ptr(&self) -> Result<*const u8, i64> {
		let dentry: *const u8 = read_at(self.vm_file, self.file_dentry)?;
		let name: *const u8 = read_at(dentry, self.dentry_name)?;
		if name.is_null() {
			return Err(-1);
		}
		Ok(name)
	}
}

impl MappedFault for KernelFault {
	#[inline(always)]
	fn address(&self) -> u64 {
		self.address
	}

	#[inline(always)]
	fn vm_start(&self) -> u64 {
		self.vm_start
	}

	#[inline(always)]
	fn vm_pgoff(&self) -> u64 {
		self.vm_pgoff
	}

	#[inline(always)]
	fn is_file_backed(&self) -> bool {
		!self.vm_file.is_null()
	}

	#[inline(always)]
	fn read_file_name(&self, dst: &mut [u8; FILENAME_LEN]) {
		let copied = unsafe {
			match self.name_ptr() {
				Ok(name) => bpf_probe_read_kernel_str_bytes(name, dst).is_ok(),
				Err(_) => false,
			}
		};
		if !copied {
			*dst = [0u8; FILENAME_LEN];
		}
	}
}
