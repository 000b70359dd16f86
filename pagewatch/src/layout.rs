//! Kernel struct member offsets for the file-backed fault handler, read from BTF.

use std::{env, path::Path};

use anyhow::{anyhow, Context};
use btf::btf::{Btf, Struct, Type};
use pagewatch_common::{KernelLayout, DEFAULT_PAGE_SHIFT};
use tracing::debug;

use crate::Result;

const KERNEL_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";
const ENV_KERNEL_BTF_PATH: &str = "PAGEWATCH_KERNEL_BTF";

/// Reads the running kernel's BTF, or the file named by `PAGEWATCH_KERNEL_BTF`.
pub fn discover(page_shift: u32) -> Result<KernelLayout> {
	let btf_path = env::var(ENV_KERNEL_BTF_PATH).unwrap_or_else(|_| KERNEL_BTF_PATH.to_string());
	Ok(discover_at(btf_path, page_shift)?)
}

pub fn discover_at(btf_path: impl AsRef<Path>, page_shift: u32) -> anyhow::Result<KernelLayout> {
	let btf_path = btf_path.as_ref().display().to_string();
	let btf = Btf::from_file(btf_path.clone()).with_context(|| format!("failed to load BTF from {btf_path}"))?;

	let vm_fault = expect_named_struct(&btf, "vm_fault")?;
	let (vma_bits, _) = member_offset_deep(&btf, vm_fault, "vma")?;
	let (address_bits, _) = member_offset_deep(&btf, vm_fault, "address")?;

	let vma = expect_named_struct(&btf, "vm_area_struct")?;
	let (vm_start_bits, _) = member_offset_deep(&btf, vma, "vm_start")?;
	let (vm_pgoff_bits, _) = member_offset_deep(&btf, vma, "vm_pgoff")?;
	let (vm_file_bits, _) = member_offset_deep(&btf, vma, "vm_file")?;

	let file = expect_named_struct(&btf, "file")?;
	let (f_path_bits, f_path_type) = member_offset_deep(&btf, file, "f_path")?;
	let path = resolve_struct_deep(&btf, f_path_type)?;
	let (dentry_bits, _) = member_offset_deep(&btf, path, "dentry")?;

	let dentry = expect_named_struct(&btf, "dentry")?;
	let (d_name_bits, d_name_type) = member_offset_deep(&btf, dentry, "d_name")?;
	let qstr = resolve_struct_deep(&btf, d_name_type)?;
	let (name_bits, _) = member_offset_deep(&btf, qstr, "name")?;

	let layout = KernelLayout {
		vm_fault_vma: bytes(vma_bits)?,
		vm_fault_address: bytes(address_bits)?,
		vma_vm_start: bytes(vm_start_bits)?,
		vma_vm_pgoff: bytes(vm_pgoff_bits)?,
		vma_vm_file: bytes(vm_file_bits)?,
		file_dentry: bytes(f_path_bits + dentry_bits)?,
		dentry_name: bytes(d_name_bits + name_bits)?,
		page_shift,
		resolved: 1,
		_pad: 0,
	};
	debug!("kernel layout {layout:?}");

	Ok(layout)
}

/// log2 of the system page size, 4 KiB when it cannot be read.
pub fn system_page_shift() -> u32 {
	let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
	u64::try_from(size).ok().and_then(page_shift_of).unwrap_or(DEFAULT_PAGE_SHIFT)
}

pub fn page_shift_of(page_size: u64) -> Option<u32> {
	page_size.is_power_of_two().then(|| page_size.trailing_zeros())
}

fn bytes(bits: u32) -> anyhow::Result<u32> {
	match bits % 8 {
		0 => Ok(bits / 8),
		_ => Err(anyhow!("member at bit offset {bits} is not byte aligned")),
	}
}

fn member_offset_deep(btf: &Btf, st: &Struct, name: &str) -> anyhow::Result<(u32, u32)> {
	find_member_recursive(btf, st, 0, name)?.ok_or_else(|| anyhow!("member {name} not found"))
}

// Descends into anonymous struct members, which is where newer kernels keep
// `vm_fault.vma` and `vm_fault.address`.
fn find_member_recursive(btf: &Btf, st: &Struct, base_bits: u32, target: &str) -> anyhow::Result<Option<(u32, u32)>> {
	for member in &st.members {
		let member_bits = base_bits + member.offset;
		if member.name.as_deref() == Some(target) {
			return Ok(Some((member_bits, member.type_id)));
		}

		if !is_inline_container(member.name.as_deref()) {
			continue;
		}
		if let Some(inner) = struct_if_inline(btf, member.type_id)? {
			if let Some(found) = find_member_recursive(btf, inner, member_bits, target)? {
				return Ok(Some(found));
			}
		}
	}

	Ok(None)
}

fn is_inline_container(name: Option<&str>) -> bool {
	match name {
		None => true,
		Some(n) => {
			let trimmed = n.trim();
			trimmed.is_empty() || trimmed == "(anon)"
		}
	}
}

fn struct_if_inline(btf: &Btf, mut type_id: u32) -> anyhow::Result<Option<&Struct>> {
	for _ in 0..32 {
		let ty = btf
			.get_type_by_id(type_id)
			.with_context(|| format!("failed to resolve nested type id {type_id}"))?;
		match &ty.base_type {
			Type::Struct(st) => return Ok(Some(st)),
			Type::Const(map) | Type::Volatile(map) | Type::Restrict(map) | Type::Typedef(map) | Type::TypeTag(map) => {
				type_id = map.type_id;
			}
			_ => return Ok(None),
		}
	}

	Err(anyhow!("type resolution exceeded while examining nested struct (type id {type_id})"))
}

fn resolve_struct_deep(btf: &Btf, mut type_id: u32) -> anyhow::Result<&Struct> {
	for _ in 0..32 {
		let ty = btf
			.get_type_by_id(type_id)
			.with_context(|| format!("failed to resolve type id {type_id}"))?;
		match &ty.base_type {
			Type::Struct(st) => return Ok(st),
			Type::Const(map)
			| Type::Volatile(map)
			| Type::Restrict(map)
			| Type::Typedef(map)
			| Type::TypeTag(map)
			| Type::Pointer(map) => {
				type_id = map.type_id;
			}
			other => return Err(anyhow!("type id {type_id} does not resolve to a struct ({other:?})")),
		}
	}

	Err(anyhow!("type resolution exceeded while resolving struct for type id {type_id}"))
}

fn expect_named_struct<'a>(btf: &'a Btf, name: &str) -> anyhow::Result<&'a Struct> {
	let ty = btf
		.get_type_by_name(name)
		.with_context(|| format!("type {name} not found in BTF"))?;
	match &ty.base_type {
		Type::Struct(st) => Ok(st),
		other => Err(anyhow!("type {name} is not a struct (found {other:?})")),
	}
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>; // For tests.

	use super::*;

	#[test]
	fn page_shift_from_page_size() -> Result<()> {
		assert_eq!(page_shift_of(4096), Some(12));
		assert_eq!(page_shift_of(16384), Some(14));
		assert_eq!(page_shift_of(65536), Some(16));
		assert_eq!(page_shift_of(3000), None);
		assert_eq!(page_shift_of(0), None);

		Ok(())
	}

	#[test]
	fn system_page_shift_is_sane() -> Result<()> {
		// -- Exec
		let shift = system_page_shift();

		// -- Check
		assert!((12..=16).contains(&shift));

		Ok(())
	}

	#[test]
	fn bit_offsets_must_be_byte_aligned() -> Result<()> {
		assert_eq!(bytes(64)?, 8);
		assert!(bytes(65).is_err());

		Ok(())
	}

	#[test]
	fn missing_btf_file_is_an_error() -> Result<()> {
		// -- Exec
		let res = discover_at("/nonexistent/pagewatch/vmlinux", 12);

		// -- Check
		let err = res.err().ok_or("discovery should fail")?;
		assert!(err.to_string().contains("failed to load BTF"));

		Ok(())
	}
}

// endregion: --- Tests
