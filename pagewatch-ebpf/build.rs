use std::env;

// Register width and field names differ per architecture, the probe code
// selects them with `bpf_target_arch`.
fn main() {
	println!("cargo::rustc-check-cfg=cfg(bpf_target_arch, values(\"x86_64\", \"aarch64\", \"arm\", \"riscv64\", \"powerpc64\", \"s390x\", \"mips\"))");
	println!("cargo:rerun-if-env-changed=CARGO_CFG_BPF_TARGET_ARCH");

	let arch = env::var("CARGO_CFG_BPF_TARGET_ARCH")
		.or_else(|_| env::var("HOST").map(|host| host.split('-').next().unwrap_or_default().to_string()))
		.unwrap_or_default();
	if !arch.is_empty() {
		println!("cargo:rustc-cfg=bpf_target_arch=\"{arch}\"");
	}
}
