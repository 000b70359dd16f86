//! In-process stand-in for the probe object and its transports.
//!
//! Runs the same handler code as the kernel object against simulated tasks
//! and mappings, so the whole pipeline can be exercised without privileges.

// region:    --- Modules
mod backend;
mod transport;

pub use backend::{SimBackend, SimFailure, SimFault, SimKernel, SimMapping, SimTask};
pub use transport::{record_charge, sim_channel, CpuSink, SimProducer, SimSlot, SimTransport, PERF_SAMPLE_LEN};
// endregion: --- Modules
