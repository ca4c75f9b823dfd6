//! Simulated accelerator for `dlbridge`.
//!
//! [`SimRuntime`] keeps device memory on the host and runs each command queue on its own worker
//! thread, so work really is asynchronous with respect to the bridge. [`SimPrimitives`] is a
//! reference primitives library enqueuing host loops on those queues.

mod kernels;
pub mod primitives;
pub mod runtime;

use std::sync::Arc;

use dlbridge::backend::register_backend;
use dlbridge::{Bridge, BridgeConfig};

pub use primitives::SimPrimitives;
pub use runtime::{SimAllocation, SimBuffer, SimConfig, SimQueue, SimRuntime};

/// Builds a bridge over a fresh simulated runtime.
pub fn sim_bridge(sim: SimConfig, config: BridgeConfig) -> Bridge {
    Bridge::new(
        Arc::new(SimRuntime::new(sim)),
        Arc::new(SimPrimitives::new()),
        config,
    )
}

/// Registers the simulated backend under `"sim"` in the global backend registry.
///
/// Runs automatically when the library is loaded on Linux; calling it again is harmless.
pub fn register_sim_backend() {
    register_backend("sim", |config| Ok(sim_bridge(SimConfig::default(), config)));
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_SIM_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_sim_backend();
    }
    register
};
