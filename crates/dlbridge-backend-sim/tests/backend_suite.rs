use dlbridge::{Bridge, BridgeConfig, ExecutionMode};
use dlbridge_backend_sim::{sim_bridge, SimConfig};

fn bridge(mode: ExecutionMode) -> Bridge {
    sim_bridge(
        SimConfig::default(),
        BridgeConfig::default().with_execution_mode(mode),
    )
}

dlbridge_backend_tests::define_backend_tests!(sim_backend, bridge);
