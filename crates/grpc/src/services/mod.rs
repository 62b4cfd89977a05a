mod orchestrator;

pub use orchestrator::OrchestratorGrpc;
