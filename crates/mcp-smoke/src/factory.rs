use mcp_smoke_core::{HarnessConfig, ServiceSupervisor};

#[cfg(not(unix))]
compile_error!("mcp-smoke supervises services through unix process groups");

/// Builds the service supervisor for the platform the harness runs on
pub trait SupervisorFactory {
    type Supervisor: ServiceSupervisor;

    fn create_supervisor(config: &HarnessConfig) -> Self::Supervisor;

    fn platform_name() -> &'static str;
}

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformSupervisorFactory;

#[cfg(unix)]
impl SupervisorFactory for PlatformSupervisorFactory {
    type Supervisor = mcp_smoke_unix::UnixServiceSupervisor;

    fn create_supervisor(config: &HarnessConfig) -> Self::Supervisor {
        mcp_smoke_unix::UnixServiceSupervisor::new(config.timeouts.drain_join())
    }

    fn platform_name() -> &'static str {
        <mcp_smoke_unix::UnixProcessManagerFactory as mcp_smoke_core::ProcessManagerFactory>::platform_name()
    }
}

/// Convenience function to create the platform-appropriate supervisor
#[cfg(unix)]
pub fn create_supervisor(
    config: &HarnessConfig,
) -> <PlatformSupervisorFactory as SupervisorFactory>::Supervisor {
    PlatformSupervisorFactory::create_supervisor(config)
}
