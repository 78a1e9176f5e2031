#[cfg(unix)]
mod service_supervisor;
#[cfg(unix)]
mod unix_process_manager;

#[cfg(unix)]
pub use service_supervisor::UnixServiceSupervisor;
#[cfg(unix)]
pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

#[cfg(unix)]
pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl mcp_smoke_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> UnixProcessManager {
        <UnixProcessManager as mcp_smoke_core::ProcessManager>::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
