use tempfile::TempDir;

/// Quiet tracing setup shared by the integration tests.
pub fn init() {
    uart_monitor::logging::init();
}

/// A scratch base directory which cleans itself up.
pub fn scratch_base() -> TempDir {
    tempfile::tempdir().expect("can create scratch dir")
}
