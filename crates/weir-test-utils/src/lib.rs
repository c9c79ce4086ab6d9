//! Shared helpers for weir integration tests.
//!
//! Flow-run child processes are exercised with small shell scripts standing
//! in for the real engine entrypoint; the helpers here write them with the
//! right permissions.

use std::path::{Path, PathBuf};
use std::sync::Once;

/// Initialize a test tracing subscriber once per process. Respects
/// `RUST_LOG`; defaults to warnings only so test output stays readable.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Write an executable shell script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("failed to write test script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to mark test script executable");
    }
    path
}

/// A fake flow-run entrypoint that prints one line and exits cleanly.
pub fn quick_entrypoint(dir: &Path) -> PathBuf {
    write_script(dir, "quick_entrypoint.sh", "#!/bin/sh\necho \"flow run $WEIR__FLOW_RUN_ID\"\n")
}

/// A fake flow-run entrypoint that sleeps until signalled.
pub fn sleepy_entrypoint(dir: &Path) -> PathBuf {
    write_script(dir, "sleepy_entrypoint.sh", "#!/bin/sh\nexec sleep 3600\n")
}

/// A fake flow-run entrypoint that exits with the given status code.
pub fn failing_entrypoint(dir: &Path, status_code: i32) -> PathBuf {
    write_script(
        dir,
        "failing_entrypoint.sh",
        &format!("#!/bin/sh\nexit {status_code}\n"),
    )
}
