//! Common test utilities shared across integration tests

use isobridge_sandbox::{Sandbox, SandboxOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("isobridge_sandbox=debug")
        .with_test_writer()
        .try_init();
}

/// Sandbox with default options
pub async fn default_sandbox() -> Sandbox {
    setup_test_logging();
    Sandbox::new(SandboxOptions::default())
        .await
        .expect("Failed to create sandbox")
}

/// A name no other test uses, for the process-wide plugin namespace
pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Shared counter plus a callback incrementing it
pub fn counter() -> (Arc<AtomicUsize>, impl Fn(&isobridge_sandbox::SandboxEvent) + Send + Sync) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move |_: &isobridge_sandbox::SandboxEvent| {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

/// Ordered record of which plugins ran
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Write `<root>/sandbox_plugins/<name>/` with a manifest and script files
pub fn write_local_plugin(root: &Path, name: &str, manifest: &str, files: &[(&str, &str)]) -> PathBuf {
    let dir = root
        .join(isobridge_sandbox::LOCAL_PLUGIN_DIR)
        .join(name);
    std::fs::create_dir_all(&dir).expect("Failed to create plugin dir");
    std::fs::write(dir.join(isobridge_sandbox::MANIFEST_FILE), manifest)
        .expect("Failed to write manifest");
    for (file, content) in files {
        std::fs::write(dir.join(file), content).expect("Failed to write plugin file");
    }
    dir
}
