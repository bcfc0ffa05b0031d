//! Time limit enforcement: a runaway script tears the sandbox down

use isobridge_sandbox::{EventKind, Sandbox, SandboxEvent, SandboxOptions};
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Time Limit ===\n");

    let sandbox =
        Sandbox::new(SandboxOptions::default().with_time_limit(Duration::from_millis(500))).await?;
    let _destroyed = sandbox.on(EventKind::Destroy, |event| {
        if let SandboxEvent::Destroy { cpu_time_ms, .. } = event {
            println!("  destroy event: cpu_time={:.1}ms", cpu_time_ms);
        }
    });

    sandbox.compile_script("while (true) {}").await?;
    let started = Instant::now();
    let result = sandbox.execute().await;
    println!(
        "  execute returned after {}ms: {:?}",
        started.elapsed().as_millis(),
        result
    );
    println!("  state: {:?}", sandbox.state());

    Ok(())
}
