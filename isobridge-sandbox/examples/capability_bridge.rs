//! Expose host functions to guest code and call them back

use isobridge_sandbox::{CapabilityObject, EventKind, Sandbox, SandboxEvent, SandboxOptions};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Capability Bridge ===\n");

    let sandbox = Sandbox::new(SandboxOptions::default().with_logging(true)).await?;
    let _console = sandbox.on(EventKind::Console, |event| {
        if let SandboxEvent::Console { args, .. } = event {
            println!("  [guest] {}", Value::Array(args.clone()));
        }
    });

    // Example 1: synchronous host function
    println!("Example 1: Plugins.math.add");
    let math = CapabilityObject::new().function("add", |args| {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok(json!(sum))
    });
    sandbox.register_plugin("math", math, None).await?;
    println!("  Result: {}", sandbox.eval("Plugins.math.add(2, 3)").await?);

    // Example 2: asynchronous host function
    println!("\nExample 2: blocking call into an async host.greet");
    let host = CapabilityObject::new().async_function("greet", |args| async move {
        let name = args.first().and_then(Value::as_str).unwrap_or("stranger");
        Ok(json!(format!("hi {}", name)))
    });
    sandbox.inject_global_object("host", host, None).await?;
    println!(
        "  Result: {}",
        sandbox.eval("host.greet('Ann')").await?
    );

    // Example 3: compiled script with console output
    println!("\nExample 3: compiled script");
    sandbox
        .compile_script("console.log('adding', 40, 2); Plugins.math.add(40, 2)")
        .await?;
    println!("  Result: {}", sandbox.execute().await?);

    sandbox.destroy();
    println!("\nCPU time: {:.3} ms", sandbox.cpu_time_ms());
    Ok(())
}
