//! Integration tests for marshaling host capabilities into the guest

use crate::common::default_sandbox;
use assert_matches::assert_matches;
use isobridge_sandbox::{
    CapabilityObject, EventKind, Sandbox, SandboxEvent, SandboxOptions,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn describe(args: Vec<Value>) -> anyhow::Result<Value> {
    let label = args.first().and_then(Value::as_str).unwrap_or("none");
    let factor = args.get(1).and_then(Value::as_i64).unwrap_or(1);
    Ok(json!({ "label": label.to_uppercase(), "scaled": factor * 3, "argc": args.len() }))
}

#[tokio::test]
async fn test_marshaled_call_matches_direct_call() {
    let sandbox = default_sandbox().await;
    sandbox
        .inject_global_object(
            "host",
            CapabilityObject::new().function("describe", describe),
            None,
        )
        .await
        .unwrap();

    let cases = [
        (r#"host.describe("abc", 4)"#, vec![json!("abc"), json!(4)]),
        (r#"host.describe("x")"#, vec![json!("x")]),
        (r#"host.describe()"#, vec![]),
        (r#"host.describe("n", -2, { nested: [1, 2] })"#, vec![json!("n"), json!(-2), json!({ "nested": [1, 2] })]),
    ];
    for (guest, args) in cases {
        let direct = describe(args).unwrap();
        let marshaled = sandbox.eval(guest).await.unwrap();
        assert_eq!(marshaled, direct, "guest call `{}`", guest);
    }

    sandbox.destroy();
}

#[tokio::test]
async fn test_async_and_sync_capabilities_agree() {
    let sandbox = default_sandbox().await;
    let host = CapabilityObject::new()
        .function("fast", |args| Ok(json!(args[0].as_i64().unwrap_or(0) * 10)))
        .function("tagged", |args| Ok(json!(args[0].as_i64().unwrap_or(0) * 10)))
        .mark_async("tagged")
        .async_function("future", |args| async move {
            tokio::task::yield_now().await;
            Ok(json!(args[0].as_i64().unwrap_or(0) * 10))
        });
    sandbox.inject_global_object("host", host, None).await.unwrap();

    let result = sandbox
        .eval("() => [host.fast(4), host.tagged(4), host.future(4)]")
        .await
        .unwrap();
    assert_eq!(result, json!([40, 40, 40]));

    // Async-tagged functions still hand the guest a plain value.
    let kinds = sandbox
        .eval("() => [typeof host.tagged(1), typeof host.future(1)]")
        .await
        .unwrap();
    assert_eq!(kinds, json!(["number", "number"]));

    sandbox.destroy();
}

#[tokio::test]
async fn test_register_plugin_math_add() {
    let sandbox = default_sandbox().await;
    let math = CapabilityObject::new().function("add", |args| {
        let x = args[0].as_i64().unwrap_or(0);
        let y = args[1].as_i64().unwrap_or(0);
        Ok(json!(x + y))
    });
    sandbox.register_plugin("math", math, None).await.unwrap();

    assert_eq!(sandbox.eval("Plugins.math.add(2,3)").await.unwrap(), json!(5));
    // The transient raw reference global is gone.
    assert_eq!(
        sandbox.eval("typeof globalThis._Plugins_math").await.unwrap(),
        json!("undefined")
    );

    sandbox.destroy();
}

#[tokio::test]
async fn test_async_greet_resolves() {
    let sandbox = default_sandbox().await;
    let host = CapabilityObject::new()
        .function("greet", |args| {
            Ok(json!(format!("hi {}", args[0].as_str().unwrap_or_default())))
        })
        .mark_async("greet");
    sandbox.inject_global_object("host", host, None).await.unwrap();

    let greeting = sandbox
        .eval(r#"() => [typeof host.greet("Ann"), host.greet("Ann")]"#)
        .await
        .unwrap();
    assert_eq!(greeting, json!(["string", "hi Ann"]));

    sandbox.destroy();
}

#[tokio::test]
async fn test_guest_waits_for_async_host_work() {
    let sandbox = default_sandbox().await;
    let stored = Arc::new(AtomicI64::new(0));
    let writer = stored.clone();
    let reader = stored.clone();
    let host = CapabilityObject::new()
        .async_function("store", move |args| {
            let writer = writer.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let value = args[0].as_i64().unwrap_or(0);
                writer.store(value, Ordering::SeqCst);
                Ok(json!(value))
            }
        })
        .function("stored", move |_| Ok(json!(reader.load(Ordering::SeqCst))));
    sandbox.inject_global_object("host", host, None).await.unwrap();

    // The statement after the call observes the host's write.
    let seen = sandbox
        .eval("() => { const r = host.store(9); return [r, host.stored()]; }")
        .await
        .unwrap();
    assert_eq!(seen, json!([9, 9]));
    assert_eq!(stored.load(Ordering::SeqCst), 9);

    sandbox.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_host_calls_on_multi_thread_runtime() {
    let sandbox = default_sandbox().await;
    let host = CapabilityObject::new().async_function("later", |args| async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(json!(format!("done {}", args[0])))
    });
    sandbox.inject_global_object("host", host, None).await.unwrap();

    assert_eq!(
        sandbox.eval("host.later(1) + ' / ' + host.later(2)").await.unwrap(),
        json!("done 1 / done 2")
    );
    sandbox.destroy();
}

#[tokio::test]
async fn test_time_limit_interrupts_pending_async_call() {
    let sandbox = Sandbox::new(
        SandboxOptions::default().with_time_limit(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    let host = CapabilityObject::new().async_function("hang", |_| async move {
        never_settles().await;
        Ok(Value::Null)
    });
    sandbox.inject_global_object("host", host, None).await.unwrap();
    sandbox.compile_script("host.hang()").await.unwrap();

    let started = std::time::Instant::now();
    let result = sandbox.execute().await;
    assert_matches!(result, Err(isobridge_sandbox::SandboxError::Destroyed));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(sandbox.is_destroyed());
}

async fn never_settles() {
    tokio::time::sleep(Duration::from_secs(3600)).await;
}

#[tokio::test]
async fn test_injected_references_are_released() {
    let sandbox = default_sandbox().await;
    let baseline = sandbox.bridge_stats().await.unwrap();
    assert_eq!(baseline.references, 0);

    for i in 0..5 {
        let object = CapabilityObject::new()
            .function("id", move |_| Ok(json!(i)))
            .value("index", i);
        sandbox
            .inject_global_object(&format!("cap{}", i), object, None)
            .await
            .unwrap();
        let plugin = CapabilityObject::new().function("ping", |_| Ok(json!("pong")));
        sandbox
            .register_plugin(&format!("p{}", i), plugin, None)
            .await
            .unwrap();
    }

    let stats = sandbox.bridge_stats().await.unwrap();
    assert_eq!(stats.references, 0);
    // Decoded proxies keep their functions alive.
    assert_eq!(stats.functions, baseline.functions + 10);
    assert_eq!(sandbox.eval("cap4.id()").await.unwrap(), json!(4));
    assert_eq!(sandbox.eval("Plugins.p0.ping()").await.unwrap(), json!("pong"));

    sandbox.destroy();
    assert_matches!(
        sandbox.bridge_stats().await,
        Err(isobridge_sandbox::SandboxError::Destroyed)
    );
}

#[tokio::test]
async fn test_nested_objects_and_key_order() {
    let sandbox = default_sandbox().await;
    let host = CapabilityObject::new()
        .value("b", 1)
        .value("a", json!({ "deep": true }))
        .object(
            "tools",
            CapabilityObject::new().function("ping", |_| Ok(json!("pong"))),
        );
    sandbox.inject_global_object("host", host, None).await.unwrap();

    assert_eq!(
        sandbox.eval("Object.keys(host)").await.unwrap(),
        json!(["b", "a", "tools"])
    );
    assert_eq!(sandbox.eval("host.a.deep").await.unwrap(), json!(true));
    assert_eq!(sandbox.eval("host.tools.ping()").await.unwrap(), json!("pong"));

    sandbox.destroy();
}

#[tokio::test]
async fn test_extra_code_runs_after_injection() {
    let sandbox = default_sandbox().await;
    let config = CapabilityObject::new().value("limit", 3);
    sandbox
        .inject_global_object("config", config, Some("globalThis.doubled = config.limit * 2;"))
        .await
        .unwrap();
    assert_eq!(sandbox.eval("doubled").await.unwrap(), json!(6));
    sandbox.destroy();
}

#[tokio::test]
async fn test_host_errors_are_thrown_in_guest() {
    let sandbox = default_sandbox().await;
    let calc = CapabilityObject::new().function("div", |args| {
        let b = args[1].as_i64().unwrap_or(0);
        if b == 0 {
            anyhow::bail!("division by zero");
        }
        Ok(json!(args[0].as_i64().unwrap_or(0) / b))
    });
    sandbox.inject_global_object("calc", calc, None).await.unwrap();

    let message = sandbox
        .eval("() => { try { calc.div(1, 0); return 'no error'; } catch (e) { return e.message; } }")
        .await
        .unwrap();
    assert!(message.as_str().unwrap().contains("division by zero"));

    // Uncaught, the same error reaches the host caller.
    let err = sandbox.eval("calc.div(1, 0)").await.unwrap_err();
    assert_matches!(err, isobridge_sandbox::SandboxError::Script { message } if message.contains("division by zero"));

    sandbox.destroy();
}

#[tokio::test]
async fn test_unserializable_arguments_throw_type_error() {
    let sandbox = default_sandbox().await;
    let host = CapabilityObject::new().function("echo", |args| Ok(Value::Array(args)));
    sandbox.inject_global_object("host", host, None).await.unwrap();

    let caught = sandbox
        .eval(
            "() => { const out = []; \
               for (const bad of [() => 1, 10n, Symbol('s')]) { \
                 try { host.echo(bad); out.push(false); } catch (e) { out.push(e instanceof TypeError); } \
               } return out; }",
        )
        .await
        .unwrap();
    assert_eq!(caught, json!([true, true, true]));

    // `undefined` arguments are copied as null.
    assert_eq!(
        sandbox.eval("host.echo(undefined, 1)").await.unwrap(),
        json!([null, 1])
    );

    sandbox.destroy();
}

#[tokio::test]
async fn test_raw_bindings_are_not_reachable() {
    let sandbox = default_sandbox().await;
    let kinds = sandbox
        .eval("[typeof Deno, typeof _console, typeof __sandbox, typeof referenceToObject]")
        .await
        .unwrap();
    assert_eq!(kinds, json!(["undefined", "undefined", "object", "function"]));
    sandbox.destroy();
}

#[tokio::test]
async fn test_overwritten_aliases_do_not_break_injection() {
    let sandbox = default_sandbox().await;
    sandbox
        .inject_script("referenceToObject = null; Plugins = null; globalThis.__sandbox = 1;")
        .await
        .unwrap();

    let math = CapabilityObject::new().function("one", |_| Ok(json!(1)));
    sandbox.register_plugin("math", math, None).await.unwrap();
    assert_eq!(
        sandbox.eval("__sandbox.Plugins.math.one()").await.unwrap(),
        json!(1)
    );
    sandbox.destroy();
}

#[tokio::test]
async fn test_console_forwarding_respects_logging_flag() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    for logging in [false, true] {
        let sandbox = Sandbox::new(SandboxOptions::default().with_logging(logging))
            .await
            .unwrap();
        let sink = seen.clone();
        let _subscription = sandbox.on(EventKind::Console, move |event| {
            if let SandboxEvent::Console { level, args, .. } = event {
                sink.lock().unwrap().push((*level, args.clone()));
            }
        });
        sandbox
            .inject_script(r#"console.log("hi", 1, { ok: true }); console.dir([2]);"#)
            .await
            .unwrap();
        sandbox.destroy();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, isobridge_sandbox::ConsoleLevel::Log);
    assert_eq!(seen[0].1, vec![json!("hi"), json!(1), json!({ "ok": true })]);
    assert_eq!(seen[1].0, isobridge_sandbox::ConsoleLevel::Dir);
}
