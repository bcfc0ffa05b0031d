//! Integration tests for module injection and `require`

use crate::common::default_sandbox;
use assert_matches::assert_matches;
use isobridge_sandbox::SandboxError;
use serde_json::json;

#[tokio::test]
async fn test_module_exports_are_requirable_by_file_stem() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strings.js");
    std::fs::write(
        &path,
        "exports.shout = (s) => s.toUpperCase() + '!';\nexports.version = 2;\n",
    )
    .unwrap();

    let sandbox = default_sandbox().await;
    sandbox.inject_module(&path).await.unwrap();

    assert_eq!(
        sandbox.eval("require('strings').shout('hey')").await.unwrap(),
        json!("HEY!")
    );
    assert_eq!(sandbox.eval("require('strings').version").await.unwrap(), json!(2));
    sandbox.destroy();
}

#[tokio::test]
async fn test_module_exports_can_be_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counter.js");
    std::fs::write(
        &path,
        "let n = 0;\nmodule.exports = function next() { n += 1; return n; };\n",
    )
    .unwrap();

    let sandbox = default_sandbox().await;
    sandbox.inject_module(&path).await.unwrap();

    let result = sandbox
        .eval("() => { const next = require('counter'); next(); return next(); }")
        .await
        .unwrap();
    assert_eq!(result, json!(2));
    sandbox.destroy();
}

#[tokio::test]
async fn test_modules_can_require_earlier_modules() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.js");
    let derived = dir.path().join("derived.js");
    std::fs::write(&base, "exports.factor = 7;").unwrap();
    std::fs::write(
        &derived,
        "const base = require('base');\nexports.scale = (x) => x * base.factor;",
    )
    .unwrap();

    let sandbox = default_sandbox().await;
    sandbox.inject_module(&base).await.unwrap();
    sandbox.inject_module(&derived).await.unwrap();

    assert_eq!(sandbox.eval("require('derived').scale(6)").await.unwrap(), json!(42));
    sandbox.destroy();
}

#[tokio::test]
async fn test_unknown_module_throws() {
    let sandbox = default_sandbox().await;
    let err = sandbox.eval("require('fs')").await.unwrap_err();
    assert_matches!(err, SandboxError::Script { message } if message.contains("Cannot find module 'fs'"));
    assert!(!sandbox.is_destroyed());
    sandbox.destroy();
}

#[tokio::test]
async fn test_missing_module_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = default_sandbox().await;
    let err = sandbox
        .inject_module(dir.path().join("absent.js"))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::Io(_));
    sandbox.destroy();
}

#[tokio::test]
async fn test_module_runs_with_global_this() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("context.js");
    std::fs::write(
        &path,
        "exports.sawGlobal = this === globalThis;\nthis.leaked = 'module';",
    )
    .unwrap();

    let sandbox = default_sandbox().await;
    sandbox.inject_module(&path).await.unwrap();

    assert_eq!(sandbox.eval("require('context').sawGlobal").await.unwrap(), json!(true));
    assert_eq!(sandbox.eval("leaked").await.unwrap(), json!("module"));
    sandbox.destroy();
}

#[tokio::test]
async fn test_throwing_module_is_not_registered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.js");
    std::fs::write(&path, "exports.ok = true;\nthrow new Error('half loaded');").unwrap();

    let sandbox = default_sandbox().await;
    assert_matches!(
        sandbox.inject_module(&path).await,
        Err(SandboxError::Script { message }) if message.contains("half loaded")
    );
    assert_matches!(
        sandbox.eval("require('broken')").await,
        Err(SandboxError::Script { .. })
    );
    sandbox.destroy();
}

#[tokio::test]
async fn test_top_level_declarations_become_globals() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.js");
    std::fs::write(
        &path,
        "var answer = 42;\nfunction twice(x) { return x * 2; }\nexports.answer = answer;\n",
    )
    .unwrap();

    let sandbox = default_sandbox().await;
    sandbox.inject_module(&path).await.unwrap();

    assert_eq!(sandbox.eval("answer").await.unwrap(), json!(42));
    assert_eq!(sandbox.eval("twice(answer)").await.unwrap(), json!(84));
    assert_eq!(sandbox.eval("require('shared').answer").await.unwrap(), json!(42));
    // The module scaffolding does not outlive the file.
    assert_eq!(
        sandbox.eval("[typeof module, typeof exports]").await.unwrap(),
        json!(["undefined", "undefined"])
    );
    sandbox.destroy();
}

#[tokio::test]
async fn test_failed_module_leaves_no_scaffolding() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.js");
    std::fs::write(&path, "var before = 1;\nexports.x = 1;\nnull.boom;\n").unwrap();

    let sandbox = default_sandbox().await;
    assert_matches!(
        sandbox.inject_module(&path).await,
        Err(SandboxError::Script { .. })
    );
    assert_eq!(sandbox.eval("before").await.unwrap(), json!(1));
    assert_eq!(
        sandbox.eval("[typeof module, typeof exports]").await.unwrap(),
        json!(["undefined", "undefined"])
    );
    sandbox.destroy();
}
