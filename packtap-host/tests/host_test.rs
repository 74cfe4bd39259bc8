//! Integration tests for the wasm plugin host using inline WAT packs

use packtap_api::{CaptureValue, PackContext, PackId, Phase, SandboxPayload};
use packtap_host::{HostConfig, PluginHost, WasmPluginHost};
use serde_json::json;
use std::sync::Arc;

/// Counts its `pre` calls and reports the count; `post` traps.
const COUNTER_PACK: &str = r#"(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (global $count (mut i32) (i32.const 0))
  (data (i32.const 0) "{\22capture\22:{\22n\22:0}}")
  (func (export "pack_alloc") (param $len i32) (result i32)
    (local $old i32)
    (local.set $old (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $old))
  (func (export "pre") (param i32 i32) (result i64)
    (global.set $count (i32.add (global.get $count) (i32.const 1)))
    (i32.store8 (i32.const 16) (i32.add (i32.const 48) (global.get $count)))
    (i64.const 19))
  (func (export "post") (param i32 i32) (result i64)
    unreachable)
)"#;

/// Returns its input unchanged from `pre`; garbage from `post`; nothing from `chunk`.
const ECHO_PACK: &str = r#"(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (data (i32.const 64) "not json")
  (func (export "pack_alloc") (param $len i32) (result i32)
    (local $old i32)
    (local.set $old (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $old))
  (func (export "pack_dealloc") (param i32 i32))
  (func (export "pre") (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))
  (func (export "post") (param i32 i32) (result i64)
    (i64.const 274877906952))
  (func (export "chunk") (param i32 i32) (result i64)
    (i64.const 0))
)"#;

fn payload(context: PackContext) -> SandboxPayload {
    let mut payload: SandboxPayload = serde_json::from_value(json!({
        "requestId": "0192d3a4b5c67d8e9f0a1b2c3d4e5f60",
        "request": {
            "url": "https://api.example.com/v1/chat",
            "method": "POST",
            "domain": "api.example.com",
            "path": "/v1/chat"
        }
    }))
    .unwrap();
    payload.context = context;
    payload
}

async fn host_with(id: &PackId, wat_src: &str) -> WasmPluginHost {
    let host = WasmPluginHost::new(HostConfig::default()).unwrap();
    host.register(id.clone(), wat::parse_str(wat_src).unwrap())
        .await;
    host
}

fn captured_n(output: &packtap_api::PluginOutput) -> u64 {
    match output.capture.as_ref().unwrap().get("n") {
        Some(CaptureValue::Number(n)) => n.as_u64().unwrap(),
        other => panic!("unexpected capture: {:?}", other),
    }
}

#[tokio::test]
async fn test_instance_is_cached_between_calls() {
    let id = PackId::new("counter", "1.0.0");
    let host = host_with(&id, COUNTER_PACK).await;

    for expected in 1..=3 {
        let output = host
            .invoke(&id, Phase::Pre, &payload(PackContext::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(captured_n(&output), expected);
    }
}

#[tokio::test]
async fn test_trap_is_no_output_and_resets_instance() {
    let id = PackId::new("counter", "1.0.0");
    let host = host_with(&id, COUNTER_PACK).await;

    host.invoke(&id, Phase::Pre, &payload(PackContext::new()))
        .await
        .unwrap();

    let trapped = host
        .invoke(&id, Phase::Post, &payload(PackContext::new()))
        .await
        .unwrap();
    assert!(trapped.is_none());

    // Fresh instance after the trap: counter starts over
    let output = host
        .invoke(&id, Phase::Pre, &payload(PackContext::new()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(captured_n(&output), 1);
}

#[tokio::test]
async fn test_missing_phase_export_is_no_output() {
    let id = PackId::new("counter", "1.0.0");
    let host = host_with(&id, COUNTER_PACK).await;

    let output = host
        .invoke(&id, Phase::Chunk, &payload(PackContext::new()))
        .await
        .unwrap();
    assert!(output.is_none());
}

#[tokio::test]
async fn test_concurrent_calls_are_serialized() {
    let id = PackId::new("counter", "1.0.0");
    let host = Arc::new(host_with(&id, COUNTER_PACK).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let host = host.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let output = host
                .invoke(&id, Phase::Pre, &payload(PackContext::new()))
                .await
                .unwrap()
                .unwrap();
            captured_n(&output)
        }));
    }

    let mut seen = Vec::new();
    for handle in handles {
        seen.push(handle.await.unwrap());
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_context_crosses_the_boundary() {
    let id = PackId::new("echo", "0.1.0");
    let host = host_with(&id, ECHO_PACK).await;

    let mut context = PackContext::new();
    context.insert("startedAt".into(), json!(1700000000000u64));

    let output = host
        .invoke(&id, Phase::Pre, &payload(context.clone()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(output.context, Some(context));
    assert!(output.capture.is_none());
}

#[tokio::test]
async fn test_malformed_and_empty_output() {
    let id = PackId::new("echo", "0.1.0");
    let host = host_with(&id, ECHO_PACK).await;

    let malformed = host
        .invoke(&id, Phase::Post, &payload(PackContext::new()))
        .await
        .unwrap();
    assert!(malformed.is_none());

    let empty = host
        .invoke(&id, Phase::Chunk, &payload(PackContext::new()))
        .await
        .unwrap();
    assert!(empty.is_none());
}

#[tokio::test]
async fn test_fuel_limit_applies_per_host() {
    const SPIN_PACK: &str = r#"(module
      (memory (export "memory") 1)
      (func (export "pack_alloc") (param i32) (result i32) (i32.const 1024))
      (func (export "pre") (param i32 i32) (result i64)
        (loop $spin (br $spin))
        (i64.const 0))
    )"#;

    let id = PackId::new("spin", "0.0.1");
    let host = WasmPluginHost::new(HostConfig {
        fuel_limit: 10_000,
        ..HostConfig::default()
    })
    .unwrap();
    host.register(id.clone(), wat::parse_str(SPIN_PACK).unwrap())
        .await;

    let output = host
        .invoke(&id, Phase::Pre, &payload(PackContext::new()))
        .await
        .unwrap();
    assert!(output.is_none());
}
