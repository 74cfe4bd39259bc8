//! Wasm packs running behind the interceptor

use async_trait::async_trait;
use bytes::Bytes;
use packtap::{
    HttpClient, InboundResponse, MemoryLogSink, ModuleSource, OutboundRequest, PackManifest,
    Packtap, PacktapConfig, Permissions, Phase, ResponseBody, TransportError,
};
use reqwest::{StatusCode, Url};
use std::sync::Arc;

/// `pre` captures `tokens`, `post` captures `done`
const TOKENS_PACK: &str = r#"(module
  (memory (export "memory") 1)
  (global $heap (mut i32) (i32.const 1024))
  (data (i32.const 0) "{\22capture\22:{\22tokens\22:7}}")
  (data (i32.const 64) "{\22capture\22:{\22done\22:true}}")
  (func (export "pack_alloc") (param $len i32) (result i32)
    (local $old i32)
    (local.set $old (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $old))
  (func (export "pre") (param i32 i32) (result i64)
    (i64.const 24))
  (func (export "post") (param i32 i32) (result i64)
    (i64.const 274877906969))
)"#;

/// Traps in every phase
const TRAP_PACK: &str = r#"(module
  (memory (export "memory") 1)
  (func (export "pack_alloc") (param i32) (result i32)
    (i32.const 1024))
  (func (export "pre") (param i32 i32) (result i64)
    unreachable)
  (func (export "post") (param i32 i32) (result i64)
    unreachable)
)"#;

struct Upstream;

#[async_trait]
impl HttpClient for Upstream {
    async fn execute(&self, _request: OutboundRequest) -> Result<InboundResponse, TransportError> {
        Ok(InboundResponse::new(
            StatusCode::OK,
            ResponseBody::Full(Bytes::from_static(b"{}")),
        ))
    }
}

fn manifest(name: &str) -> PackManifest {
    PackManifest::new(name, "1.0.0").permissions(Permissions::default().with_domains([".+"]))
}

fn packtap(log: Arc<MemoryLogSink>) -> Packtap {
    Packtap::builder(PacktapConfig::local())
        .log_sink(log)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_wasm_pack_captures_through_the_gateway() {
    let log = Arc::new(MemoryLogSink::new());
    let packtap = packtap(log.clone());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tokens.wasm");
    std::fs::write(&path, wat::parse_str(TOKENS_PACK).unwrap()).unwrap();

    packtap.add(manifest("tokens"), path).unwrap();
    packtap
        .add(manifest("trap"), wat::parse_str(TRAP_PACK).unwrap())
        .unwrap();
    let report = packtap.load().await.unwrap();
    assert_eq!(report.packs.len(), 2);
    assert!(report.dropped.is_empty());

    let client = packtap.interceptor(Upstream);
    let response = client
        .execute(OutboundRequest::get(
            Url::parse("https://api.example.com/v1/models").unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "{}");

    let shutdown = packtap.shutdown().await;
    assert!(shutdown.drained);

    let records = log.records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.get("tokens/tokens"), Some("7"));
    assert_eq!(record.get("tokens/done"), Some("true"));
    assert_eq!(record.get("status"), Some("200"));
    // The trapping pack contributes nothing and breaks nothing
    assert!(record.dimensions.iter().all(|d| !d.name.starts_with("trap/")));
}

#[tokio::test]
async fn test_unloadable_modules_are_dropped() {
    let log = Arc::new(MemoryLogSink::new());
    let packtap = packtap(log);

    packtap
        .add(manifest("good"), wat::parse_str(TOKENS_PACK).unwrap())
        .unwrap();
    packtap
        .add(manifest("garbage"), b"\0asm garbage".to_vec())
        .unwrap();
    packtap
        .add(
            manifest("missing"),
            ModuleSource::File("/nonexistent/packtap/missing.wasm".into()),
        )
        .unwrap();

    let report = packtap.load().await.unwrap();
    let active: Vec<_> = report.packs.iter().map(|id| id.name()).collect();
    assert_eq!(active, vec!["good"]);

    let mut dropped: Vec<_> = report.dropped.iter().map(|d| d.pack.name()).collect();
    dropped.sort_unstable();
    assert_eq!(dropped, vec!["garbage", "missing"]);
    assert_eq!(packtap.packs().len(), 1);

    packtap.shutdown().await;
}

#[tokio::test]
async fn test_phases_outside_the_declared_methods_are_skipped() {
    let log = Arc::new(MemoryLogSink::new());
    let packtap = packtap(log.clone());

    // Exports pre and post, but only declares chunk
    let manifest = manifest("quiet").methods([Phase::Chunk]);
    packtap
        .add(manifest, wat::parse_str(TOKENS_PACK).unwrap())
        .unwrap();
    packtap.load().await.unwrap();

    let client = packtap.interceptor(Upstream);
    client
        .execute(OutboundRequest::get(
            Url::parse("https://api.example.com/").unwrap(),
        ))
        .await
        .unwrap();
    packtap.shutdown().await;

    let records = log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("status"), Some("200"));
    assert!(records[0].get("quiet/tokens").is_none());
    assert!(records[0].get("quiet/done").is_none());
}
