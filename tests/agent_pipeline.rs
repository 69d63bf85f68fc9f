//! End-to-end run of the agent against an in-process fake fabric service.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;

use fabmon::agent::Agent;
use fabmon::config::Config;
use fabmon::event::{NodeType, Severity};
use fabmon::fabric::{GroupConfig, GroupInfo, ImageInfo, Notice, NoticeKind, PortMember};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn fake_fabric() -> Router {
    Router::new()
        .route(
            "/v1/images",
            get(|| async {
                Json(ImageInfo {
                    num_switch_nodes: 4,
                    num_hfi_nodes: 16,
                    num_switch_ports: 192,
                    num_hfi_ports: 16,
                    num_links: 20,
                    num_hfi_links: 16,
                    ..Default::default()
                })
            }),
        )
        .route(
            "/v1/groups/info",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                Json(GroupInfo {
                    name: q.get("name").cloned().unwrap_or_default(),
                    num_internal_ports: 24,
                    ..Default::default()
                })
            }),
        )
        .route(
            "/v1/groups/config",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                Json(GroupConfig {
                    name: q.get("name").cloned().unwrap_or_default(),
                    members: vec![PortMember {
                        lid: 5,
                        port: 1,
                        node_desc: "edge-sw-1".into(),
                    }],
                })
            }),
        )
        .route(
            "/v1/notices",
            get(|| async {
                Json(vec![Notice {
                    id: 1,
                    time: unix_now(),
                    kind: NoticeKind::LinkChanged,
                    severity: Severity::Critical,
                    node_type: NodeType::Switch,
                    lid: 5,
                    node_desc: "edge-sw-1".into(),
                }])
            }),
        )
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_scores_notices_and_persists_groups() {
    let endpoint = serve(fake_fabric()).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let samples = dir.path().join("samples.ndjson");

    let cfg = Config::parse(&format!(
        r#"
fabric:
  endpoint: {endpoint}
  timeout: 2s
refresh_rate: 1s
persistence:
  enabled: true
  path: {path}
  throttle: 1s
monitor:
  groups: [All, Edge]
health:
  addr: "127.0.0.1:0"
"#,
        path = samples.display(),
    ))
    .expect("config");

    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let summary = agent.summary();
    assert_eq!(summary.switch_states[Severity::Critical], 1);
    assert_eq!(summary.hfi_states.total(), 0);
    assert!(summary.health_score < 100.0, "score {}", summary.health_score);
    assert_eq!(summary.worst_nodes.first().map(|n| n.lid), Some(5));

    let metrics_addr = agent.health().local_addr().expect("metrics bound");
    let body = reqwest::get(format!("http://{metrics_addr}/metrics"))
        .await
        .expect("scrape")
        .text()
        .await
        .expect("body");
    assert!(body.contains("fabmon_fabric_requests_total"));
    assert!(body.contains("fabmon_batches_delivered_total"));

    agent.stop().await.expect("stop");

    let saved = std::fs::read_to_string(&samples).expect("samples written");
    let lines: Vec<&str> = saved.lines().collect();
    assert!(lines.len() >= 2, "expected both groups saved, got {lines:?}");
    assert!(lines.iter().any(|l| l.contains("\"Edge\"")));
    assert!(lines.iter().any(|l| l.contains("\"All\"")));
}

#[tokio::test]
async fn test_agent_without_fabric_keeps_full_health() {
    // Nothing listens on this port; every poll fails and is retried.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let cfg = Config::parse(&format!(
        r#"
fabric:
  endpoint: http://{addr}
  timeout: 1s
refresh_rate: 1s
health:
  addr: "127.0.0.1:0"
"#,
    ))
    .expect("config");

    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let summary = agent.summary();
    assert_eq!(summary.health_score, 100.0);
    assert!(summary.worst_nodes.is_empty());

    agent.stop().await.expect("stop");
}
