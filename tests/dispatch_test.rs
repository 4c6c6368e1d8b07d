use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use iacflow::config::RunnerEntry;
use iacflow::error::CoreError;
use iacflow::runner::{DispatchClient, RunnerControl, StaticRunnerRegistry};

/// A captured HTTP request: request line and body.
type Captured = Arc<Mutex<Vec<(String, String)>>>;

/// Serve every connection with the given status line, recording requests.
async fn stub_runner(status: &'static str) -> (String, Captured) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured: Captured = Arc::default();

    let sink = captured.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let header_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                while buf.len() < header_end + length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }

                let request_line = head.lines().next().unwrap_or_default().to_string();
                let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
                sink.lock().unwrap().push((request_line, body));

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
                    status
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            });
        }
    });

    (format!("http://{}/api/v1", addr), captured)
}

fn client(address: &str) -> DispatchClient {
    let registry = StaticRunnerRegistry::new(
        vec![RunnerEntry {
            id: "runner-1".into(),
            address: address.to_string(),
        }],
        None,
    );
    DispatchClient::new(Arc::new(registry), Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_stop_posts_task_and_containers() {
    let (address, captured) = stub_runner("200 OK").await;
    let client = client(&address);

    client
        .stop_task("runner-1", "task-1", &["c1".to_string(), "c2".to_string()])
        .await
        .unwrap();

    let requests = captured.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].0.starts_with("POST /api/v1/task/stop"));
    let body: serde_json::Value = serde_json::from_str(&requests[0].1).unwrap();
    assert_eq!(
        body,
        serde_json::json!({"taskId": "task-1", "containerIds": ["c1", "c2"]})
    );
}

#[tokio::test]
async fn test_stop_twice_is_accepted() {
    let (address, captured) = stub_runner("200 OK").await;
    let client = client(&address);
    let containers = vec!["c1".to_string()];

    client.stop_task("runner-1", "task-1", &containers).await.unwrap();
    client.stop_task("runner-1", "task-1", &containers).await.unwrap();
    assert_eq!(captured.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_runner_error_status_is_unreachable() {
    let (address, _captured) = stub_runner("500 Internal Server Error").await;
    let err = client(&address)
        .stop_task("runner-1", "task-1", &[])
        .await
        .unwrap_err();
    match err {
        CoreError::RunnerUnreachable { runner, reason } => {
            assert_eq!(runner, "runner-1");
            assert!(reason.contains("500"), "{}", reason);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = client(&format!("http://{}", addr))
        .stop_task("runner-1", "task-1", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "runner_unreachable");
}

#[tokio::test]
async fn test_unknown_runner_not_registered() {
    let err = client("http://127.0.0.1:1")
        .stop_task("runner-9", "task-1", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RunnerNotRegistered(id) if id == "runner-9"));
}
