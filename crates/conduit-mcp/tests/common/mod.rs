//! Raw TCP test servers shared by the integration tests.
//!
//! Every HTTP response carries `Connection: close`, so each request arrives
//! on its own connection and is answered exactly once.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// One request as the server saw it. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }

    /// JSON-RPC id of the request body, if it has one.
    pub fn rpc_id(&self) -> Option<u64> {
        self.json().get("id").and_then(|v| v.as_u64())
    }

    pub fn rpc_method(&self) -> String {
        self.json()["method"].as_str().unwrap_or_default().to_string()
    }
}

pub type Requests = Arc<Mutex<Vec<Recorded>>>;

/// Read one HTTP/1.1 request: headers, then `Content-Length` bytes of body.
pub async fn read_request(socket: &mut TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(Recorded {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

/// Start a server that answers request number `n` (0-based) with
/// `respond(n, &request)`. Returns the base URL and the recorded requests.
pub async fn serve<F>(respond: F) -> (String, Requests)
where
    F: Fn(usize, &Recorded) -> String + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let recorded = Arc::clone(&recorded);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let idx = {
                    let mut all = recorded.lock().unwrap();
                    all.push(request.clone());
                    all.len() - 1
                };
                let response = respond(idx, &request);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), requests)
}

/// Server that accepts connections and reads requests but never answers.
pub async fn silent_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            let _ = read_request(&mut socket).await;
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

/// Full HTTP response with a body and optional extra headers.
pub fn http_response(status: &str, content_type: &str, extra: &[(&str, &str)], body: &str) -> String {
    let mut head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in extra {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    format!("{head}\r\n{body}")
}

pub fn json_response(body: &str) -> String {
    http_response("200 OK", "application/json", &[], body)
}

pub fn event_stream_response(body: &str) -> String {
    http_response("200 OK", "text/event-stream", &[], body)
}

pub fn accepted() -> String {
    http_response("202 Accepted", "application/json", &[], "")
}

/// 429 with an optional `Retry-After` value.
pub fn too_many_requests(retry_after: Option<&str>) -> String {
    let body = r#"{"error":"rate limited"}"#;
    match retry_after {
        Some(value) => http_response(
            "429 Too Many Requests",
            "application/json",
            &[("Retry-After", value)],
            body,
        ),
        None => http_response("429 Too Many Requests", "application/json", &[], body),
    }
}

/// JSON-RPC success body for request `id`.
pub fn rpc_result(id: u64, result: serde_json::Value) -> String {
    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

/// One SSE `message` event carrying `data`.
pub fn sse_event(data: &str) -> String {
    format!("event: message\ndata: {data}\n\n")
}

/// What the SSE server writes next on its open GET stream.
pub enum Push {
    Event(String),
    HangUp,
}

/// Legacy SSE server: `GET /sse` holds a stream open, `POST` anywhere else
/// is answered `202 Accepted` and whatever `on_post` returns is pushed onto
/// the stream.
pub struct SseServer {
    pub url: String,
    pub posts: Requests,
    pub push: mpsc::UnboundedSender<Push>,
}

pub async fn sse_server<F>(initial: Vec<String>, on_post: F) -> SseServer
where
    F: Fn(&Recorded) -> Vec<String> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let posts: Requests = Arc::new(Mutex::new(Vec::new()));
    let (push, rx) = mpsc::unbounded_channel::<Push>();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let on_post = Arc::new(on_post);

    let recorded = Arc::clone(&posts);
    let pusher = push.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let recorded = Arc::clone(&recorded);
            let pusher = pusher.clone();
            let rx = Arc::clone(&rx);
            let on_post = Arc::clone(&on_post);
            let initial = initial.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                if request.method == "GET" {
                    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
                    if socket.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    for event in initial {
                        let _ = socket.write_all(event.as_bytes()).await;
                    }
                    let _ = socket.flush().await;
                    let mut rx = rx.lock().await;
                    while let Some(next) = rx.recv().await {
                        match next {
                            Push::Event(event) => {
                                if socket.write_all(event.as_bytes()).await.is_err() {
                                    break;
                                }
                                let _ = socket.flush().await;
                            }
                            Push::HangUp => break,
                        }
                    }
                    let _ = socket.shutdown().await;
                    return;
                }

                recorded.lock().unwrap().push(request.clone());
                let _ = socket.write_all(accepted().as_bytes()).await;
                let _ = socket.flush().await;
                let _ = socket.shutdown().await;
                for event in on_post(&request) {
                    let _ = pusher.send(Push::Event(event));
                }
            });
        }
    });

    SseServer {
        url: format!("http://{addr}"),
        posts,
        push,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
