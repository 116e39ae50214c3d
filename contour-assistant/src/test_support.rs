// Test doubles: a minimal HTTP/1.1 server and fake local models

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::chat::{ChatMessage, LocalModel};
use crate::loader::{LoadRequest, ModelFactory};

pub(crate) struct TestServer {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Raw requests (head and body) in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// Serve every connection with `respond(request)`, closing after each response.
pub(crate) async fn serve<F>(respond: F) -> TestServer
where
    F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let (hits_task, requests_task) = (hits.clone(), requests.clone());
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let respond = respond.clone();
            let hits = hits_task.clone();
            let requests = requests_task.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                hits.fetch_add(1, Ordering::SeqCst);
                requests.lock().unwrap().push(request.clone());
                let response = respond(&request);
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    TestServer {
        addr,
        hits,
        requests,
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head_end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + body_len {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 200 response with Content-Length
pub(crate) fn ok_response(content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// 200 response delimited by connection close
pub(crate) fn unsized_response(body: &[u8]) -> Vec<u8> {
    let mut out = b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n".to_vec();
    out.extend_from_slice(body);
    out
}

pub(crate) fn status_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

// ============================================================================
// Fake local models
// ============================================================================

/// Local model that replays canned deltas and records what it was asked
pub(crate) struct FakeModel {
    deltas: Vec<String>,
    failure: Option<String>,
    calls: Mutex<Vec<(Vec<ChatMessage>, u32)>>,
}

impl FakeModel {
    pub fn replying(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            deltas: Vec::new(),
            failure: Some(message.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Messages and max_tokens of every call so far
    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl LocalModel for FakeModel {
    fn stream_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        on_delta: &mut dyn FnMut(&str) -> bool,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push((messages.to_vec(), max_tokens));
        if let Some(failure) = &self.failure {
            return Err(anyhow::anyhow!("{}", failure));
        }
        for delta in &self.deltas {
            if !on_delta(delta) {
                break;
            }
        }
        Ok(())
    }
}

/// Everything a model streams for a one-message prompt
pub(crate) fn reply_of(model: &dyn LocalModel) -> String {
    let mut text = String::new();
    model
        .stream_chat(&[], 16, &mut |d| {
            text.push_str(d);
            true
        })
        .unwrap();
    text
}

/// Factory whose loads block until the gate is open. Loaded models reply
/// with their file name.
pub(crate) struct FakeFactory {
    gate: Arc<(Mutex<bool>, Condvar)>,
    requests: Mutex<Vec<LoadRequest>>,
    failure: Mutex<Option<String>>,
    serving: Mutex<Option<Arc<FakeModel>>>,
}

impl FakeFactory {
    pub fn open() -> Self {
        Self {
            gate: Arc::new((Mutex::new(true), Condvar::new())),
            requests: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            serving: Mutex::new(None),
        }
    }

    /// Every successful load hands out `model` instead of a fresh fake.
    pub fn serving(model: Arc<FakeModel>) -> Self {
        let factory = Self::open();
        *factory.serving.lock().unwrap() = Some(model);
        factory
    }

    pub fn gated() -> Self {
        let factory = Self::open();
        factory.close();
        factory
    }

    pub fn open_gate(&self) {
        let (open, cvar) = &*self.gate;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }

    pub fn close(&self) {
        *self.gate.0.lock().unwrap() = false;
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn succeed(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn load_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LoadRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ModelFactory for FakeFactory {
    fn load(&self, request: &LoadRequest) -> anyhow::Result<Arc<dyn LocalModel>> {
        self.requests.lock().unwrap().push(request.clone());
        {
            let (open, cvar) = &*self.gate;
            let mut is_open = open.lock().unwrap();
            while !*is_open {
                is_open = cvar.wait(is_open).unwrap();
            }
        }
        if let Some(failure) = self.failure.lock().unwrap().clone() {
            anyhow::bail!("{}", failure);
        }
        if let Some(model) = self.serving.lock().unwrap().clone() {
            return Ok(model as Arc<dyn LocalModel>);
        }
        let name = request
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Arc::new(FakeModel::replying(&[name.as_str()])))
    }
}
