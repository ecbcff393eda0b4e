use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Response, Server};

/// Warm-up pause after binding, so the first browsing action inside the
/// live run never races the server thread.
const WARMUP: Duration = Duration::from_millis(500);

/// Auxiliary static-file server for browsing test cases. Scoped handle:
/// dropping it stops the server, so every exit path of the enclosing
/// stage releases the port exactly once.
pub struct HttpServer {
    server: Arc<Server>,
    thread: Option<thread::JoinHandle<()>>,
    pub endpoint: String,
}

impl HttpServer {
    pub fn start(port: u16, root: &Path) -> Result<Self> {
        let server = Server::http(("127.0.0.1", port))
            .map_err(|err| anyhow!("failed to bind 127.0.0.1:{}: {}", port, err))?;
        let server = Arc::new(server);
        let endpoint = format!("http://127.0.0.1:{}", port);
        let worker = Arc::clone(&server);
        let root = root.to_path_buf();
        let thread = thread::spawn(move || {
            for request in worker.incoming_requests() {
                let response = serve_file(&root, request.url());
                let _ = match response {
                    Some(body) => request.respond(Response::from_data(body)),
                    None => request.respond(Response::from_string("not found").with_status_code(404)),
                };
            }
        });
        thread::sleep(WARMUP);
        tracing::info!(endpoint = %endpoint, "auxiliary http server up");
        Ok(Self {
            server,
            thread: Some(thread),
            endpoint,
        })
    }

    /// Idempotent; also invoked from `Drop`.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.server.unblock();
            let _ = handle.join();
            tracing::info!(endpoint = %self.endpoint, "auxiliary http server stopped");
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_file(root: &Path, url: &str) -> Option<Vec<u8>> {
    let path = url.split('?').next().unwrap_or(url);
    let mut resolved = PathBuf::from(root);
    for part in path.split('/') {
        // no parent traversal out of the served root
        if part.is_empty() || part == "." || part == ".." {
            continue;
        }
        resolved.push(part);
    }
    if resolved.is_dir() {
        resolved.push("index.html");
    }
    fs::read(&resolved).ok()
}
