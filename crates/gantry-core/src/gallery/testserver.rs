//! Minimal HTTP file server for gallery and installer tests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub(crate) struct TestServer {
    addr: String,
    accept: JoinHandle<()>,
}

impl TestServer {
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Serve a fixed path -> body map over HTTP/1.1; unknown paths get a 404.
pub(crate) async fn serve(files: Vec<(String, Vec<u8>)>) -> TestServer {
    let files: Arc<HashMap<String, Vec<u8>>> = Arc::new(files.into_iter().collect());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let accept = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let files = Arc::clone(&files);
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();

                let Ok(Some(request_line)) = lines.next_line().await else {
                    return;
                };
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                // Drain headers.
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.is_empty() {
                        break;
                    }
                }

                let response = match files.get(&path) {
                    Some(body) => {
                        let head = format!(
                            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\ncontent-type: application/octet-stream\r\nconnection: close\r\n\r\n",
                            body.len()
                        );
                        let mut bytes = head.into_bytes();
                        if method != "HEAD" {
                            bytes.extend_from_slice(body);
                        }
                        bytes
                    }
                    None => b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                        .to_vec(),
                };
                let _ = write_half.write_all(&response).await;
                let _ = write_half.shutdown().await;
            });
        }
    });

    TestServer { addr, accept }
}
