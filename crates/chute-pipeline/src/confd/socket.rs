//! Unix-socket transport: one JSON request line, one JSON reply line.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::*;

#[derive(Debug, Serialize)]
#[serde(tag = "method")]
enum Request<'a> {
    Reload { name: &'a str },
    ReloadAll,
    UnloadAll,
    WaitSystemUp,
}

#[derive(Debug, Clone)]
pub struct SocketConfd {
    path: PathBuf,
}

impl SocketConfd {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn call(&self, request: &Request<'_>) -> Result<Value> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| ConfdError::Connect {
                path: self.path.display().to_string(),
                source,
            })?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        write.write_all(&line).await?;
        write.shutdown().await?;

        let mut reply = String::new();
        BufReader::new(read).read_line(&mut reply).await?;
        let value: Value = serde_json::from_str(reply.trim())?;

        if let Some(err) = value.get("error").and_then(Value::as_str) {
            return Err(ConfdError::Remote(err.to_string()));
        }
        tracing::trace!(?request, "confd call complete");
        Ok(value)
    }

    async fn statuses(&self, request: &Request<'_>) -> Result<Vec<SectionStatus>> {
        let value = self.call(request).await?;
        // Replies are either the bare array or `{"result": [...]}`.
        let list = match value {
            Value::Object(mut map) => map.remove("result").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        Ok(serde_json::from_value(list)?)
    }
}

#[async_trait]
impl ConfdClient for SocketConfd {
    async fn reload(&self, name: &str) -> Result<Vec<SectionStatus>> {
        self.statuses(&Request::Reload { name }).await
    }

    async fn reload_all(&self) -> Result<Vec<SectionStatus>> {
        self.statuses(&Request::ReloadAll).await
    }

    async fn unload_all(&self) -> Result<()> {
        self.call(&Request::UnloadAll).await.map(|_| ())
    }

    async fn wait_system_up(&self) -> Result<()> {
        self.call(&Request::WaitSystemUp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::net::UnixListener;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn socket_path() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "chute-confd-test-{}-{}.sock",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Serve one connection with `reply`, returning the request line.
    fn serve_once(path: &PathBuf, reply: &'static str) -> tokio::task::JoinHandle<String> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            write.write_all(reply.as_bytes()).await.unwrap();
            write.write_all(b"\n").await.unwrap();
            line
        })
    }

    #[tokio::test]
    async fn reload_sends_name_and_parses_statuses() {
        let path = socket_path();
        let server = serve_once(
            &path,
            r#"[{"type":"interface","name":"x_eth1","comment":"x","success":true,"age":0}]"#,
        );
        let client = SocketConfd::new(&path);
        let statuses = client.reload("x").await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].comment.as_deref(), Some("x"));

        let request: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(request, serde_json::json!({"method": "Reload", "name": "x"}));
    }

    #[tokio::test]
    async fn remote_error_is_reported() {
        let path = socket_path();
        let _server = serve_once(&path, r#"{"error":"busy"}"#);
        let err = SocketConfd::new(&path).unload_all().await.unwrap_err();
        assert!(matches!(err, ConfdError::Remote(m) if m == "busy"));
    }

    #[tokio::test]
    async fn missing_socket_is_connect_error() {
        let err = SocketConfd::new(socket_path()).wait_system_up().await.unwrap_err();
        assert!(matches!(err, ConfdError::Connect { .. }));
    }
}
