//! Newline-delimited event sources.
//!
//! Each source reads text records and feeds them to the engine one line at a
//! time. Ingest waits for pipeline queue space, so a slow engine throttles
//! the reader.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{SourceConfig, SourceKind};
use crate::pipeline::EngineInput;

/// Where event lines come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSource {
    Stdin,
    File(PathBuf),
    /// Accepts any number of connections on the address.
    Tcp(String),
}

impl LineSource {
    pub fn from_config(cfg: &SourceConfig) -> Result<Self> {
        match cfg.kind {
            SourceKind::Stdin => Ok(Self::Stdin),
            SourceKind::File => cfg
                .path
                .clone()
                .map(Self::File)
                .context("source.path is required for file sources"),
            SourceKind::Tcp => Ok(Self::Tcp(cfg.listen_addr.clone())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::File(_) => "file",
            Self::Tcp(_) => "tcp",
        }
    }

    /// Reads until the input ends or `cancel` fires. Returns the number of
    /// lines read.
    pub async fn run(self, input: EngineInput, cancel: CancellationToken) -> Result<u64> {
        let lines = match self {
            Self::Stdin => pump(BufReader::new(tokio::io::stdin()), &input, &cancel).await?,
            Self::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("opening {}", path.display()))?;
                pump(BufReader::new(file), &input, &cancel).await?
            }
            Self::Tcp(addr) => {
                let listener = TcpListener::bind(&addr)
                    .await
                    .with_context(|| format!("binding tcp source on {addr}"))?;
                serve_tcp(listener, input, cancel).await?
            }
        };

        Ok(lines)
    }
}

/// Feeds every line of `reader` to the engine.
pub async fn pump<R>(mut reader: R, input: &EngineInput, cancel: &CancellationToken) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut count = 0u64;

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read.context("reading event line")?,
        };

        if read == 0 {
            break;
        }

        count += 1;
        input.ingest_bytes(trim_newline(&buf)).await?;
    }

    Ok(count)
}

fn trim_newline(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

/// Accepts connections until `cancel` fires, pumping each one concurrently.
pub async fn serve_tcp(
    listener: TcpListener,
    input: EngineInput,
    cancel: CancellationToken,
) -> Result<u64> {
    let local = listener.local_addr().context("reading tcp source address")?;
    info!(addr = %local, "tcp source listening");

    let mut connections = JoinSet::new();
    let mut total = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accepting tcp connection failed");
                        continue;
                    }
                };

                debug!(peer = %peer, "tcp source connection opened");
                let input = input.clone();
                let cancel = cancel.clone();
                connections.spawn(async move {
                    let result = pump(BufReader::new(stream), &input, &cancel).await;
                    debug!(peer = %peer, "tcp source connection closed");
                    result
                });
            }

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                total += connection_lines(joined);
            }
        }
    }

    while let Some(joined) = connections.join_next().await {
        total += connection_lines(joined);
    }

    Ok(total)
}

fn connection_lines(joined: Result<Result<u64>, tokio::task::JoinError>) -> u64 {
    match joined {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(error = %format_args!("{e:#}"), "tcp source connection failed");
            0
        }
        Err(e) => {
            warn!(error = %e, "tcp source connection task panicked");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::clock::TokioClock;
    use crate::config::{AggregationConfig, WriterConfig};
    use crate::event::stats::IngestStats;
    use crate::pipeline::Engine;
    use crate::sink::memory::MemoryExporter;
    use crate::sink::{spawn_writer, Exporter};

    const LINES: &str = "\
192.168.0.1 2024-05-01T10:00:00.100Z GET /sub/page 200 1200 a
garbage

192.168.0.2 2024-05-01T10:00:00.200Z POST /main/page 404 1500 b
";

    fn engine() -> (Engine, tokio::task::JoinHandle<()>) {
        let (sink, writer) = spawn_writer(
            WriterConfig::default(),
            vec![Exporter::Memory(MemoryExporter::new())],
            None,
        );
        let engine = Engine::start(
            &AggregationConfig::default(),
            Arc::new(TokioClock::new(1_714_557_600_000)),
            sink,
            Arc::new(IngestStats::new()),
            None,
            CancellationToken::new(),
        )
        .expect("engine starts");
        (engine, writer)
    }

    #[test]
    fn test_from_config() {
        let mut cfg = SourceConfig::default();
        assert_eq!(LineSource::from_config(&cfg).expect("stdin"), LineSource::Stdin);

        cfg.kind = SourceKind::File;
        assert!(LineSource::from_config(&cfg).is_err());

        cfg.path = Some(PathBuf::from("/var/log/access.log"));
        assert_eq!(
            LineSource::from_config(&cfg).expect("file"),
            LineSource::File(PathBuf::from("/var/log/access.log"))
        );

        cfg.kind = SourceKind::Tcp;
        let source = LineSource::from_config(&cfg).expect("tcp");
        assert_eq!(source.name(), "tcp");
    }

    #[tokio::test]
    async fn test_pump_counts_lines_and_skips_garbage() {
        let (engine, writer) = engine();

        let read = pump(LINES.as_bytes(), &engine.input(), &CancellationToken::new())
            .await
            .expect("pump");
        assert_eq!(read, 4);

        let stats = engine.stats().snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.parse_errors, 1);

        engine.shutdown().await.expect("shutdown");
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn test_pump_survives_invalid_utf8() {
        let (engine, writer) = engine();
        let mut raw = Vec::new();
        raw.extend_from_slice(b"192.168.0.1 2024-05-01T10:00:00.100Z GET /sub/page 200 1200 a\n");
        raw.extend_from_slice(b"\xff\xfe garbage\r\n");
        raw.extend_from_slice(b"192.168.0.2 2024-05-01T10:00:00.200Z GET /main 200 900 b");

        let read = pump(raw.as_slice(), &engine.input(), &CancellationToken::new())
            .await
            .expect("pump");
        assert_eq!(read, 3);

        let stats = engine.stats().snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.parse_errors, 1);

        engine.shutdown().await.expect("shutdown");
        writer.await.expect("writer");
    }

    #[test]
    fn test_trim_newline() {
        assert_eq!(trim_newline(b"a b\r\n"), b"a b");
        assert_eq!(trim_newline(b"a b\n"), b"a b");
        assert_eq!(trim_newline(b"a b"), b"a b");
    }

    #[tokio::test]
    async fn test_file_source() {
        let path = std::env::temp_dir().join(format!("clickstream-{}.log", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, LINES).await.expect("write log");

        let (engine, writer) = engine();
        let read = LineSource::File(path.clone())
            .run(engine.input(), CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(read, 4);
        assert_eq!(engine.stats().snapshot().received, 2);

        engine.shutdown().await.expect("shutdown");
        writer.await.expect("writer");
        tokio::fs::remove_file(&path).await.expect("cleanup");
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let (engine, writer) = engine();
        let result = LineSource::File(PathBuf::from("/nonexistent/clickstream.log"))
            .run(engine.input(), CancellationToken::new())
            .await;
        assert!(result.is_err());

        engine.shutdown().await.expect("shutdown");
        writer.await.expect("writer");
    }

    #[tokio::test]
    async fn test_tcp_source_accepts_connections() {
        let (engine, writer) = engine();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let cancel = CancellationToken::new();

        let server = tokio::spawn(serve_tcp(listener, engine.input(), cancel.clone()));

        for _ in 0..2 {
            let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
            stream.write_all(LINES.as_bytes()).await.expect("send");
            stream.shutdown().await.expect("close");
        }

        // Snapshots reset the counters, so accumulate until both
        // connections have been fully ingested.
        let mut received = 0;
        while received < 4 {
            received += engine.stats().snapshot().received;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let read = server.await.expect("join").expect("serve");
        assert_eq!(read, 8);

        engine.shutdown().await.expect("shutdown");
        writer.await.expect("writer");
    }
}
