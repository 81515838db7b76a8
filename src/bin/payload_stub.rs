//! Minimal payload server used by the integration tests.
//!
//! Accepts `--port`, `--host`, and `--base-path` like a real payload server
//! and answers every HTTP request with 200 OK.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut port: u16 = 5000;
    let mut host = "127.0.0.1".to_string();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                port = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--port requires a value"))?
                    .parse()?;
            }
            "--host" => {
                host = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--host requires a value"))?;
            }
            "--base-path" => {
                let _ = args.next();
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let listener = TcpListener::bind((host.as_str(), port)).await?;

    loop {
        let (mut stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await;
        });
    }
}
