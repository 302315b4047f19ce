//! Archive download, direct or through a forward proxy.

use crate::error::{LaunchError, Result};
use crate::proxy::ForwardProxy;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Release archives are a few tens of MB; anything past this is not one.
const MAX_ARCHIVE_BYTES: u64 = 512 * 1024 * 1024;

/// Fetch `url` fully into memory.
pub fn download(url: &str, proxy: Option<&ForwardProxy>) -> Result<Vec<u8>> {
    let mut builder = ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(READ_TIMEOUT);
    if let Some(p) = proxy {
        info!(proxy = %p.to_url(), "Downloading through forward proxy");
        builder = builder.proxy(p.to_agent_proxy()?);
    }
    let agent = builder.build();

    let response = agent.get(url).call()?;
    let expected = response
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok());
    debug!(status = response.status(), content_length = ?expected, "archive response");

    let mut data = Vec::with_capacity(expected.unwrap_or(0).min(MAX_ARCHIVE_BYTES) as usize);
    response
        .into_reader()
        .take(MAX_ARCHIVE_BYTES + 1)
        .read_to_end(&mut data)
        .map_err(|e| LaunchError::NetworkFetchError(format!("reading response body: {}", e)))?;

    if data.len() as u64 > MAX_ARCHIVE_BYTES {
        return Err(LaunchError::NetworkFetchError(format!(
            "archive larger than {} bytes",
            MAX_ARCHIVE_BYTES
        )));
    }
    if let Some(n) = expected {
        if n != data.len() as u64 {
            return Err(LaunchError::NetworkFetchError(format!(
                "truncated body: expected {} bytes, got {}",
                n,
                data.len()
            )));
        }
    }

    Ok(data)
}

#[cfg(test)]
pub(crate) mod test_server {
    //! One-shot HTTP server for download tests.

    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    pub struct TestServer {
        pub url: String,
        pub hits: Arc<AtomicUsize>,
    }

    /// Serve `body` with `status` to every connection until the test exits.
    pub fn serve(status: u16, body: Vec<u8>) -> TestServer {
        serve_with_delay(status, body, Duration::ZERO)
    }

    /// Like [`serve`], but hold each response back for `delay`.
    pub fn serve_with_delay(status: u16, body: Vec<u8>, delay: Duration) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                counter.fetch_add(1, Ordering::SeqCst);

                let mut req = Vec::new();
                let mut byte = [0u8; 1];
                while !req.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(1) => req.push(byte[0]),
                        _ => break,
                    }
                }
                std::thread::sleep(delay);
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
            }
        });

        TestServer {
            url: format!("http://{}/v2ray.zip", addr),
            hits,
        }
    }
}
