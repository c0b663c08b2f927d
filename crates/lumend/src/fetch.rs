//! Schema document download.
//!
//! The gateway serves its configuration database over plain HTTP on the
//! same host as the integration port. The document is around 100 kB and
//! arrives in small chunks with noticeable pauses, so the fetch reports
//! progress after every chunk; the controller uses that to keep the
//! link's init deadline from expiring while the download crawls along.

use std::net::SocketAddr;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Path of the schema resource on the gateway's web server.
pub const SCHEMA_PATH: &str = "/DbXmlInfo.xml";
/// The gateway's web server port.
pub const SCHEMA_PORT: u16 = 80;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("schema fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no XML payload in the schema response")]
    NoPayload,
}

/// Download the schema document from the gateway's web server at
/// `addr`. `progress` runs after every received chunk. Returns the raw
/// XML text.
pub async fn fetch_schema(
    addr: SocketAddr,
    progress: impl Fn(),
) -> Result<String, FetchError> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {SCHEMA_PATH} HTTP/1.0\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut buf = BytesMut::with_capacity(1100);
    loop {
        buf.clear();
        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            break;
        }
        progress();
        response.extend_from_slice(&buf);
    }

    // Strip the HTTP header: the payload starts at the first XML
    // declaration after a line boundary.
    let text = String::from_utf8_lossy(&response);
    let start = text.find("\r\n<?xml ").ok_or(FetchError::NoPayload)?;
    let xml = text[start + 2..].to_string();
    debug!("read {} bytes of schema information", xml.len());
    Ok(xml)
}
