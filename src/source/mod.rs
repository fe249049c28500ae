//! Byte sources the pipeline can read from: local files, HTTP(S) objects
//! (plain or presigned URLs) and arbitrary streams of byte chunks.
//!
//! None of these buffer the whole input; they hand the decoder an
//! `AsyncRead` that pulls chunks on demand.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures_util::TryStreamExt;
use reqwest::Client;
use std::{io, path::Path};
use tokio::{
    fs::File,
    io::{AsyncRead, BufReader},
};
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};
use url::Url;

/// Reader over a boxed stream of byte chunks.
pub type ByteStreamReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Any source, type-erased.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Open a local CSV file.
pub async fn open_file(path: impl AsRef<Path>) -> Result<BufReader<File>> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;
    debug!(path = %path.display(), "opened csv file");
    Ok(BufReader::new(file))
}

/// Adapt a stream of byte chunks (e.g. an object-storage body) into a reader.
/// A record may span any number of chunks.
pub fn from_byte_stream<S>(stream: S) -> ByteStreamReader
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    StreamReader::new(stream.boxed())
}

/// Stream the body of an HTTP(S) URL, such as a presigned object URL.
#[instrument(level = "debug", skip(client))]
pub async fn open_url(client: &Client, url: &str) -> Result<ByteStreamReader> {
    let url = Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
    match url.scheme() {
        "http" | "https" => {}
        other => bail!("Unsupported URL scheme {:?} in {}", other, url),
    }

    let response = client
        .get(url.as_str())
        .send()
        .await
        .with_context(|| format!("Failed to send request to {}", url))?
        .error_for_status()
        .with_context(|| format!("HTTP error fetching {}", url))?;
    debug!(
        status = %response.status(),
        content_length = ?response.content_length(),
        "streaming csv body"
    );

    let body = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    Ok(from_byte_stream(body))
}

/// Open `location` as a URL when it starts with `http://` or `https://`,
/// otherwise as a local path.
pub async fn open(client: &Client, location: &str) -> Result<BoxedReader> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(open_url(client, location).await?))
    } else {
        Ok(Box::new(open_file(location).await?))
    }
}
