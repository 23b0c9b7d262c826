//! Byte stream sources for the player

use std::path::Path;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncReadExt;

use crate::{Error, Result};

/// Read size used for local files
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Stream a raw PCM file in reads of at most `read_size` bytes
///
/// # Errors
///
/// Returns error if the file cannot be opened or `read_size` is zero
pub async fn file_stream(
    path: impl AsRef<Path>,
    read_size: usize,
) -> Result<BoxStream<'static, std::io::Result<Bytes>>> {
    if read_size == 0 {
        return Err(Error::Config("read size must be positive".to_string()));
    }

    let path = path.as_ref();
    let file = tokio::fs::File::open(path).await?;
    tracing::debug!(path = %path.display(), read_size, "streaming pcm file");

    Ok(futures::stream::try_unfold(file, move |mut file| async move {
        let mut buf = BytesMut::zeroed(read_size);
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok::<_, std::io::Error>(Some((buf.freeze(), file)))
    })
    .boxed())
}

/// Stream the body of a GET request
///
/// # Errors
///
/// Returns error if the request fails or the server answers with a non-success status
pub async fn http_stream(
    client: &reqwest::Client,
    url: &str,
) -> Result<BoxStream<'static, Result<Bytes>>> {
    let response = client.get(url).send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(url, status = %status, "pcm source request failed");
        return Err(Error::Stream(format!("GET {url} returned {status}: {body}")));
    }

    tracing::debug!(url, "streaming pcm over http");
    Ok(response.bytes_stream().map_err(Error::from).boxed())
}
