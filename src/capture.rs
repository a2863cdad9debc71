//! Screenshot payloads and the shapes they can be handed out in.

use std::path::Path;

use futures_util::stream::{self, Stream};

use crate::Result;

/// MIME type of every screenshot.
pub const SCREENSHOT_MIME: &str = "image/png";

/// Chunk size used by [`Screenshot::into_stream`] when none is given.
pub const DEFAULT_STREAM_CHUNK: usize = 64 * 1024;

/// A PNG image of the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    data: Vec<u8>,
}

/// Bytes tagged with their MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

impl Screenshot {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn into_blob(self) -> Blob {
        Blob {
            data: self.data,
            mime_type: SCREENSHOT_MIME,
        }
    }

    /// The image as a stream of owned chunks of at most `chunk_size` bytes.
    pub fn into_stream(self, chunk_size: usize) -> impl Stream<Item = Vec<u8>> {
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Vec<u8>> = self.data.chunks(chunk_size).map(<[u8]>::to_vec).collect();
        stream::iter(chunks)
    }

    /// Write the image to a local file.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path, &self.data).await?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for Screenshot {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Screenshot> for Vec<u8> {
    fn from(shot: Screenshot) -> Self {
        shot.data
    }
}
