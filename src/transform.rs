//! Named, reversible content filters applied to file content before it is
//! compressed.
//!
//! A [`Transform`] pairs a forward filter with its inverse. Both work on
//! arbitrary chunk boundaries and keep only bounded state, so they can be
//! layered over any [`AsyncRead`] with [`FilterReader`].

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{Error, Result};

/// Name of the no-op transform.
pub const IDENTITY: &str = "identity";

/// Name of the built-in byte inverting transform.
pub const INVERT: &str = "invert";

/// A streaming byte filter.
pub trait StreamFilter: Send {
    /// Filter `input`, appending the produced bytes to `output`. Bytes may be
    /// held back until more input arrives.
    fn update(&mut self, input: &[u8], output: &mut Vec<u8>);

    /// Flush any held-back bytes at end of stream.
    fn finish(&mut self, output: &mut Vec<u8>);
}

type FilterFactory = Arc<dyn Fn() -> Box<dyn StreamFilter> + Send + Sync>;

/// A named pair of forward and inverse filters.
#[derive(Clone)]
pub struct Transform {
    name: String,
    forward: FilterFactory,
    inverse: FilterFactory,
}

impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transform").field("name", &self.name).finish()
    }
}

impl Transform {
    pub fn new<F, I>(name: impl Into<String>, forward: F, inverse: I) -> Self
    where
        F: Fn() -> Box<dyn StreamFilter> + Send + Sync + 'static,
        I: Fn() -> Box<dyn StreamFilter> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            forward: Arc::new(forward),
            inverse: Arc::new(inverse),
        }
    }

    pub fn identity() -> Self {
        Self::new(IDENTITY, || Box::new(Passthrough), || Box::new(Passthrough))
    }

    pub fn invert() -> Self {
        Self::new(
            INVERT,
            || Box::new(BlockInvert::default()),
            || Box::new(BlockInvert::default()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_identity(&self) -> bool {
        self.name == IDENTITY
    }

    /// Apply the forward filter to a stream.
    pub fn transform<R: AsyncRead + Unpin>(&self, stream: R) -> FilterReader<R> {
        FilterReader::new(stream, (self.forward)())
    }

    /// Apply the inverse filter to a stream.
    pub fn recover<R: AsyncRead + Unpin>(&self, stream: R) -> FilterReader<R> {
        FilterReader::new(stream, (self.inverse)())
    }

    pub fn forward_filter(&self) -> Box<dyn StreamFilter> {
        (self.forward)()
    }

    pub fn inverse_filter(&self) -> Box<dyn StreamFilter> {
        (self.inverse)()
    }
}

/// Transforms known to a session, by name.
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    transforms: HashMap<String, Transform>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        let mut registry = Self {
            transforms: HashMap::new(),
        };
        registry.register(Transform::identity());
        registry.register(Transform::invert());
        registry
    }
}

impl TransformRegistry {
    /// Register a transform, replacing any previous one with the same name.
    pub fn register(&mut self, transform: Transform) {
        self.transforms.insert(transform.name.clone(), transform);
    }

    /// Look up a transform. `None` resolves to the identity transform.
    pub fn resolve(&self, script_id: Option<&str>) -> Result<Transform> {
        let Some(script_id) = script_id else {
            return Ok(Transform::identity());
        };
        self.transforms
            .get(script_id)
            .cloned()
            .ok_or_else(|| Error::Transform {
                script_id: script_id.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

struct Passthrough;

impl StreamFilter for Passthrough {
    fn update(&mut self, input: &[u8], output: &mut Vec<u8>) {
        output.extend_from_slice(input);
    }

    fn finish(&mut self, _output: &mut Vec<u8>) {}
}

const INVERT_BLOCK: usize = 8;

/// Inverts every byte, one 8-byte block at a time. The trailing partial
/// block is inverted on `finish`.
#[derive(Default)]
struct BlockInvert {
    block: Vec<u8>,
}

impl BlockInvert {
    fn flush_block(&mut self, output: &mut Vec<u8>) {
        output.extend(self.block.drain(..).map(|b| b ^ 0xFF));
    }
}

impl StreamFilter for BlockInvert {
    fn update(&mut self, input: &[u8], output: &mut Vec<u8>) {
        for &byte in input {
            self.block.push(byte);
            if self.block.len() == INVERT_BLOCK {
                self.flush_block(output);
            }
        }
    }

    fn finish(&mut self, output: &mut Vec<u8>) {
        self.flush_block(output);
    }
}

const FILTER_READ_SIZE: usize = 64 * 1024;

/// An [`AsyncRead`] adapter running a [`StreamFilter`] over its inner
/// stream.
pub struct FilterReader<R> {
    inner: R,
    filter: Box<dyn StreamFilter>,
    scratch: Box<[u8]>,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R> FilterReader<R> {
    pub fn new(inner: R, filter: Box<dyn StreamFilter>) -> Self {
        Self {
            inner,
            filter,
            scratch: vec![0u8; FILTER_READ_SIZE].into_boxed_slice(),
            pending: Vec::new(),
            pos: 0,
            done: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FilterReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.pos);
                buf.put_slice(&this.pending[this.pos..this.pos + n]);
                this.pos += n;
                if this.pos == this.pending.len() {
                    this.pending.clear();
                    this.pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            let mut raw = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            let filled = raw.filled();
            if filled.is_empty() {
                this.filter.finish(&mut this.pending);
                this.done = true;
            } else {
                this.filter.update(filled, &mut this.pending);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn run(filter: &mut dyn StreamFilter, chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            filter.update(chunk, &mut out);
        }
        filter.finish(&mut out);
        out
    }

    #[test]
    fn invert_holds_partial_blocks() {
        let mut filter = BlockInvert::default();
        let mut out = Vec::new();
        filter.update(&[0x00, 0x01, 0x02], &mut out);
        assert!(out.is_empty());
        filter.update(&[0u8; 6], &mut out);
        assert_eq!(out.len(), 8);
        filter.finish(&mut out);
        assert_eq!(out.len(), 9);
        assert_eq!(&out[..3], &[0xFF, 0xFE, 0xFD]);
    }

    #[test]
    fn invert_is_reversible_across_chunkings() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let forward = run(&mut BlockInvert::default(), &[&data[..13], &data[13..500], &data[500..]]);
        assert_ne!(forward, data);
        let back = run(&mut BlockInvert::default(), &[&forward[..7], &forward[7..]]);
        assert_eq!(back, data);
    }

    #[test]
    fn registry_resolves_names() {
        let registry = TransformRegistry::default();
        assert!(registry.resolve(None).unwrap().is_identity());
        assert_eq!(registry.resolve(Some(INVERT)).unwrap().name(), INVERT);
        assert_eq!(
            registry.resolve(Some("rot13")).unwrap_err(),
            Error::Transform {
                script_id: "rot13".to_string()
            }
        );
        assert_eq!(registry.names(), vec![IDENTITY, INVERT]);
    }

    #[tokio::test]
    async fn filter_reader_round_trips() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let transform = Transform::invert();

        let mut transformed = Vec::new();
        transform
            .transform(&data[..])
            .read_to_end(&mut transformed)
            .await
            .unwrap();
        assert_eq!(transformed.len(), data.len());
        assert!(transformed.iter().zip(&data).all(|(t, d)| *t == d ^ 0xFF));

        let mut recovered = Vec::new();
        transform
            .recover(&transformed[..])
            .read_to_end(&mut recovered)
            .await
            .unwrap();
        assert_eq!(recovered, data);
    }

    #[tokio::test]
    async fn filter_reader_on_empty_stream() {
        let mut out = Vec::new();
        Transform::invert()
            .transform(tokio::io::empty())
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
