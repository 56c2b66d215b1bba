//! Transport chunk decoding for request bodies
//!
//! S3 clients signing with SigV4 streaming send bodies in this framing:
//!
//! ```text
//! <hex-size>;chunk-signature=<sig>\r\n
//! <data>\r\n
//! 0;chunk-signature=<sig>\r\n
//! \r\n
//! ```
//!
//! [`ChunkTransportDecoder`] removes that framing (or plain HTTP chunked
//! framing, when the listener has not already done so) and yields the payload
//! incrementally, without buffering whole chunks. Chunk signatures are not
//! verified here.

use crate::{CoreError, Result};
use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::io;

/// How many leading bytes are inspected to detect AWS framing
const SNIFF_LEN: usize = 100;

/// Longest chunk header line accepted
const MAX_HEADER_LINE: usize = 4096;

const CHUNK_SIGNATURE: &[u8] = b"chunk-signature=";

/// Request headers that influence framing detection
#[derive(Clone, Debug, Default)]
pub struct TransportHints {
    /// `x-amz-content-sha256`
    pub content_sha256: Option<String>,
    /// `Content-Encoding`
    pub content_encoding: Option<String>,
    /// `Transfer-Encoding`
    pub transfer_encoding: Option<String>,
    /// Decode HTTP chunked framing ourselves. Leave off when the HTTP server
    /// already strips it.
    pub decode_http_chunked: bool,
}

impl TransportHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_sha256(mut self, value: impl Into<String>) -> Self {
        self.content_sha256 = Some(value.into());
        self
    }

    pub fn with_content_encoding(mut self, value: impl Into<String>) -> Self {
        self.content_encoding = Some(value.into());
        self
    }

    pub fn with_transfer_encoding(mut self, value: impl Into<String>) -> Self {
        self.transfer_encoding = Some(value.into());
        self
    }

    pub fn decode_http_chunked(mut self, enabled: bool) -> Self {
        self.decode_http_chunked = enabled;
        self
    }

    fn declares_aws_chunked(&self) -> bool {
        self.content_sha256
            .as_deref()
            .is_some_and(|v| v.starts_with("STREAMING-"))
            || self
                .content_encoding
                .as_deref()
                .is_some_and(|v| v.split(',').any(|e| e.trim().eq_ignore_ascii_case("aws-chunked")))
    }

    fn declares_http_chunked(&self) -> bool {
        self.transfer_encoding
            .as_deref()
            .is_some_and(|v| v.split(',').any(|e| e.trim().eq_ignore_ascii_case("chunked")))
    }
}

/// Framing detected on a body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// SigV4 streaming chunks with embedded signatures
    AwsChunked,
    /// `Transfer-Encoding: chunked`
    HttpChunked,
    /// No framing; bytes pass through unchanged
    Identity,
}

#[derive(Clone, Copy, Debug)]
enum State {
    Header,
    Data { declared: u64, remaining: u64 },
    DataEnd,
    Done,
}

/// Check whether a body prefix starts with `<hex>;chunk-signature=`
pub fn looks_aws_chunked(prefix: &[u8]) -> bool {
    let Some(semi) = prefix.iter().position(|&b| b == b';') else {
        return false;
    };
    let size = &prefix[..semi];
    !size.is_empty()
        && size.iter().all(u8::is_ascii_hexdigit)
        && prefix[semi + 1..].starts_with(CHUNK_SIGNATURE)
}

/// Lazily removes transport framing from a body stream
pub struct ChunkTransportDecoder<S> {
    inner: S,
    hints: TransportHints,
    buf: BytesMut,
    framing: Option<Framing>,
    state: State,
    inner_done: bool,
}

impl<S> ChunkTransportDecoder<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    pub fn new(inner: S, hints: TransportHints) -> Self {
        Self {
            inner,
            hints,
            buf: BytesMut::new(),
            framing: None,
            state: State::Header,
            inner_done: false,
        }
    }

    /// Framing in use, once the first chunk has been requested
    pub fn framing(&self) -> Option<Framing> {
        self.framing
    }

    /// Pull one more item from the body; `false` at end of input
    async fn fill(&mut self) -> Result<bool> {
        if self.inner_done {
            return Ok(false);
        }
        match self.inner.next().await {
            Some(Ok(bytes)) => {
                self.buf.extend_from_slice(&bytes);
                Ok(true)
            }
            Some(Err(e)) => Err(CoreError::Io(e)),
            None => {
                self.inner_done = true;
                Ok(false)
            }
        }
    }

    async fn detect(&mut self) -> Result<Framing> {
        while self.buf.len() < SNIFF_LEN && self.fill().await? {}

        let framing = if looks_aws_chunked(&self.buf[..self.buf.len().min(SNIFF_LEN)])
            || self.hints.declares_aws_chunked()
        {
            Framing::AwsChunked
        } else if self.hints.decode_http_chunked && self.hints.declares_http_chunked() {
            Framing::HttpChunked
        } else {
            Framing::Identity
        };
        tracing::trace!(?framing, "Detected body framing");
        Ok(framing)
    }

    /// Next piece of decoded payload, or `None` at end of stream
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let result = self.decode_next().await;
        if result.is_err() {
            self.state = State::Done;
        }
        result
    }

    async fn decode_next(&mut self) -> Result<Option<Bytes>> {
        if matches!(self.state, State::Done) {
            return Ok(None);
        }
        let framing = match self.framing {
            Some(f) => f,
            None => {
                let f = self.detect().await?;
                self.framing = Some(f);
                f
            }
        };

        match framing {
            Framing::Identity => self.next_identity().await,
            Framing::AwsChunked | Framing::HttpChunked => self.next_framed().await,
        }
    }

    async fn next_identity(&mut self) -> Result<Option<Bytes>> {
        loop {
            if matches!(self.state, State::Done) {
                return Ok(None);
            }
            if !self.buf.is_empty() {
                return Ok(Some(self.buf.split().freeze()));
            }
            if !self.fill().await? {
                self.state = State::Done;
            }
        }
    }

    async fn next_framed(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Header => {
                    let Some(line) = self.read_line().await? else {
                        self.state = State::Done;
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        // terminal chunk; a final CRLF or trailers may follow and are ignored
                        self.state = State::Done;
                        return Ok(None);
                    }
                    self.state = State::Data {
                        declared: size,
                        remaining: size,
                    };
                }
                State::Data { declared, remaining } => {
                    if self.buf.is_empty() && !self.fill().await? {
                        return Err(CoreError::TruncatedChunk {
                            declared,
                            received: declared - remaining,
                        });
                    }
                    let take = remaining.min(self.buf.len() as u64);
                    let data = self.buf.split_to(take as usize).freeze();
                    let remaining = remaining - take;
                    self.state = if remaining == 0 {
                        State::DataEnd
                    } else {
                        State::Data { declared, remaining }
                    };
                    return Ok(Some(data));
                }
                State::DataEnd => {
                    while self.buf.len() < 2 && self.fill().await? {}
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.advance(2);
                    } else if self.buf.as_ref() == b"\r" {
                        self.buf.advance(1);
                    }
                    self.state = State::Header;
                }
            }
        }
    }

    /// Read a header line without its CRLF; a final line may lack the CRLF
    async fn read_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                return Ok(Some(line));
            }
            if self.buf.len() > MAX_HEADER_LINE {
                return Err(CoreError::Decode(format!(
                    "chunk header longer than {} bytes",
                    MAX_HEADER_LINE
                )));
            }
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buf.split().freeze()));
            }
        }
    }

    /// Decode the whole body into memory
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Turn the decoder into a stream of decoded chunks
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::unfold(self, |mut decoder| async move {
            match decoder.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), decoder)),
                Ok(None) => None,
                Err(e) => Some((Err(e), decoder)),
            }
        })
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = String::from_utf8_lossy(line);
    let token = line.split(';').next().unwrap_or_default().trim();
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoreError::Decode(format!("invalid chunk size {:?}", token)));
    }
    u64::from_str_radix(token, 16)
        .map_err(|_| CoreError::Decode(format!("chunk size {:?} out of range", token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use proptest::prelude::*;

    type BodyStream = stream::Iter<std::vec::IntoIter<io::Result<Bytes>>>;

    fn body(pieces: Vec<&[u8]>) -> BodyStream {
        stream::iter(
            pieces
                .into_iter()
                .map(|p| Ok(Bytes::copy_from_slice(p)))
                .collect::<Vec<_>>(),
        )
    }

    fn bytewise(input: &[u8]) -> BodyStream {
        body(input.chunks(1).collect())
    }

    fn streaming() -> TransportHints {
        TransportHints::new().with_content_sha256("STREAMING-AWS4-HMAC-SHA256-PAYLOAD")
    }

    fn signature(chunk: &[u8]) -> String {
        s3ep_crypto::sha256_hex(chunk)
    }

    fn encode_aws(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks.iter().filter(|c| !c.is_empty()) {
            out.extend_from_slice(format!("{:x};chunk-signature={}\r\n", chunk.len(), signature(chunk)).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("0;chunk-signature={}\r\n\r\n", signature(b"")).as_bytes());
        out
    }

    async fn decode(input: BodyStream, hints: TransportHints) -> Result<Bytes> {
        ChunkTransportDecoder::new(input, hints).read_to_end().await
    }

    #[tokio::test]
    async fn test_single_chunk() {
        let input = b"5;chunk-signature=abc\r\nhello\r\n0;chunk-signature=final\r\n\r\n";
        let out = decode(body(vec![input]), TransportHints::new()).await.unwrap();
        assert_eq!(out.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_two_chunks() {
        let input =
            b"5;chunk-signature=abc\r\nhello\r\n5;chunk-signature=def\r\nworld\r\n0;chunk-signature=final\r\n\r\n";
        let out = decode(body(vec![input]), TransportHints::new()).await.unwrap();
        assert_eq!(out.as_ref(), b"helloworld");

        let out = decode(bytewise(input), TransportHints::new()).await.unwrap();
        assert_eq!(out.as_ref(), b"helloworld");
    }

    #[tokio::test]
    async fn test_empty_input_ends_immediately() {
        let mut decoder = ChunkTransportDecoder::new(body(vec![]), streaming());
        assert!(decoder.next_chunk().await.unwrap().is_none());
        assert!(decoder.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_hex_names_token() {
        let input = b"zz;chunk-signature=abc\r\nhello\r\n";
        let err = decode(body(vec![input]), streaming()).await.unwrap_err();
        match err {
            CoreError::Decode(msg) => assert!(msg.contains("zz"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_chunk_is_read_error() {
        let input = b"a;chunk-signature=abc\r\nhello";
        let mut decoder = ChunkTransportDecoder::new(body(vec![input]), TransportHints::new());
        assert_eq!(decoder.next_chunk().await.unwrap().unwrap().as_ref(), b"hello");
        assert!(matches!(
            decoder.next_chunk().await,
            Err(CoreError::TruncatedChunk { declared: 10, received: 5 })
        ));
        assert!(decoder.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_crlf_is_tolerated() {
        let input = b"5;chunk-signature=abc\r\nhello0;chunk-signature=final";
        let out = decode(body(vec![input]), TransportHints::new()).await.unwrap();
        assert_eq!(out.as_ref(), b"hello");

        let input = b"5;chunk-signature=abc\r\nhello\r\n0;chunk-signature=final\r\n";
        let out = decode(body(vec![input]), TransportHints::new()).await.unwrap();
        assert_eq!(out.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_large_chunk_is_streamed_incrementally() {
        let data = vec![7u8; 1000];
        let encoded = encode_aws(&[data.clone()]);
        let pieces: Vec<&[u8]> = encoded.chunks(100).collect();
        let mut decoder = ChunkTransportDecoder::new(body(pieces), TransportHints::new());

        let mut sizes = Vec::new();
        let mut total = Vec::new();
        while let Some(chunk) = decoder.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
            total.extend_from_slice(&chunk);
        }
        assert!(sizes.len() > 1);
        assert!(sizes.iter().all(|s| *s <= 100));
        assert_eq!(total, data);
        assert_eq!(decoder.framing(), Some(Framing::AwsChunked));
    }

    #[tokio::test]
    async fn test_plain_body_passes_through() {
        let input: &[u8] = b"5\r\nhello\r\n0\r\n\r\n";
        let mut decoder = ChunkTransportDecoder::new(body(vec![input]), TransportHints::new());
        let out = decoder.next_chunk().await.unwrap().unwrap();
        assert_eq!(out.as_ref(), input);
        assert_eq!(decoder.framing(), Some(Framing::Identity));
    }

    #[tokio::test]
    async fn test_http_chunked_only_when_enabled() {
        let input: &[u8] = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let hints = TransportHints::new().with_transfer_encoding("chunked");

        let out = decode(body(vec![input]), hints.clone()).await.unwrap();
        assert_eq!(out.as_ref(), input);

        let out = decode(body(vec![input]), hints.decode_http_chunked(true)).await.unwrap();
        assert_eq!(out.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_unsigned_trailer_framing_via_header() {
        let input: &[u8] = b"5\r\nhello\r\n0\r\nx-amz-checksum-crc32:AAAAAA==\r\n\r\n";
        let hints = TransportHints::new().with_content_sha256("STREAMING-UNSIGNED-PAYLOAD-TRAILER");
        let out = decode(body(vec![input]), hints).await.unwrap();
        assert_eq!(out.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_body_error_is_propagated() {
        let input: BodyStream = stream::iter(vec![
            Ok(Bytes::from_static(b"5;chunk-signature=abc\r\nhe")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let err = decode(input, TransportHints::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn test_looks_aws_chunked() {
        assert!(looks_aws_chunked(b"400;chunk-signature=abcdef\r\n"));
        assert!(!looks_aws_chunked(b"hello;chunk-signature="));
        assert!(!looks_aws_chunked(b";chunk-signature="));
        assert!(!looks_aws_chunked(b"400\r\n"));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..6),
            split in 1usize..64,
        ) {
            let encoded = encode_aws(&chunks);
            let expected: Vec<u8> = chunks.concat();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = rt.block_on(decode(body(encoded.chunks(split).collect()), streaming())).unwrap();
            prop_assert_eq!(decoded.as_ref(), expected.as_slice());
        }

        #[test]
        fn prop_whole_frames_reencode_exactly(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..200), 1..5),
        ) {
            let encoded = encode_aws(&chunks);
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded_chunks = rt.block_on(async {
                let mut decoder = ChunkTransportDecoder::new(body(vec![encoded.as_slice()]), TransportHints::new());
                let mut out = Vec::new();
                while let Some(chunk) = decoder.next_chunk().await.unwrap() {
                    out.push(chunk.to_vec());
                }
                out
            });
            prop_assert_eq!(encode_aws(&decoded_chunks), encoded);
        }
    }
}
