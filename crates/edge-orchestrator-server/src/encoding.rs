//! Content-encoding negotiation.
//!
//! The engine answers with uncompressed bodies and a `Content-Encoding`
//! header naming the encoding the worker asked for. The front door then
//! picks the encoding actually sent from that request and the client's
//! `Accept-Encoding`, and compresses the body itself.

use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use axum::body::Body;
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use axum::http::{HeaderMap, HeaderValue, Response};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use hyper::body::{Body as HttpBody, Frame};
use tracing::{debug, warn};

use edge_orchestrator_common::OrchestratorError;

use crate::response::error_response;

/// Encodings the server produces, as advertised on a 415 response.
pub const SUPPORTED_ENCODINGS: &str = "br, gzip";

/// Content types never compressed, whatever was negotiated.
const UNCOMPRESSED_CONTENT_TYPES: &[&str] = &["text/event-stream"];

/// A content coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// No encoding.
    Identity,
    /// Brotli.
    Brotli,
    /// Gzip.
    Gzip,
    /// Zlib-wrapped deflate.
    Deflate,
}

/// Compressed encodings, in default preference order.
const COMPRESSED: [Encoding; 3] = [Encoding::Brotli, Encoding::Gzip, Encoding::Deflate];

impl Encoding {
    /// Parse a coding token.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "identity" => Some(Self::Identity),
            "br" => Some(Self::Brotli),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }

    /// The coding token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Brotli => "br",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// Parsed `Accept-Encoding` header.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptEncoding {
    entries: Vec<(String, f32)>,
}

impl AcceptEncoding {
    /// Parse a header value.
    ///
    /// Returns `None` when the value is empty or malformed; callers then
    /// fall back to the default ordering.
    pub fn parse(value: &str) -> Option<Self> {
        let mut entries = Vec::new();
        for item in value.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let mut params = item.split(';');
            let coding = params.next()?.trim().to_ascii_lowercase();
            if coding.is_empty() || coding.contains(char::is_whitespace) {
                return None;
            }

            let mut quality = 1.0_f32;
            for param in params {
                let (key, value) = param.split_once('=')?;
                if key.trim().eq_ignore_ascii_case("q") {
                    quality = value.trim().parse().ok()?;
                    if !(0.0..=1.0).contains(&quality) {
                        return None;
                    }
                }
            }
            entries.push((coding, quality));
        }

        if entries.is_empty() {
            None
        } else {
            Some(Self { entries })
        }
    }

    fn explicit(&self, coding: &str) -> Option<f32> {
        self.entries
            .iter()
            .find(|(name, _)| name == coding)
            .map(|(_, q)| *q)
    }

    /// Quality the client assigns to `encoding`.
    pub fn quality(&self, encoding: Encoding) -> f32 {
        let token = encoding.as_str();
        let aliased = if encoding == Encoding::Gzip {
            self.explicit("x-gzip")
        } else {
            None
        };
        self.explicit(token)
            .or(aliased)
            .or_else(|| self.explicit("*"))
            // Identity is acceptable unless excluded
            .unwrap_or(if encoding == Encoding::Identity { 1.0 } else { 0.0 })
    }
}

/// Pick the encoding to send.
///
/// `requested` is the encoding the worker tagged its response with. It is
/// kept when the client accepts it; otherwise the client's best compressed
/// encoding is used, then identity.
///
/// # Errors
///
/// Returns `UnsupportedEncoding` when the client refuses every encoding,
/// identity included.
pub fn negotiate(
    accept_encoding: Option<&str>,
    requested: Encoding,
) -> Result<Encoding, OrchestratorError> {
    let Some(accept) = accept_encoding.and_then(AcceptEncoding::parse) else {
        return Ok(requested);
    };

    if accept.quality(requested) > 0.0 {
        return Ok(requested);
    }

    let mut best: Option<(Encoding, f32)> = None;
    for encoding in COMPRESSED {
        let quality = accept.quality(encoding);
        if quality > 0.0 && best.is_none_or(|(_, q)| quality > q) {
            best = Some((encoding, quality));
        }
    }
    if let Some((encoding, _)) = best {
        return Ok(encoding);
    }

    if accept.quality(Encoding::Identity) > 0.0 {
        return Ok(Encoding::Identity);
    }

    Err(OrchestratorError::UnsupportedEncoding {
        accept_encoding: accept_encoding.unwrap_or_default().to_string(),
    })
}

/// Returns `true` if `content_type` is never compressed.
pub fn is_uncompressed_type(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|value| {
        let essence = value.split(';').next().unwrap_or_default().trim();
        UNCOMPRESSED_CONTENT_TYPES
            .iter()
            .any(|exempt| essence.eq_ignore_ascii_case(exempt))
    })
}

/// Incremental compressor for one body.
enum Compressor {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
    Brotli(Box<brotli::CompressorWriter<Vec<u8>>>),
}

impl Compressor {
    fn new(encoding: Encoding) -> Option<Self> {
        match encoding {
            Encoding::Identity => None,
            Encoding::Gzip => Some(Self::Gzip(GzEncoder::new(Vec::new(), Compression::default()))),
            Encoding::Deflate => Some(Self::Deflate(ZlibEncoder::new(
                Vec::new(),
                Compression::default(),
            ))),
            Encoding::Brotli => Some(Self::Brotli(Box::new(brotli::CompressorWriter::new(
                Vec::new(),
                4096,
                5,
                22,
            )))),
        }
    }

    /// Compress `chunk` and take the output produced so far.
    ///
    /// The encoder is flushed, so the returned bytes decode to everything
    /// written up to now.
    fn write(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        let output = match self {
            Self::Gzip(encoder) => {
                encoder.write_all(chunk)?;
                encoder.flush()?;
                encoder.get_mut()
            }
            Self::Deflate(encoder) => {
                encoder.write_all(chunk)?;
                encoder.flush()?;
                encoder.get_mut()
            }
            Self::Brotli(encoder) => {
                encoder.write_all(chunk)?;
                encoder.flush()?;
                encoder.get_mut()
            }
        };
        Ok(Bytes::from(std::mem::take(output)))
    }

    /// End the stream and take the remaining output.
    fn finish(self) -> io::Result<Bytes> {
        let output = match self {
            Self::Gzip(encoder) => encoder.finish()?,
            Self::Deflate(encoder) => encoder.finish()?,
            Self::Brotli(encoder) => (*encoder).into_inner(),
        };
        Ok(Bytes::from(output))
    }
}

/// A response body compressed frame by frame as it streams.
pub struct EncodedBody {
    inner: Body,
    compressor: Option<Compressor>,
    trailers: Option<HeaderMap>,
}

impl EncodedBody {
    /// Wrap `inner` into an axum body compressed with `encoding`.
    pub fn wrap(inner: Body, encoding: Encoding) -> Body {
        Body::new(Self {
            inner,
            compressor: Compressor::new(encoding),
            trailers: None,
        })
    }
}

impl HttpBody for EncodedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        loop {
            let Some(compressor) = this.compressor.as_mut() else {
                return Poll::Ready(this.trailers.take().map(|trailers| Ok(Frame::trailers(trailers))));
            };

            let encoded = match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => compressor.write(&data),
                    Err(frame) => {
                        // Trailers end the body; they follow the final block
                        this.trailers = frame.into_trailers().ok();
                        this.compressor.take().map_or(Ok(Bytes::new()), Compressor::finish)
                    }
                },
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => this.compressor.take().map_or(Ok(Bytes::new()), Compressor::finish),
            };

            match encoded {
                Ok(bytes) if bytes.is_empty() => {}
                Ok(bytes) => return Poll::Ready(Some(Ok(Frame::data(bytes)))),
                Err(err) => {
                    warn!(%err, "Failed to encode response body");
                    this.compressor = None;
                    this.trailers = None;
                    return Poll::Ready(Some(Err(axum::Error::new(err))));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.compressor.is_none() && self.trailers.is_none()
    }
}

/// Encode an engine response for the client.
///
/// Identity and uncompressed content types stream through untouched; other
/// bodies are compressed as their frames arrive.
pub fn encode_response(response: Response<Body>, accept_encoding: Option<&str>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();

    let uncompressed = is_uncompressed_type(
        parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
    );
    let requested = match parts.headers.get(CONTENT_ENCODING) {
        None => Encoding::Identity,
        Some(value) => match value.to_str().ok().and_then(Encoding::parse) {
            Some(encoding) => encoding,
            // Unknown codings are the worker's business
            None => return Response::from_parts(parts, body),
        },
    };

    let encoding = if uncompressed {
        Encoding::Identity
    } else {
        match negotiate(accept_encoding, requested) {
            Ok(encoding) => encoding,
            Err(err) => {
                debug!(accept_encoding = ?accept_encoding, "No acceptable encoding");
                let mut response = error_response(&err);
                response
                    .headers_mut()
                    .insert(ACCEPT_ENCODING, HeaderValue::from_static(SUPPORTED_ENCODINGS));
                return response;
            }
        }
    };

    if encoding == Encoding::Identity {
        parts.headers.remove(CONTENT_ENCODING);
        return Response::from_parts(parts, body);
    }

    parts.headers.remove(CONTENT_LENGTH);
    parts
        .headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
    parts
        .headers
        .append(VARY, HeaderValue::from_static("Accept-Encoding"));
    Response::from_parts(parts, EncodedBody::wrap(body, encoding))
}
