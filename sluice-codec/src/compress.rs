use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

use crate::CodecError;

/// A single token from a `Content-Encoding` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Other(String),
}

impl ContentEncoding {
    pub fn parse(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Self::Identity,
            "gzip" | "x-gzip" => Self::Gzip,
            "deflate" => Self::Deflate,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Undo every encoding listed in a `Content-Encoding` header value.
///
/// Encodings are listed in the order they were applied, so they are removed
/// back to front.
pub fn decode_body(header_value: &str, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut output = body.to_vec();
    for token in header_value.rsplit(',') {
        output = match ContentEncoding::parse(token) {
            ContentEncoding::Identity => output,
            ContentEncoding::Gzip => gzip_decompress(&output)?,
            ContentEncoding::Deflate => deflate_decompress(&output)?,
            ContentEncoding::Other(name) => return Err(CodecError::Unsupported(name)),
        };
    }
    Ok(output)
}

pub fn gzip_decompress(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(input);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|err| CodecError::Compression(err.to_string()))?;
    Ok(output)
}

/// HTTP "deflate" is specified as zlib-wrapped, but plenty of servers send a
/// raw deflate stream. Try zlib first.
pub fn deflate_decompress(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut output = Vec::new();
    if ZlibDecoder::new(input).read_to_end(&mut output).is_ok() {
        return Ok(output);
    }
    output.clear();
    DeflateDecoder::new(input)
        .read_to_end(&mut output)
        .map_err(|err| CodecError::Compression(err.to_string()))?;
    Ok(output)
}
