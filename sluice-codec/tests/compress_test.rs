use std::io::Write;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use sluice_codec::*;

fn gzip(input: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn gzip_body_is_decoded() {
    let decoded = decode_body("gzip", &gzip(b"hello gzip")).unwrap();
    assert_eq!(decoded, b"hello gzip");
}

#[test]
fn deflate_accepts_zlib_and_raw_streams() {
    let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
    zlib.write_all(b"zlib wrapped").unwrap();
    assert_eq!(
        deflate_decompress(&zlib.finish().unwrap()).unwrap(),
        b"zlib wrapped"
    );

    let mut raw = DeflateEncoder::new(Vec::new(), Compression::default());
    raw.write_all(b"raw deflate").unwrap();
    assert_eq!(deflate_decompress(&raw.finish().unwrap()).unwrap(), b"raw deflate");
}

#[test]
fn stacked_encodings_unwind_in_reverse() {
    let twice = gzip(&gzip(b"nested"));
    assert_eq!(decode_body("gzip, gzip", &twice).unwrap(), b"nested");
}

#[test]
fn identity_passes_through() {
    assert_eq!(decode_body("identity", b"plain").unwrap(), b"plain");
    assert_eq!(decode_body("", b"plain").unwrap(), b"plain");
}

#[test]
fn unknown_encoding_is_reported() {
    let err = decode_body("br", b"\x0b\x02").unwrap_err();
    assert_matches!(err, CodecError::Unsupported(name) if name == "br");
}

#[test]
fn gzip_invalid_errors() {
    let err = gzip_decompress(b"not gzip").unwrap_err();
    assert_matches!(err, CodecError::Compression(_));
}
