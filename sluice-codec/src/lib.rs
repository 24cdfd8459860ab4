mod compress;
mod error;

pub use compress::{ContentEncoding, decode_body, deflate_decompress, gzip_decompress};
pub use error::CodecError;
