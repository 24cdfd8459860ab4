mod edit;
mod parser;
mod types;

pub use edit::{
    header_value, join_authority, remove_header, serialize_request, serialize_response,
    set_header, split_authority,
};
pub use parser::{ParseStatus, RequestParser, ResponseParser, parse_request, parse_response};
pub use types::{
    Framing, Header, HttpVersion, Limits, ParseError, ParseErrorKind, Request, RequestLine,
    Response, StatusLine,
};
