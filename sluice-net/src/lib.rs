mod http1;
mod tls;

pub use http1::{
    Framing, Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseStatus, Request,
    RequestLine, RequestParser, Response, ResponseParser, StatusLine, header_value,
    join_authority, parse_request, parse_response, remove_header, serialize_request,
    serialize_response, set_header, split_authority,
};

pub use tls::{
    CaCertificate, CertificateManager, CertificateOptions, LeafCertificate, TlsError,
    TlsErrorKind, build_acceptor, build_connector, generate_ca, load_ca,
};
