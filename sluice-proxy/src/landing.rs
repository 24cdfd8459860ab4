use sluice_net::{Header, HttpVersion, Request, StatusLine, serialize_response};
use sluice_store::HttpResponse;

use crate::forward::simple_response;

const CA_FILE_NAME: &str = "sluice-ca.crt";

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>sluice</title></head>
<body>
<h1>sluice intercepting proxy</h1>
<p>Traffic sent through this proxy is captured for inspection. To intercept
HTTPS without certificate warnings, install the proxy's CA certificate and
trust it for identifying websites.</p>
<p><a href="/download-ca">Download the CA certificate</a></p>
<ol>
<li>Firefox: Settings, Privacy &amp; Security, Certificates, View Certificates,
Authorities, Import.</li>
<li>Chrome and Edge: use the operating system certificate store.</li>
<li>macOS: open the file in Keychain Access and set it to Always Trust.</li>
<li>Linux: copy it into <code>/usr/local/share/ca-certificates</code> and run
<code>update-ca-certificates</code>.</li>
</ol>
</body>
</html>
"#;

/// Answer a request addressed to the proxy itself.
pub(crate) fn respond(request: &Request, ca_pem: &[u8]) -> HttpResponse {
    let method = request.line.method.as_str();
    if !method.eq_ignore_ascii_case("GET") && !method.eq_ignore_ascii_case("HEAD") {
        return simple_response(
            405,
            "Method Not Allowed",
            "text/plain; charset=utf-8",
            b"method not allowed\n".to_vec(),
        );
    }

    let path = origin_path(&request.line.target);
    let response = match path {
        "/" | "/index.html" => simple_response(
            200,
            "OK",
            "text/html; charset=utf-8",
            LANDING_PAGE.as_bytes().to_vec(),
        ),
        "/download-ca" | "/download-ca/" => download_ca(ca_pem),
        _ => simple_response(
            404,
            "Not Found",
            "text/plain; charset=utf-8",
            b"not found\n".to_vec(),
        ),
    };

    if method.eq_ignore_ascii_case("HEAD") {
        strip_body(response)
    } else {
        response
    }
}

fn download_ca(ca_pem: &[u8]) -> HttpResponse {
    let line = StatusLine {
        version: HttpVersion::Http11,
        status_code: 200,
        reason: "OK".to_string(),
    };
    let headers = vec![
        Header::new("Content-Type", "application/x-x509-ca-cert"),
        Header::new(
            "Content-Disposition",
            format!("attachment; filename=\"{CA_FILE_NAME}\""),
        ),
        Header::new("Content-Length", ca_pem.len().to_string()),
    ];
    HttpResponse::new(serialize_response(&line, &headers, ca_pem))
}

fn strip_body(response: HttpResponse) -> HttpResponse {
    let Ok(parsed) = response.parse() else {
        return response;
    };
    HttpResponse::new(serialize_response(&parsed.line, &parsed.headers, &[]))
}

/// Path component of an origin- or absolute-form target, without the query.
fn origin_path(target: &str) -> &str {
    let path = match target.find("://") {
        Some(scheme_end) => {
            let rest = &target[scheme_end + 3..];
            rest.find('/').map(|index| &rest[index..]).unwrap_or("/")
        }
        None => target,
    };
    path.split(['?', '#']).next().unwrap_or("/")
}
