//! Response construction helpers shared by the handlers

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};

pub type Body = BoxBody<Bytes, hyper::Error>;

/// Create full body
pub fn full_body(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Create empty body
pub fn empty_body() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response with a fixed message
pub fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Redirect response; falls back to a 500 if `location` is not a valid header value
pub fn redirect_response(status: StatusCode, location: &str) -> Response<Body> {
    match hyper::header::HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = status;
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_response() {
        let response = text_response(StatusCode::NOT_FOUND, "Not found.");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Not found.\n");
    }

    #[test]
    fn test_redirect_response() {
        let response = redirect_response(StatusCode::FOUND, "https://example.com/a?b=c");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "https://example.com/a?b=c");

        let bad = redirect_response(StatusCode::FOUND, "bad\nvalue");
        assert_eq!(bad.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
