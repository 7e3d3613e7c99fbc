//! Static file serving with MIME type detection

use crate::response::{full_body, redirect_response, text_response, Body};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.html";

/// Serves files below a fixed root directory
#[derive(Debug, Clone)]
pub struct FileServer {
    root: PathBuf,
}

impl FileServer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve the file named by a request path (and optional query, kept on redirects)
    pub async fn serve(&self, path: &str, query: Option<&str>) -> Response<Body> {
        let decoded = match percent_decode_str(path).decode_utf8() {
            Ok(p) => p.to_string(),
            Err(_) => return text_response(StatusCode::BAD_REQUEST, "Bad Request"),
        };

        let relative = decoded.trim_start_matches('/');
        if relative.split(['/', '\\']).any(|segment| segment == "..") {
            return text_response(StatusCode::BAD_REQUEST, "Bad Request");
        }

        let mut file_path = self.root.clone();
        if !relative.is_empty() {
            file_path.push(relative);
        }

        let meta = match fs::metadata(&file_path).await {
            Ok(meta) => meta,
            Err(_) => return not_found(),
        };

        if !meta.is_dir() {
            return serve_single_file(&file_path).await;
        }

        if !decoded.ends_with('/') {
            let location = match query {
                Some(q) => format!("{}/?{}", path, q),
                None => format!("{}/", path),
            };
            return redirect_response(StatusCode::MOVED_PERMANENTLY, &location);
        }

        let index_path = file_path.join(INDEX_FILE);
        if let Ok(index_meta) = fs::metadata(&index_path).await {
            if index_meta.is_file() {
                return serve_single_file(&index_path).await;
            }
        }

        match directory_listing(&file_path).await {
            Ok(html) => {
                let mut response = Response::new(full_body(html));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("text/html; charset=utf-8"),
                );
                response
            }
            Err(e) => {
                warn!(path = %file_path.display(), "Failed to list directory: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

fn not_found() -> Response<Body> {
    text_response(StatusCode::NOT_FOUND, "404 page not found")
}

/// Serve a single file
async fn serve_single_file(path: &Path) -> Response<Body> {
    let contents = match fs::read(path).await {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path = %path.display(), "Failed to read file: {}", e);
            return not_found();
        }
    };

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let len = contents.len();

    let mut response = Response::new(full_body(contents));
    if let Ok(value) = hyper::header::HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response.headers_mut().insert(CONTENT_LENGTH, len.into());
    response
}

/// Minimal HTML listing, directories first then files, each sorted by name
async fn directory_listing(dir: &Path) -> std::io::Result<String> {
    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;

    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry.file_type().await?.is_dir();
        entries.push((name, is_dir));
    }

    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut html = String::from("<pre>\n");
    for (name, is_dir) in entries {
        let name = if is_dir { format!("{}/", name) } else { name };
        let escaped = escape_html(&name);
        html.push_str(&format!("<a href=\"{}\">{}</a>\n", escaped, escaped));
    }
    html.push_str("</pre>\n");

    Ok(html)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::header::LOCATION;
    use tempfile::tempdir;

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_file_with_mime() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("style.css"), "body {}").unwrap();
        let server = FileServer::new(dir.path().to_path_buf());

        let response = server.serve("/style.css", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/css");
        assert_eq!(body_text(response).await, "body {}");
    }

    #[tokio::test]
    async fn test_percent_decoded_path() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a b.txt"), "spaced").unwrap();
        let server = FileServer::new(dir.path().to_path_buf());

        let response = server.serve("/a%20b.txt", None).await;
        assert_eq!(body_text(response).await, "spaced");
    }

    #[tokio::test]
    async fn test_index_and_redirect() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/index.html"), "<h1>docs</h1>").unwrap();
        let server = FileServer::new(dir.path().to_path_buf());

        let response = server.serve("/docs", Some("x=1")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[LOCATION], "/docs/?x=1");

        let response = server.serve("/docs/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "<h1>docs</h1>");
    }

    #[tokio::test]
    async fn test_directory_listing() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("<a>.txt"), "").unwrap();
        let server = FileServer::new(dir.path().to_path_buf());

        let response = server.serve("/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = body_text(response).await;
        let sub = html.find("sub/").unwrap();
        let b = html.find("b.txt").unwrap();
        assert!(sub < b);
        assert!(html.contains("&lt;a&gt;.txt"));
    }

    #[tokio::test]
    async fn test_missing_and_traversal() {
        let dir = tempdir().unwrap();
        let server = FileServer::new(dir.path().join("root"));
        std::fs::create_dir(dir.path().join("root")).unwrap();
        std::fs::write(dir.path().join("secret"), "no").unwrap();

        let response = server.serve("/missing.txt", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server.serve("/../secret", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = server.serve("/%2e%2e/secret", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
