//! Minimal HTTP serving surface: response writer seam, request shape,
//! serve mux, and the JSON/JSONP API envelope.

pub mod stream;

use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use shared::error::{Error, Result};

/// Response status and headers, buffered until the first body write.
#[derive(Debug, Clone, Default)]
pub struct HttpHeader {
    headers: BTreeMap<String, String>,
}

impl HttpHeader {
    pub fn set(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn set_content_type(&mut self, v: &str) {
        self.set("Content-Type", v);
    }

    pub fn content_type(&self) -> &str {
        self.get("Content-Type").unwrap_or("")
    }

    pub fn set_content_length(&mut self, n: usize) {
        self.set("Content-Length", &n.to_string());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.headers.iter()
    }
}

/// Where handlers write their response; sockets implement it in the
/// binary, [BufferResponseWriter] in tests and internal proxies.
pub trait ResponseWriter {
    fn header(&mut self) -> &mut HttpHeader;
    fn write_header(&mut self, status: u16);
    fn write(&mut self, data: &[u8]) -> Result<usize>;
    /// Completes the response; idempotent.
    fn final_request(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory response writer.
#[derive(Default)]
pub struct BufferResponseWriter {
    pub header: HttpHeader,
    pub status: Option<u16>,
    pub body: Vec<u8>,
    finalized: bool,
}

impl BufferResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

impl ResponseWriter for BufferResponseWriter {
    fn header(&mut self) -> &mut HttpHeader {
        &mut self.header
    }

    fn write_header(&mut self, status: u16) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.finalized {
            return Err(Error::ErrResponseFinalized);
        }
        self.write_header(200);
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn final_request(&mut self) -> Result<()> {
        self.finalized = true;
        Ok(())
    }
}

/// A parsed request: method, path, query and body.
#[derive(Debug, Clone, Default)]
pub struct HttpMessage {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpMessage {
    pub fn get(path: &str) -> Self {
        Self::with_method("GET", path)
    }

    pub fn with_method(method: &str, path: &str) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), parse_query(q)),
            None => (path.to_string(), BTreeMap::new()),
        };
        Self {
            method: method.to_string(),
            path,
            query,
            body: vec![],
        }
    }

    pub fn query_get(&self, key: &str) -> String {
        self.query.get(key).cloned().unwrap_or_default()
    }

    /// JSONP is selected by the `callback` query parameter.
    pub fn is_jsonp(&self) -> bool {
        !self.query_get("callback").is_empty()
    }

    /// Splits `/app/stream.ext` into its parts.
    pub fn parse_stream_path(&self) -> Option<(String, String, String)> {
        let trimmed = self.path.trim_start_matches('/');
        let (app, file) = trimmed.split_once('/')?;
        let (stream, ext) = file.rsplit_once('.')?;
        if app.is_empty() || stream.is_empty() || ext.is_empty() {
            return None;
        }
        Some((app.to_string(), stream.to_string(), ext.to_string()))
    }
}

fn parse_query(q: &str) -> BTreeMap<String, String> {
    q.split('&')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// One mounted handler.
pub trait HttpHandler {
    fn serve_http(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()>;
}

/// Pattern→handler table with exact-path matching.
#[derive(Default)]
pub struct HttpServeMux {
    handlers: RefCell<HashMap<String, Rc<dyn HttpHandler>>>,
}

impl HttpServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, pattern: &str, handler: Rc<dyn HttpHandler>) {
        self.handlers
            .borrow_mut()
            .insert(pattern.to_string(), handler);
    }

    pub fn unhandle(&self, pattern: &str) {
        self.handlers.borrow_mut().remove(pattern);
    }

    pub fn find(&self, path: &str) -> Option<Rc<dyn HttpHandler>> {
        self.handlers.borrow().get(path).cloned()
    }

    pub fn serve_http(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
        match self.find(&r.path) {
            Some(handler) => handler.serve_http(w, r),
            None => {
                w.header().set_content_type("application/json");
                w.write_header(404);
                w.write(br#"{"code":404}"#)?;
                w.final_request()
            }
        }
    }
}

/// Writes one JSON value with the envelope content type, or the JSONP
/// wrapper when the request carries `?callback=`.
pub fn api_response(w: &mut dyn ResponseWriter, r: &HttpMessage, data: Value) -> Result<()> {
    let body = data.to_string();
    if r.is_jsonp() {
        api_response_jsonp(w, &r.query_get("callback"), &body)
    } else {
        w.header().set_content_type("application/json");
        w.header().set_content_length(body.len());
        w.write_header(200);
        w.write(body.as_bytes())?;
        w.final_request()
    }
}

pub fn api_response_jsonp(w: &mut dyn ResponseWriter, callback: &str, data: &str) -> Result<()> {
    let body = format!("{callback}({data})");
    w.header().set_content_type("text/javascript");
    w.header().set_content_length(body.len());
    w.write_header(200);
    w.write(body.as_bytes())?;
    w.final_request()
}

/// `{code: N}` responses. The error, when one is surfaced, is consumed
/// here.
pub fn api_response_code(w: &mut dyn ResponseWriter, r: &HttpMessage, code: i32) -> Result<()> {
    api_response(w, r, serde_json::json!({ "code": code }))
}

pub fn api_response_err(w: &mut dyn ResponseWriter, r: &HttpMessage, err: Error) -> Result<()> {
    api_response_code(w, r, err.api_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_jsonp_response() {
        let mut w = BufferResponseWriter::new();
        api_response_jsonp(&mut w, "myCallback", r#"{"code":0,"message":"success"}"#).unwrap();
        assert!(w
            .body_str()
            .contains(r#"myCallback({"code":0,"message":"success"})"#));
        assert_eq!(w.header.content_type(), "text/javascript");
    }

    #[test]
    fn test_api_response_code_json_and_jsonp() {
        // Plain JSON.
        let mut w = BufferResponseWriter::new();
        let req = HttpMessage::get("/api/v1/test");
        api_response_code(&mut w, &req, 0).unwrap();
        assert!(w.body_str().contains(r#"{"code":0}"#));
        assert!(!w.body_str().contains("callback"));
        assert_eq!(w.header.content_type(), "application/json");

        // JSONP with a callback.
        let mut w = BufferResponseWriter::new();
        let req = HttpMessage::get("/api/v1/test?callback=myCallback");
        api_response_code(&mut w, &req, 0).unwrap();
        assert!(w.body_str().contains(r#"myCallback({"code":0})"#));

        // Error surfaced as its numeric code.
        let mut w = BufferResponseWriter::new();
        let req = HttpMessage::get("/api/v1/test");
        api_response_err(&mut w, &req, Error::ErrStreamNotFound).unwrap();
        assert!(w.body_str().contains(r#"{"code":2037}"#));

        let mut w = BufferResponseWriter::new();
        let req = HttpMessage::get("/api/v1/test?callback=errorCallback");
        api_response_err(&mut w, &req, Error::ErrStreamNotFound).unwrap();
        assert!(w.body_str().contains(r#"errorCallback({"code":2037})"#));
    }

    #[test]
    fn test_mux_dispatch_and_404() {
        struct Pong;
        impl HttpHandler for Pong {
            fn serve_http(&self, w: &mut dyn ResponseWriter, r: &HttpMessage) -> Result<()> {
                api_response(w, r, json!({"code": 0, "pong": true}))
            }
        }

        let mux = HttpServeMux::new();
        mux.handle("/api/v1/ping", Rc::new(Pong));

        let mut w = BufferResponseWriter::new();
        mux.serve_http(&mut w, &HttpMessage::get("/api/v1/ping")).unwrap();
        assert!(w.body_str().contains(r#""pong":true"#));

        let mut w = BufferResponseWriter::new();
        mux.serve_http(&mut w, &HttpMessage::get("/missing")).unwrap();
        assert_eq!(w.status, Some(404));

        mux.unhandle("/api/v1/ping");
        assert!(mux.find("/api/v1/ping").is_none());
    }

    #[test]
    fn test_parse_stream_path() {
        let req = HttpMessage::get("/live/cam1.flv");
        assert_eq!(
            req.parse_stream_path(),
            Some(("live".to_string(), "cam1".to_string(), "flv".to_string()))
        );

        let req = HttpMessage::get("/live/noext");
        assert_eq!(req.parse_stream_path(), None);
    }

    #[test]
    fn test_writer_finalized_refuses_writes() {
        let mut w = BufferResponseWriter::new();
        w.write(b"a").unwrap();
        w.final_request().unwrap();
        assert_eq!(w.write(b"b"), Err(Error::ErrResponseFinalized));
    }
}
