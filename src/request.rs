//! Incoming request, as handed over by the transport.
//!
//! A [`RawRequest`] is everything the dispatcher needs and nothing it has to
//! interpret yet: matched path params, the query string split into a map, the
//! body already parsed as JSON, headers and cookies. Decoding against the
//! endpoint's schemas happens later, in the parser.

use std::collections::HashMap;

use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::Value;

use crate::method::Method;

/// An incoming HTTP request after routing, before validation.
#[derive(Clone, Debug)]
pub struct RawRequest {
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) path: String,
    pub(crate) params: HashMap<String, String>,
    pub(crate) query: HashMap<String, String>,
    pub(crate) body: Body,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) cookies: HashMap<String, String>,
}

/// The request body as the parser sees it.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    /// Bytes were sent but could not be read or parsed as JSON.
    Invalid(String),
}

impl RawRequest {
    pub fn builder(method: Method, url: &str) -> RawRequestBuilder {
        RawRequestBuilder {
            req: Self {
                method,
                url: url.to_owned(),
                path: path_of(url).to_owned(),
                params: HashMap::new(),
                query: parse_query(url),
                body: Body::Empty,
                headers: Vec::new(),
                cookies: HashMap::new(),
            },
        }
    }

    /// Converts a transport request, reading the body and the URL-derived
    /// maps concurrently.
    pub async fn from_http<B>(req: http::Request<B>, params: HashMap<String, String>) -> Option<Self>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let method = Method::try_from(&parts.method).ok()?;
        let url = parts.uri.path_and_query().map_or("/", |pq| pq.as_str()).to_owned();

        let read_body = async move {
            match body.collect().await {
                Ok(collected) => parse_body(&collected.to_bytes()),
                Err(e) => Body::Invalid(format!("failed to read body: {e}")),
            }
        };
        let read_meta = async {
            let headers: Vec<(String, String)> = parts
                .headers
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
                .collect();
            let cookies = headers
                .iter()
                .filter(|(k, _)| k == "cookie")
                .flat_map(|(_, v)| parse_cookies(v))
                .collect();
            (parse_query(&url), headers, cookies)
        };
        let (body, (query, headers, cookies)) = tokio::join!(read_body, read_meta);

        Some(Self {
            method,
            path: path_of(&url).to_owned(),
            url,
            params,
            query,
            body,
            headers,
            cookies,
        })
    }

    pub fn method(&self) -> Method { self.method }
    /// Original URL: path plus query string.
    pub fn url(&self) -> &str { &self.url }
    pub fn path(&self) -> &str { &self.path }
    pub fn params(&self) -> &HashMap<String, String> { &self.params }
    pub fn query(&self) -> &HashMap<String, String> { &self.query }
    pub fn body(&self) -> &Body { &self.body }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }
    pub fn cookies(&self) -> &HashMap<String, String> { &self.cookies }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns a named path parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Builder for requests that did not come off the wire (tests, in-process
/// calls).
pub struct RawRequestBuilder {
    req: RawRequest,
}

impl RawRequestBuilder {
    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.req.params.insert(name.to_owned(), value.to_owned());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name == "cookie" {
            self.req.cookies.extend(parse_cookies(value));
        }
        self.req.headers.push((name, value.to_owned()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.req.body = Body::Json(body);
        self
    }

    /// Raw body bytes, parsed the same way the transport would.
    pub fn bytes(mut self, body: &[u8]) -> Self {
        self.req.body = parse_body(body);
        self
    }

    pub fn build(self) -> RawRequest {
        self.req
    }
}

fn path_of(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}

/// Later duplicates win.
fn parse_query(url: &str) -> HashMap<String, String> {
    url.split_once('?')
        .map(|(_, q)| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_cookies(header: &str) -> impl Iterator<Item = (String, String)> + '_ {
    header.split(';').filter_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        let k = k.trim();
        (!k.is_empty()).then(|| (k.to_owned(), v.trim().to_owned()))
    })
}

fn parse_body(bytes: &[u8]) -> Body {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Body::Empty;
    }
    match serde_json::from_slice(bytes) {
        Ok(v) => Body::Json(v),
        Err(e) => Body::Invalid(format!("invalid JSON body: {e}")),
    }
}
