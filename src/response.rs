/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::io::{self, Write};

/// Destination for a parsed response head and body.
pub trait HttpResponseWriter {
    fn set_status_code(&mut self, code: u16);

    fn set_mime_type(&mut self, mime_type: &str);

    fn add_header(&mut self, name: &str, value: &str);

    fn write_body(&mut self, data: &[u8]) -> Result<(), io::Error>;

    // the body length is not known in advance
    fn set_persistent(&mut self, _persistent: bool) {}

    // the body is a complete raw HTTP response
    fn set_raw(&mut self, _raw: bool) {}
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

// for text placed into generated pages
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }

    out
}

/// Collects everything written to it, for rendering later.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: Option<u16>,
    pub mime_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub raw: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            code: None,
            mime_type: None,
            headers: Vec::new(),
            body: Vec::new(),
            persistent: true,
            raw: false,
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the response with a redirect to `location`.
    pub fn redirect(&mut self, code: u16, location: &str) {
        self.code = Some(code);
        self.mime_type = Some("text/html".to_string());
        self.headers.clear();
        self.headers
            .push(("Location".to_string(), location.to_string()));
        self.body = format!(
            "<html><head><title>{} {}</title></head><body>\r\n\
             <p>The document has moved <a href=\"{}\">here</a>.</p>\r\n\
             </body></html>\r\n",
            code,
            reason_phrase(code),
            escape_html(location)
        )
        .into_bytes();
        self.raw = false;
    }

    /// Replaces the response with a short error page.
    pub fn error(&mut self, code: u16, msg: &str) {
        self.code = Some(code);
        self.mime_type = Some("text/html".to_string());
        self.headers.clear();
        self.body = format!(
            "<html><head><title>{} {}</title></head><body>\r\n<p>{}</p>\r\n</body></html>\r\n",
            code,
            reason_phrase(code),
            escape_html(msg)
        )
        .into_bytes();
        self.raw = false;
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), io::Error> {
        if self.raw {
            return w.write_all(&self.body);
        }

        let code = self.code.unwrap_or(200);

        write!(w, "HTTP/1.1 {} {}\r\n", code, reason_phrase(code))?;

        if let Some(mime_type) = &self.mime_type {
            write!(w, "Content-Type: {}\r\n", mime_type)?;
        }

        for (name, value) in self.headers.iter() {
            write!(w, "{}: {}\r\n", name, value)?;
        }

        if self.persistent {
            write!(w, "Content-Length: {}\r\n", self.body.len())?;
        } else {
            write!(w, "Connection: close\r\n")?;
        }

        write!(w, "\r\n")?;

        w.write_all(&self.body)
    }
}

impl HttpResponseWriter for Response {
    fn set_status_code(&mut self, code: u16) {
        self.code = Some(code);
    }

    fn set_mime_type(&mut self, mime_type: &str) {
        self.mime_type = Some(mime_type.to_string());
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn write_body(&mut self, data: &[u8]) -> Result<(), io::Error> {
        self.body.extend_from_slice(data);

        Ok(())
    }

    fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    fn set_raw(&mut self, raw: bool) {
        self.raw = raw;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render() {
        let mut resp = Response::new();
        resp.set_mime_type("text/plain");
        resp.add_header("X-Foo", "bar");
        resp.write_body(b"hello").unwrap();

        let mut out = Vec::new();
        resp.write_to(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain\r\n\
             X-Foo: bar\r\n\
             Content-Length: 5\r\n\
             \r\n\
             hello"
        );
        assert_eq!(resp.header("x-foo"), Some("bar"));
    }

    #[test]
    fn render_not_persistent() {
        let mut resp = Response::new();
        resp.set_status_code(404);
        resp.set_persistent(false);

        let mut out = Vec::new();
        resp.write_to(&mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn render_raw() {
        let mut resp = Response::new();
        resp.set_raw(true);
        resp.write_body(b"HTTP/1.0 200 OK\r\n\r\nhi").unwrap();

        let mut out = Vec::new();
        resp.write_to(&mut out).unwrap();

        assert_eq!(out, b"HTTP/1.0 200 OK\r\n\r\nhi");
    }

    #[test]
    fn redirect() {
        let mut resp = Response::new();
        resp.add_header("X-Foo", "bar");
        resp.redirect(302, "http://example.com/");

        assert_eq!(resp.code, Some(302));
        assert_eq!(resp.header("Location"), Some("http://example.com/"));
        assert_eq!(resp.header("X-Foo"), None);
    }

    #[test]
    fn generated_pages_escape_text() {
        let location = "http://example.com/?a=1&b=\"><script>x</script>";

        let mut resp = Response::new();
        resp.redirect(302, location);

        // the header carries the location as given
        assert_eq!(resp.header("Location"), Some(location));

        let body = String::from_utf8(resp.body.clone()).unwrap();
        assert!(body.contains(
            "href=\"http://example.com/?a=1&amp;b=&quot;&gt;&lt;script&gt;x&lt;/script&gt;\""
        ));
        assert!(!body.contains("<script>"));

        resp.error(500, "bad <input> & 'quotes'");

        let body = String::from_utf8(resp.body.clone()).unwrap();
        assert!(body.contains("<p>bad &lt;input&gt; &amp; &#39;quotes&#39;</p>"));
    }
}
