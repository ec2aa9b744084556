//! Push parser for `multipart/related` and `multipart/mixed` bodies as a
//! CouchDB-compatible peer produces them: feed raw transport chunks in,
//! drain part events out.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

/// Headers of one part, keyed case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartHeaders(BTreeMap<String, String>);

impl PartHeaders {
    #[cfg(test)]
    pub(crate) fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The `filename` parameter of the `Content-Disposition` header.
    pub fn attachment_name(&self) -> Option<&str> {
        let disposition = self.get("content-disposition")?;
        let (_, value) = disposition.split_once("filename=")?;
        let value = value.split(';').next()?.trim();
        Some(value.trim_matches('"'))
    }
}

#[derive(Debug)]
pub enum Event {
    PartStart(PartHeaders),
    PartChunk(Bytes),
    PartEnd,
}

enum State {
    /// Before the first boundary line.
    Preamble,
    /// Right after a boundary: either `--` (epilogue) or CRLF + headers.
    BoundaryEnd,
    Headers,
    Body,
    Done,
}

pub struct MultipartParser {
    /// `--` + boundary token.
    boundary: Vec<u8>,
    /// CRLF + `--` + boundary token; terminates a part body.
    delimiter: Vec<u8>,
    cache: Vec<u8>,
    state: State,
    current_headers: BTreeMap<String, String>,
    events: VecDeque<Event>,
}

impl MultipartParser {
    /// Builds a parser from a `multipart/...; boundary=...` content type.
    pub fn new(content_type: &str) -> Result<Self> {
        let boundary = parse_boundary(content_type)?;
        let mut delimiter = b"\r\n".to_vec();
        delimiter.extend_from_slice(&boundary);

        Ok(Self {
            boundary,
            delimiter,
            cache: Vec::new(),
            state: State::Preamble,
            current_headers: BTreeMap::new(),
            events: VecDeque::new(),
        })
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<()> {
        self.cache.extend_from_slice(chunk);
        self.run()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Verifies the final boundary was seen once the input is exhausted.
    pub fn check_done(&self) -> Result<()> {
        match self.state {
            State::Done => Ok(()),
            _ => Err(Error::Multipart("incomplete multipart body")),
        }
    }

    fn run(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::Preamble => {
                    // the body opens with the first boundary, possibly
                    // preceded by a blank line
                    let Some(at) = find(&self.cache, &self.boundary) else {
                        if self.cache.len() > self.boundary.len() + 2 {
                            return Err(Error::Multipart("data before first boundary"));
                        }
                        return Ok(());
                    };
                    if !self.cache[..at].iter().all(|&b| b == b'\r' || b == b'\n') {
                        return Err(Error::Multipart("data before first boundary"));
                    }
                    self.cache.drain(..at + self.boundary.len());
                    self.state = State::BoundaryEnd;
                }
                State::BoundaryEnd => {
                    if self.cache.len() < 2 {
                        return Ok(());
                    }
                    if self.cache.starts_with(b"--") {
                        self.state = State::Done;
                    } else if self.cache.starts_with(b"\r\n") {
                        self.cache.drain(..2);
                        self.current_headers.clear();
                        self.state = State::Headers;
                    } else {
                        return Err(Error::Multipart("malformed boundary line"));
                    }
                }
                State::Headers => {
                    let Some(at) = find(&self.cache, b"\r\n") else {
                        return Ok(());
                    };
                    if at == 0 {
                        self.cache.drain(..2);
                        self.events.push_back(Event::PartStart(PartHeaders(
                            std::mem::take(&mut self.current_headers),
                        )));
                        self.state = State::Body;
                    } else {
                        let line = String::from_utf8(self.cache[..at].to_vec())
                            .map_err(|_| Error::Multipart("malformed part header"))?;
                        self.cache.drain(..at + 2);
                        let (name, value) = line
                            .split_once(':')
                            .ok_or(Error::Multipart("malformed part header"))?;
                        self.current_headers
                            .insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
                    }
                }
                State::Body => match find(&self.cache, &self.delimiter) {
                    Some(at) => {
                        if at > 0 {
                            let data = Bytes::copy_from_slice(&self.cache[..at]);
                            self.events.push_back(Event::PartChunk(data));
                        }
                        self.cache.drain(..at + self.delimiter.len());
                        self.events.push_back(Event::PartEnd);
                        self.state = State::BoundaryEnd;
                    }
                    None => {
                        // flush what cannot contain the delimiter yet
                        let keep = self.delimiter.len().saturating_sub(1);
                        if self.cache.len() > keep {
                            let flush = self.cache.len() - keep;
                            let data = Bytes::copy_from_slice(&self.cache[..flush]);
                            self.cache.drain(..flush);
                            self.events.push_back(Event::PartChunk(data));
                        }
                        return Ok(());
                    }
                },
                State::Done => {
                    // ignore the epilogue
                    self.cache.clear();
                    return Ok(());
                }
            }
        }
    }
}

fn parse_boundary(content_type: &str) -> Result<Vec<u8>> {
    if !content_type.trim_start().starts_with("multipart/") {
        return Err(Error::Multipart("not a multipart content type"));
    }
    let (_, value) = content_type
        .split_once("boundary=")
        .ok_or(Error::Multipart("missing multipart boundary"))?;
    let token = value.split(';').next().unwrap_or("").trim().trim_matches('"');
    if token.is_empty() {
        return Err(Error::Multipart("missing multipart boundary"));
    }

    let mut boundary = b"--".to_vec();
    boundary.extend_from_slice(token.as_bytes());
    Ok(boundary)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(content_type: &str, body: &[u8], chunk_size: usize) -> Vec<Event> {
        let mut parser = MultipartParser::new(content_type).unwrap();
        let mut events = Vec::new();

        for chunk in body.chunks(chunk_size) {
            parser.feed(chunk).unwrap();
            while let Some(event) = parser.next_event() {
                events.push(event);
            }
        }
        parser.check_done().unwrap();
        events
    }

    /// Parts as `(headers, body)` pairs, concatenating chunks.
    fn parts(events: Vec<Event>) -> Vec<(PartHeaders, Vec<u8>)> {
        let mut out: Vec<(PartHeaders, Vec<u8>)> = Vec::new();
        for event in events {
            match event {
                Event::PartStart(headers) => out.push((headers, Vec::new())),
                Event::PartChunk(chunk) => {
                    out.last_mut().unwrap().1.extend_from_slice(&chunk)
                }
                Event::PartEnd => (),
            }
        }
        out
    }

    const BODY: &[u8] = b"--abc\r\n\
        Content-Type: application/json\r\n\
        \r\n\
        {\"_id\":\"doc\"}\r\n\
        --abc\r\n\
        Content-Disposition: attachment; filename=\"text.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Hello World!\r\n\
        --abc--epilogue";

    #[test]
    fn parses_couchdb_style_bodies() {
        let events = parse_all("multipart/related; boundary=\"abc\"", BODY, BODY.len());
        let parts = parts(events);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.get("content-type"), Some("application/json"));
        assert_eq!(parts[0].1, b"{\"_id\":\"doc\"}");
        assert_eq!(parts[1].0.attachment_name(), Some("text.txt"));
        // the closing CRLF belongs to the delimiter, not the body
        assert_eq!(parts[1].1, b"Hello World!");
    }

    #[test]
    fn any_chunking_yields_the_same_parts() {
        for chunk_size in [1, 2, 3, 7, 16, 64] {
            let events = parse_all("multipart/related; boundary=abc", BODY, chunk_size);
            let parts = parts(events);
            assert_eq!(parts.len(), 2, "chunk size {chunk_size}");
            assert_eq!(parts[1].1, b"Hello World!", "chunk size {chunk_size}");
        }
    }

    #[test]
    fn part_bodies_may_contain_boundary_lookalikes() {
        let body = b"--abc\r\n\
            Content-Type: application/octet-stream\r\n\
            \r\n\
            --ab--abc-almost\r\n--\r\n\
            --abc--";
        let events = parse_all("multipart/mixed; boundary=abc", body, 5);
        let parts = parts(events);

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].1, b"--ab--abc-almost\r\n--");
    }

    #[test]
    fn truncated_input_is_detected() {
        let mut parser = MultipartParser::new("multipart/related; boundary=abc").unwrap();
        parser.feed(b"--abc\r\nContent-Type: text/plain\r\n\r\nhalf").unwrap();
        assert!(parser.check_done().is_err());
    }

    #[test]
    fn rejects_non_multipart_content_types() {
        assert!(MultipartParser::new("application/json").is_err());
        assert!(MultipartParser::new("multipart/related").is_err());
    }

    #[test]
    fn boundary_without_quotes_is_accepted() {
        let parser = MultipartParser::new(
            "multipart/mixed; boundary=59a73e5a10d08ea8d6f1c0558100b7fb",
        );
        assert!(parser.is_ok());
    }
}
