//! A CouchDB-compatible peer reached over HTTP, speaking the same interface
//! as a local database. Requests and responses are streamed; whole
//! collections are never buffered.

mod json_stream;
mod multipart;

pub use self::multipart::PartHeaders;

use self::{
    json_stream::JsonItems,
    multipart::{Event, MultipartParser},
};
use crate::{
    db::{Database, ReadRequest},
    error::{Error, Result},
    protocol::{
        doc_to_json, json_to_doc, Attachment, ByteStream, Change, DocResult, Document,
        FollowsAttachment, Missing, Rev, Revs, StoredAttachment,
    },
};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::{
    header::{CONTENT_TYPE, RANGE},
    Body, Client, Method, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use std::{io::Read, sync::Arc};
use tokio::sync::Semaphore;
use url::Url;

/// Upper bound on parallel in-flight document reads, to keep connection
/// pressure on the peer bounded.
const MAX_PARALLEL_READS: usize = 10;

/// A remote database behind a CouchDB-compatible HTTP API.
#[derive(Clone)]
pub struct HttpDatabase {
    client: Client,
    base_url: Url,
    credentials: Option<(String, String)>,
    read_permits: Arc<Semaphore>,
}

impl HttpDatabase {
    /// `url` addresses the database itself, e.g.
    /// `http://localhost:5984/mydb`.
    pub fn new(url: Url) -> Result<Self> {
        Self::with_credentials(url, None)
    }

    pub fn with_credentials(mut url: Url, credentials: Option<(String, String)>) -> Result<Self> {
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }

        Ok(Self {
            client: Client::builder().build()?,
            base_url: url,
            credentials,
            read_permits: Arc::new(Semaphore::new(MAX_PARALLEL_READS)),
        })
    }

    /// Deletes the remote database. Not used during replication, but handy
    /// for tests and tools.
    pub async fn destroy(&self) -> Result<()> {
        let resp = self
            .send(self.request(Method::DELETE, self.base_url.clone()))
            .await?;
        expect_success(&resp)?;
        Ok(())
    }

    /// Reads a single attachment, optionally a byte range `[start, end)` of
    /// it. Returns the content type and the byte stream.
    pub async fn read_attachment(
        &self,
        id: &str,
        name: &str,
        range: Option<(u64, u64)>,
    ) -> Result<(String, ByteStream)> {
        let url = self.db_url(&[id, name])?;
        let mut builder = self.request(Method::GET, url);
        if let Some((start, end)) = range {
            // HTTP ranges are inclusive on both ends
            builder = builder.header(RANGE, format!("bytes={}-{}", start, end.saturating_sub(1)));
        }

        let resp = self.send(builder).await?;
        match resp.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => (),
            StatusCode::NOT_FOUND => return Err(Error::NotFound(format!("{id}/{name}"))),
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(Error::PreconditionFailed("unsatisfiable byte range"))
            }
            status => return Err(Error::UnexpectedStatus(status.as_u16())),
        }

        let content_type = content_type_of(&resp);
        let stream = resp.bytes_stream().map_err(Error::from);
        Ok((content_type, Box::pin(stream)))
    }

    fn db_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::MalformedData)?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.credentials {
            Some((name, password)) => builder.basic_auth(name, Some(password)),
            None => builder,
        }
    }

    /// Sends the request, translating the credential-related status codes
    /// of the error taxonomy. Other statuses are the caller's business.
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let resp = builder.send().await?;
        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(Error::Unauthorized(read_error_body(resp).await)),
            StatusCode::FORBIDDEN => Err(Error::Forbidden(read_error_body(resp).await)),
            _ => Ok(resp),
        }
    }
}

async fn read_error_body(resp: Response) -> String {
    resp.text().await.unwrap_or_default()
}

fn expect_success(resp: &Response) -> Result<()> {
    match resp.status() {
        status if status.is_success() => Ok(()),
        StatusCode::PRECONDITION_FAILED => {
            Err(Error::PreconditionFailed("rejected by the remote peer"))
        }
        status => Err(Error::UnexpectedStatus(status.as_u16())),
    }
}

fn content_type_of(resp: &Response) -> String {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/json")
        .to_owned()
}

fn parse_seq(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        // newer CouchDB versions render seqs as "123-<opaque>"
        value.as_str()?.split('-').next()?.parse().ok()
    })
}

#[derive(Deserialize)]
struct ChangeRow {
    seq: Value,
    id: String,
    #[serde(default)]
    deleted: bool,
    changes: Vec<ChangeRowRev>,
}

#[derive(Deserialize)]
struct ChangeRowRev {
    rev: Rev,
}

impl ChangeRow {
    fn into_change(self) -> Result<Change> {
        let seq = parse_seq(&self.seq).ok_or(Error::MalformedData)?;
        Ok(Change {
            id: self.id,
            seq,
            deleted: self.deleted,
            leaf_revs: self.changes.into_iter().map(|c| c.rev).collect(),
        })
    }
}

#[derive(Deserialize, Default)]
struct DiffEntry {
    #[serde(default)]
    missing: Vec<Rev>,
    #[serde(default)]
    possible_ancestors: Vec<Rev>,
}

#[async_trait]
impl Database for HttpDatabase {
    async fn id(&self) -> Result<String> {
        // the server-wide uuid plus the database url identify the peer
        let mut root = self.base_url.clone();
        root.set_path("/");
        root.set_query(None);

        let resp = self.send(self.request(Method::GET, root)).await?;
        expect_success(&resp)?;
        let info: Value = resp.json().await?;
        let uuid = info["uuid"].as_str().unwrap_or_default();

        Ok(format!("{}{}remote", uuid, self.base_url))
    }

    async fn create(&self) -> Result<bool> {
        let resp = self
            .send(self.request(Method::PUT, self.base_url.clone()))
            .await?;
        match resp.status() {
            StatusCode::PRECONDITION_FAILED => Ok(false), // already exists
            status if status.is_success() => Ok(true),
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn update_seq(&self) -> Result<u64> {
        let resp = self
            .send(self.request(Method::GET, self.base_url.clone()))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(self.base_url.to_string()));
        }
        expect_success(&resp)?;

        let info: Value = resp.json().await?;
        parse_seq(&info["update_seq"]).ok_or(Error::MalformedData)
    }

    fn changes(&self, since: Option<u64>, continuous: bool) -> BoxStream<'static, Result<Change>> {
        let this = self.clone();

        Box::pin(try_stream! {
            let mut url = this.db_url(&["_changes"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("style", "all_docs");
                if let Some(since) = since {
                    query.append_pair("since", &since.to_string());
                }
                if continuous {
                    query.append_pair("feed", "continuous");
                }
            }

            let resp = this.send(this.request(Method::GET, url)).await?;
            expect_success(&resp)?;
            let mut body = resp.bytes_stream();

            if continuous {
                // one JSON row per line, no envelope
                let mut buffer = Vec::new();
                loop {
                    let chunk = match body.try_next().await? {
                        Some(chunk) => chunk,
                        None => break,
                    };
                    buffer.extend_from_slice(&chunk);

                    while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..newline + 1).collect();
                        if let Some(change) = parse_continuous_line(&line)? {
                            yield change;
                        }
                    }
                }
            } else {
                let mut scanner = JsonItems::items_at(2);
                while let Some(chunk) = body.try_next().await? {
                    scanner.feed(&chunk);
                    if scanner.is_malformed() {
                        Err(Error::MalformedData)?;
                    }
                    while let Some((_, raw)) = scanner.next_item() {
                        let row: ChangeRow = serde_json::from_slice(&raw)?;
                        yield row.into_change()?;
                    }
                }
            }
        })
    }

    fn revs_diff(
        &self,
        mut input: BoxStream<'static, (String, Vec<Rev>)>,
    ) -> BoxStream<'static, Result<Missing>> {
        let this = self.clone();

        Box::pin(try_stream! {
            let body = async_stream::stream! {
                yield Ok::<_, Error>(Bytes::from_static(b"{"));
                let mut first = true;
                while let Some((id, revs)) = input.next().await {
                    let mut piece = if first { String::new() } else { ",".to_owned() };
                    first = false;
                    match encode_diff_entry(&id, &revs) {
                        Ok(entry) => piece.push_str(&entry),
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                    yield Ok(Bytes::from(piece));
                }
                yield Ok(Bytes::from_static(b"}\n"));
            };

            let url = this.db_url(&["_revs_diff"])?;
            let resp = this
                .send(
                    this.request(Method::POST, url)
                        .header(CONTENT_TYPE, "application/json")
                        .body(Body::wrap_stream(body)),
                )
                .await?;
            expect_success(&resp)?;

            let mut scanner = JsonItems::object_entries();
            let mut body = resp.bytes_stream();
            while let Some(chunk) = body.try_next().await? {
                scanner.feed(&chunk);
                if scanner.is_malformed() {
                    Err(Error::MalformedData)?;
                }
                while let Some((key, raw)) = scanner.next_item() {
                    let id = key.ok_or(Error::MalformedData)?;
                    let entry: DiffEntry = serde_json::from_slice(&raw)?;
                    yield Missing {
                        id,
                        missing_revs: entry.missing.into_iter().collect(),
                        possible_ancestors: entry.possible_ancestors.into_iter().collect(),
                    };
                }
            }
        })
    }

    fn read(&self, request: ReadRequest) -> BoxStream<'static, Result<DocResult>> {
        let this = self.clone();

        Box::pin(try_stream! {
            let _permit = this
                .read_permits
                .clone()
                .acquire_owned()
                .await
                .expect("read semaphore never closes");

            let mut url = this.db_url(&[request.id.as_str()])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("latest", "true");
                query.append_pair("revs", "true");
                match &request.revs {
                    Revs::Winner => (),
                    Revs::All => {
                        query.append_pair("open_revs", "all");
                    }
                    Revs::These(revs) => {
                        query.append_pair("open_revs", &revs_json(revs));
                    }
                }
                if let Some(atts_since) = &request.atts_since {
                    if !atts_since.is_empty() {
                        query.append_pair("atts_since", &revs_json(atts_since));
                    }
                }
            }

            let resp = this.send(this.request(Method::GET, url)).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                yield DocResult::NotFound(request.id);
                return;
            }
            expect_success(&resp)?;

            let content_type = content_type_of(&resp);

            if content_type.starts_with("multipart/mixed") {
                // one part per requested revision, each either a plain JSON
                // document or a nested multipart/related bundle
                let mut outer = MultipartParser::new(&content_type)?;
                let mut body = resp.bytes_stream();
                let mut current: Option<MixedPart> = None;

                loop {
                    while let Some(event) = outer.next_event() {
                        match event {
                            Event::PartStart(headers) => {
                                let part_type =
                                    headers.get("content-type").unwrap_or("application/json");
                                current = Some(if part_type.starts_with("multipart/") {
                                    MixedPart::Related(
                                        MultipartParser::new(part_type)?,
                                        DocAssembler::new(),
                                    )
                                } else {
                                    MixedPart::Json(Vec::new())
                                });
                            }
                            Event::PartChunk(chunk) => match &mut current {
                                Some(MixedPart::Json(buf)) => buf.extend_from_slice(&chunk),
                                Some(MixedPart::Related(inner, assembler)) => {
                                    inner.feed(&chunk)?;
                                    while let Some(inner_event) = inner.next_event() {
                                        assembler.on_event(inner_event)?;
                                    }
                                }
                                None => Err(Error::Multipart("chunk outside of a part"))?,
                            },
                            Event::PartEnd => match current.take() {
                                Some(MixedPart::Json(buf)) => {
                                    if let Some(doc) = parse_doc_part(&buf)? {
                                        yield DocResult::Found(doc);
                                    }
                                }
                                Some(MixedPart::Related(inner, assembler)) => {
                                    inner.check_done()?;
                                    yield DocResult::Found(assembler.finish()?);
                                }
                                None => Err(Error::Multipart("end outside of a part"))?,
                            },
                        }
                    }

                    match body.try_next().await? {
                        Some(chunk) => outer.feed(&chunk)?,
                        None => {
                            outer.check_done()?;
                            break;
                        }
                    }
                }
            } else if content_type.starts_with("multipart/related") {
                // a single document with its attachments following
                let mut parser = MultipartParser::new(&content_type)?;
                let mut assembler = DocAssembler::new();
                let mut body = resp.bytes_stream();

                loop {
                    while let Some(event) = parser.next_event() {
                        assembler.on_event(event)?;
                    }
                    match body.try_next().await? {
                        Some(chunk) => parser.feed(&chunk)?,
                        None => {
                            parser.check_done()?;
                            break;
                        }
                    }
                }

                yield DocResult::Found(assembler.finish()?);
            } else {
                let bytes = resp.bytes().await?;
                let value: Value = serde_json::from_slice(&bytes)?;
                let (doc, follows) = json_to_doc(value)?;
                if !follows.is_empty() {
                    Err(Error::Multipart("attachment bytes missing"))?;
                }
                yield DocResult::Found(doc);
            }
        })
    }

    async fn write(&self, doc: Document) -> Result<()> {
        let id = doc.id.clone();
        let value = doc_to_json(doc).await?;

        let mut url = self.db_url(&[id.as_str()])?;
        url.query_pairs_mut().append_pair("new_edits", "false");

        let resp = self.send(self.request(Method::PUT, url).json(&value)).await?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(id)),
            StatusCode::CONFLICT => Err(Error::Conflict),
            StatusCode::PRECONDITION_FAILED => {
                Err(Error::PreconditionFailed("rejected by the remote peer"))
            }
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }

    async fn read_local(&self, id: &str) -> Result<Option<Value>> {
        let url = self.db_url(&["_local", id])?;
        let resp = self.send(self.request(Method::GET, url)).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        expect_success(&resp)?;

        let mut value: Value = resp.json().await?;
        if let Some(map) = value.as_object_mut() {
            map.remove("_id");
            map.remove("_rev");
        }
        Ok(Some(value))
    }

    async fn write_local(&self, id: &str, value: Option<Value>) -> Result<()> {
        let url = self.db_url(&["_local", id])?;
        match value {
            Some(value) => {
                let resp = self
                    .send(self.request(Method::PUT, url).json(&value))
                    .await?;
                expect_success(&resp)
            }
            None => {
                let resp = self.send(self.request(Method::DELETE, url)).await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Ok(());
                }
                expect_success(&resp)
            }
        }
    }

    async fn ensure_full_commit(&self) -> Result<()> {
        let url = self.db_url(&["_ensure_full_commit"])?;
        let resp = self
            .send(
                self.request(Method::POST, url)
                    .header(CONTENT_TYPE, "application/json"),
            )
            .await?;
        expect_success(&resp)
    }
}

enum MixedPart {
    Json(Vec<u8>),
    Related(MultipartParser, DocAssembler),
}

fn revs_json(revs: &[Rev]) -> String {
    serde_json::to_string(revs).expect("revisions serialize infallibly")
}

fn encode_diff_entry(id: &str, revs: &[Rev]) -> Result<String> {
    Ok(format!(
        "{}:{}",
        serde_json::to_string(id)?,
        serde_json::to_string(revs)?
    ))
}

fn parse_continuous_line(line: &[u8]) -> Result<Option<Change>> {
    let trimmed = line
        .iter()
        .position(|&b| !b.is_ascii_whitespace())
        .map(|start| &line[start..])
        .unwrap_or(b"");
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(trimmed)?;
    if value.get("id").is_none() {
        // heartbeat or last_seq line
        return Ok(None);
    }

    let row: ChangeRow = serde_json::from_value(value)?;
    Ok(Some(row.into_change()?))
}

/// Parses one JSON document part; `None` for `{"missing": ..}` markers.
fn parse_doc_part(buf: &[u8]) -> Result<Option<Document>> {
    let value: Value = serde_json::from_slice(buf)?;
    if value.get("_id").is_none() && value.get("missing").is_some() {
        return Ok(None);
    }

    let (doc, follows) = json_to_doc(value)?;
    if !follows.is_empty() {
        return Err(Error::Multipart("attachment bytes missing"));
    }
    Ok(Some(doc))
}

/// Assembles one document out of the parts of a `multipart/related` body:
/// the leading JSON part followed by one part per `follows` attachment,
/// matched up by their `Content-Disposition` filename.
struct DocAssembler {
    json_buf: Vec<u8>,
    in_json_part: bool,
    doc: Option<Document>,
    follows: Vec<FollowsAttachment>,
    current: Option<AttachmentPart>,
}

struct AttachmentPart {
    name: String,
    gzip: bool,
    chunks: Vec<Bytes>,
}

impl DocAssembler {
    fn new() -> Self {
        Self {
            json_buf: Vec::new(),
            in_json_part: false,
            doc: None,
            follows: Vec::new(),
            current: None,
        }
    }

    fn on_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::PartStart(headers) => {
                if self.doc.is_none() {
                    self.in_json_part = true;
                } else {
                    let name = headers
                        .attachment_name()
                        .ok_or(Error::Multipart("attachment part without filename"))?
                        .to_owned();
                    let gzip = headers
                        .get("content-encoding")
                        .is_some_and(|encoding| encoding.eq_ignore_ascii_case("gzip"));
                    self.current = Some(AttachmentPart {
                        name,
                        gzip,
                        chunks: Vec::new(),
                    });
                }
            }
            Event::PartChunk(chunk) => {
                if self.in_json_part {
                    self.json_buf.extend_from_slice(&chunk);
                } else if let Some(part) = &mut self.current {
                    part.chunks.push(chunk);
                }
            }
            Event::PartEnd => {
                if self.in_json_part {
                    self.in_json_part = false;
                    let value: Value = serde_json::from_slice(&self.json_buf)?;
                    let (doc, follows) = json_to_doc(value)?;
                    self.doc = Some(doc);
                    self.follows = follows;
                } else if let Some(part) = self.current.take() {
                    self.finish_attachment(part)?;
                }
            }
        }
        Ok(())
    }

    fn finish_attachment(&mut self, part: AttachmentPart) -> Result<()> {
        let mut data = Vec::new();
        for chunk in &part.chunks {
            data.extend_from_slice(chunk);
        }
        if part.gzip {
            let mut decoded = Vec::new();
            flate2::read::GzDecoder::new(&data[..]).read_to_end(&mut decoded)?;
            data = decoded;
        }

        let position = self
            .follows
            .iter()
            .position(|entry| entry.name == part.name)
            .ok_or(Error::Multipart("unexpected attachment part"))?;
        let entry = self.follows.remove(position);

        let doc = self
            .doc
            .as_mut()
            .ok_or(Error::Multipart("attachment before document part"))?;
        doc.attachments
            .get_or_insert_with(Default::default)
            .insert(
                entry.name,
                Attachment::Stored(StoredAttachment {
                    meta: entry.meta,
                    data: crate::protocol::byte_stream(data),
                }),
            );
        Ok(())
    }

    fn finish(self) -> Result<Document> {
        if !self.follows.is_empty() {
            return Err(Error::Multipart("missing attachment part"));
        }
        self.doc.ok_or(Error::Multipart("missing document part"))
    }
}
