//! Documents and the feed/diff record types, plus conversion to and from the
//! CouchDB JSON encoding.

use super::{
    attachment::{byte_stream, Attachment, AttachmentMetadata, Digester, StoredAttachment},
    rev::Rev,
};
use crate::error::{Error, Result};
use futures_util::TryStreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// One version of one document, possibly with (a selection of) its
/// attachments.
///
/// `path` lists revision hashes newest first, `path[0]` being the hash of
/// this very revision. A tombstone has no body and no attachments.
#[derive(Debug)]
pub struct Document {
    pub id: String,
    pub rev_num: u64,
    pub path: Vec<String>,
    pub body: Option<Map<String, Value>>,
    pub attachments: Option<BTreeMap<String, Attachment>>,
    pub deleted: bool,
}

impl Document {
    pub fn new(id: impl Into<String>, rev_num: u64, path: Vec<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev_num,
            path,
            body: Some(body),
            attachments: Some(BTreeMap::new()),
            deleted: false,
        }
    }

    pub fn tombstone(id: impl Into<String>, rev_num: u64, path: Vec<String>) -> Self {
        Self {
            id: id.into(),
            rev_num,
            path,
            body: None,
            attachments: None,
            deleted: true,
        }
    }

    /// The revision this document represents.
    pub fn rev(&self) -> Rev {
        Rev::new(self.rev_num, self.path[0].clone())
    }

    /// Attaches `data` under `name`, to be stored by the next write. The
    /// recorded `rev_pos` is the document's current revision number.
    pub fn add_attachment(
        &mut self,
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<bytes::Bytes>,
    ) {
        let attachment = Attachment::New(super::attachment::NewAttachment {
            rev_pos: self.rev_num,
            content_type: content_type.into(),
            data: byte_stream(data.into()),
        });
        self.attachments
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), attachment);
    }

    /// Derives the next revision for a new edit: hashes the current state
    /// and pushes the digest as the new head of `path`, incrementing
    /// `rev_num`. The hash input covers id, revision history, deletion flag,
    /// body and attachment metadata, so replicas deriving a revision from
    /// the same state agree on it.
    pub fn update_rev(&mut self) {
        let mut context = md5::Context::new();

        context.consume(
            serde_json::to_string(&self.id)
                .expect("string serialization is infallible")
                .as_bytes(),
        );
        context.consume(self.rev_num.to_be_bytes());
        for hash in &self.path {
            context.consume(hash.as_bytes());
        }
        context.consume(if self.deleted { b"true" as &[u8] } else { b"false" });
        context.consume(
            serde_json::to_string(&self.body)
                .expect("json body serialization is infallible")
                .as_bytes(),
        );
        for (name, attachment) in self.attachments.iter().flatten() {
            context.consume(name.as_bytes());
            if let Some(meta) = attachment.meta() {
                context.consume(meta.rev_pos.to_be_bytes());
                context.consume(meta.content_type.as_bytes());
                context.consume(meta.length.to_be_bytes());
                context.consume(meta.digest.as_bytes());
            } else if let Attachment::New(new) = attachment {
                context.consume(new.rev_pos.to_be_bytes());
                context.consume(new.content_type.as_bytes());
            }
        }

        self.rev_num += 1;
        self.path.insert(0, hex::encode(context.compute().0));
    }
}

/// A row of the changes feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub id: String,
    pub seq: u64,
    pub deleted: bool,
    /// Leaf revisions of every branch, winner candidates first.
    pub leaf_revs: Vec<Rev>,
}

/// Result of a revs diff: the subset of asked-about revisions a database
/// does not have, plus leaf revisions it could extend to obtain them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Missing {
    pub id: String,
    pub missing_revs: std::collections::BTreeSet<Rev>,
    pub possible_ancestors: std::collections::BTreeSet<Rev>,
}

/// Which revisions of a document a read selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revs {
    /// The single winning branch.
    Winner,
    /// Every leaf.
    All,
    /// Explicit revisions, each resolved to the branches containing it.
    These(Vec<Rev>),
}

/// Element of a bulk read: either a document or a marker that the requested
/// id does not exist.
#[derive(Debug)]
pub enum DocResult {
    Found(Document),
    NotFound(String),
}

impl DocResult {
    pub fn into_document(self) -> Option<Document> {
        match self {
            Self::Found(doc) => Some(doc),
            Self::NotFound(_) => None,
        }
    }
}

/// An attachment announced with `"follows": true` whose bytes arrive in a
/// later multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowsAttachment {
    pub name: String,
    pub meta: AttachmentMetadata,
}

#[derive(Deserialize)]
struct RevisionsField {
    start: u64,
    ids: Vec<String>,
}

#[derive(Deserialize)]
struct AttachmentField {
    content_type: String,
    #[serde(default)]
    revpos: u64,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    stub: bool,
    #[serde(default)]
    follows: bool,
    #[serde(default)]
    data: Option<String>,
}

/// Decodes a document from its CouchDB JSON form. Attachments declared with
/// `"follows": true` are returned separately; their bytes travel in
/// multipart parts the caller still has to supply.
pub fn json_to_doc(value: Value) -> Result<(Document, Vec<FollowsAttachment>)> {
    let Value::Object(mut map) = value else {
        return Err(Error::MalformedData);
    };

    let id = match map.remove("_id") {
        Some(Value::String(id)) => id,
        _ => return Err(Error::MalformedData),
    };
    let rev = map.remove("_rev");
    let deleted = matches!(map.remove("_deleted"), Some(Value::Bool(true)));

    let (rev_num, path) = match map.remove("_revisions") {
        Some(revisions) => {
            let revisions: RevisionsField = serde_json::from_value(revisions)?;
            if revisions.start == 0
                || revisions.ids.is_empty()
                || revisions.ids.len() as u64 > revisions.start
            {
                return Err(Error::MalformedData);
            }
            (revisions.start, revisions.ids)
        }
        // without full history, the single revision is its own path
        None => {
            let rev: Rev = match rev {
                Some(Value::String(rev)) => rev.parse()?,
                _ => return Err(Error::MalformedData),
            };
            (rev.num, vec![rev.hash])
        }
    };

    let mut attachments = BTreeMap::new();
    let mut follows = Vec::new();
    if let Some(raw) = map.remove("_attachments") {
        let raw: BTreeMap<String, AttachmentField> = serde_json::from_value(raw)?;
        for (name, field) in raw {
            let meta = AttachmentMetadata {
                rev_pos: field.revpos,
                content_type: field.content_type,
                length: field.length,
                digest: field.digest,
            };
            if field.stub {
                attachments.insert(name, Attachment::Stub(meta));
            } else if field.follows {
                follows.push(FollowsAttachment { name, meta });
            } else if let Some(data) = field.data {
                let bytes =
                    base64::decode(data.as_bytes()).map_err(|_| Error::MalformedData)?;
                let mut digester = Digester::new();
                digester.update(&bytes);
                let (length, digest) = digester.finish();
                attachments.insert(
                    name,
                    Attachment::Stored(StoredAttachment {
                        meta: AttachmentMetadata {
                            length,
                            digest,
                            ..meta
                        },
                        data: byte_stream(bytes),
                    }),
                );
            } else {
                return Err(Error::MalformedData);
            }
        }
    }

    let doc = if deleted {
        Document::tombstone(id, rev_num, path)
    } else {
        Document {
            id,
            rev_num,
            path,
            body: Some(map),
            attachments: Some(attachments),
            deleted: false,
        }
    };

    Ok((doc, follows))
}

/// Encodes a document into its CouchDB JSON form, inlining non-stub
/// attachment bodies as base64 (which consumes their streams).
pub async fn doc_to_json(doc: Document) -> Result<Value> {
    let mut map = Map::new();
    map.insert("_id".into(), Value::String(doc.id));
    map.insert("_rev".into(), json!(Rev::new(doc.rev_num, doc.path[0].clone())));
    map.insert(
        "_revisions".into(),
        json!({ "start": doc.rev_num, "ids": doc.path }),
    );

    if doc.deleted {
        map.insert("_deleted".into(), Value::Bool(true));
    } else if let Some(body) = doc.body {
        map.extend(body);
    }

    if let Some(attachments) = doc.attachments {
        if !attachments.is_empty() {
            let mut encoded = Map::new();
            for (name, attachment) in attachments {
                encoded.insert(name, attachment_to_json(attachment).await?);
            }
            map.insert("_attachments".into(), Value::Object(encoded));
        }
    }

    Ok(Value::Object(map))
}

async fn attachment_to_json(attachment: Attachment) -> Result<Value> {
    match attachment {
        Attachment::Stub(meta) => Ok(json!({
            "content_type": meta.content_type,
            "revpos": meta.rev_pos,
            "length": meta.length,
            "digest": meta.digest,
            "stub": true,
        })),
        Attachment::Stored(stored) => {
            let data = collect_stream(stored.data).await?;
            Ok(json!({
                "content_type": stored.meta.content_type,
                "revpos": stored.meta.rev_pos,
                "length": stored.meta.length,
                "digest": stored.meta.digest,
                "data": base64::encode(&data),
            }))
        }
        Attachment::New(new) => {
            let data = collect_stream(new.data).await?;
            let mut digester = Digester::new();
            digester.update(&data);
            let (length, digest) = digester.finish();
            Ok(json!({
                "content_type": new.content_type,
                "revpos": new.rev_pos,
                "length": length,
                "digest": digest,
                "data": base64::encode(&data),
            }))
        }
    }
}

/// Drains a byte stream into one contiguous buffer.
pub async fn collect_stream(
    mut stream: super::attachment::ByteStream,
) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.try_next().await? {
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_round_trip_preserves_documents() {
        let input = json!({
            "_id": "mydoc",
            "_rev": "2-b",
            "_revisions": {"start": 2, "ids": ["b", "a"]},
            "x": 1,
            "nested": {"y": [1, 2, 3]},
        });

        let (doc, follows) = json_to_doc(input.clone()).unwrap();
        assert!(follows.is_empty());
        assert_eq!(doc.id, "mydoc");
        assert_eq!(doc.rev(), Rev::new(2, "b"));
        assert!(!doc.deleted);

        let output = doc_to_json(doc).await.unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn json_round_trip_preserves_tombstones() {
        let input = json!({
            "_id": "gone",
            "_rev": "3-c",
            "_revisions": {"start": 3, "ids": ["c", "b", "a"]},
            "_deleted": true,
        });

        let (doc, _) = json_to_doc(input.clone()).unwrap();
        assert!(doc.deleted);
        assert!(doc.body.is_none());

        let output = doc_to_json(doc).await.unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn json_round_trip_preserves_stub_attachments() {
        let input = json!({
            "_id": "withatt",
            "_rev": "1-a",
            "_revisions": {"start": 1, "ids": ["a"]},
            "_attachments": {
                "text.txt": {
                    "content_type": "text/plain",
                    "revpos": 1,
                    "length": 12,
                    "digest": "md5-7Qdih1MuhjZehB6Sv8UNjA==",
                    "stub": true,
                },
            },
        });

        let (doc, _) = json_to_doc(input.clone()).unwrap();
        let output = doc_to_json(doc).await.unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn inline_data_computes_length_and_digest() {
        let input = json!({
            "_id": "withatt",
            "_rev": "1-a",
            "_revisions": {"start": 1, "ids": ["a"]},
            "_attachments": {
                "text.txt": {
                    "content_type": "text/plain",
                    "revpos": 1,
                    "data": base64::encode(b"Hello World!"),
                },
            },
        });

        let (doc, _) = json_to_doc(input).unwrap();
        let atts = doc.attachments.as_ref().unwrap();
        let meta = atts["text.txt"].meta().unwrap();
        assert_eq!(meta.length, 12);
        assert_eq!(meta.digest, "md5-7Qdih1MuhjZehB6Sv8UNjA==");
    }

    #[test]
    fn follows_attachments_are_returned_separately() {
        let input = json!({
            "_id": "withatt",
            "_rev": "1-a",
            "_revisions": {"start": 1, "ids": ["a"]},
            "_attachments": {
                "big.bin": {
                    "content_type": "application/octet-stream",
                    "revpos": 1,
                    "length": 5,
                    "digest": "md5-xxx",
                    "follows": true,
                },
            },
        });

        let (doc, follows) = json_to_doc(input).unwrap();
        assert!(doc.attachments.as_ref().unwrap().is_empty());
        assert_eq!(follows.len(), 1);
        assert_eq!(follows[0].name, "big.bin");
        assert_eq!(follows[0].meta.length, 5);
    }

    #[test]
    fn missing_revisions_field_falls_back_to_rev() {
        let input = json!({"_id": "d", "_rev": "1-abc", "x": true});
        let (doc, _) = json_to_doc(input).unwrap();
        assert_eq!(doc.rev_num, 1);
        assert_eq!(doc.path, vec!["abc"]);
    }

    #[test]
    fn update_rev_is_deterministic_and_chains() {
        let body: Map<String, Value> = serde_json::from_value(json!({"x": 1})).unwrap();
        let mut a = Document::new("doc", 0, vec![], body.clone());
        let mut b = Document::new("doc", 0, vec![], body);

        a.update_rev();
        b.update_rev();
        assert_eq!(a.rev(), b.rev());
        assert_eq!(a.rev_num, 1);
        assert_eq!(a.path.len(), 1);

        a.update_rev();
        assert_eq!(a.rev_num, 2);
        assert_eq!(a.path.len(), 2);
        // the old head is now the parent
        assert_eq!(a.path[1], b.path[0]);
    }

    #[test]
    fn update_rev_depends_on_body() {
        let body1: Map<String, Value> = serde_json::from_value(json!({"x": 1})).unwrap();
        let body2: Map<String, Value> = serde_json::from_value(json!({"x": 2})).unwrap();
        let mut a = Document::new("doc", 0, vec![], body1);
        let mut b = Document::new("doc", 0, vec![], body2);

        a.update_rev();
        b.update_rev();
        assert_ne!(a.path[0], b.path[0]);
    }
}
