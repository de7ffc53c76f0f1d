use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt, stream};
use log::{debug, warn};
use miette::Diagnostic;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CouchError {
    #[error("error executing CouchDB request")]
    RequestExecute(#[source] reqwest::Error),

    #[error("CouchDB reported a server error")]
    CouchStatus(#[source] reqwest::Error),

    #[error("error extracting response body")]
    RequestBody(#[source] reqwest::Error),

    #[error("error deserializing CouchDB response")]
    Deserialize(#[source] serde_json::Error),

    #[error("document update conflict")]
    Conflict,
}

/// One row of the `_changes` feed. The `doc` itself is not included; callers
/// fetch it separately so a slow consumer never holds the feed open.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRow {
    #[serde(deserialize_with = "seq_to_string")]
    pub seq: String,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

// CouchDB 1.x emits numeric sequence tokens, 2.x+ emits opaque strings.
// Everything downstream treats the token as an opaque string either way.
fn seq_to_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected sequence token: {other}"
        ))),
    }
}

#[derive(Clone)]
pub struct Couch {
    client: reqwest::Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
}

impl Couch {
    pub fn new(
        base_url: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            user,
            password,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_deref());
        }
        builder
    }

    fn doc_url(&self, db: &str, doc_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            db,
            utf8_percent_encode(doc_id, NON_ALPHANUMERIC)
        )
    }

    /// Fetch the server banner. Used once at startup as a connection probe.
    pub async fn server_info(&self) -> Result<Value, CouchError> {
        let response = self
            .request(reqwest::Method::GET, &self.base_url)
            .send()
            .await
            .map_err(CouchError::RequestExecute)?
            .error_for_status()
            .map_err(CouchError::CouchStatus)?;

        let text = response.text().await.map_err(CouchError::RequestBody)?;
        serde_json::from_str(&text).map_err(CouchError::Deserialize)
    }

    /// Fetch a document by id. A 404 is not an error, it maps to `None`.
    pub async fn get(&self, db: &str, doc_id: &str) -> Result<Option<Value>, CouchError> {
        let response = self
            .request(reqwest::Method::GET, &self.doc_url(db, doc_id))
            .send()
            .await
            .map_err(CouchError::RequestExecute)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response
            .error_for_status()
            .map_err(CouchError::CouchStatus)?;
        let text = response.text().await.map_err(CouchError::RequestBody)?;
        let doc = serde_json::from_str(&text).map_err(CouchError::Deserialize)?;
        Ok(Some(doc))
    }

    /// Write a document. The caller is responsible for attaching the current
    /// `_rev`; a stale or missing revision on an existing document yields
    /// `CouchError::Conflict` (HTTP 409).
    pub async fn put(&self, db: &str, doc_id: &str, doc: &Value) -> Result<(), CouchError> {
        let response = self
            .request(reqwest::Method::PUT, &self.doc_url(db, doc_id))
            .json(doc)
            .send()
            .await
            .map_err(CouchError::RequestExecute)?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(CouchError::Conflict);
        }

        response
            .error_for_status()
            .map_err(CouchError::CouchStatus)?;
        Ok(())
    }

    /// Open the continuous `_changes` feed starting after `since` and stream
    /// its rows. The stream ends when the server closes the connection (or on
    /// the first transport error); consumers re-enter it on their own cadence.
    pub fn changes(
        &self,
        db: &str,
        since: &str,
    ) -> impl Stream<Item = Result<ChangeRow, CouchError>> + Send + use<> {
        let couch = self.clone();
        let url = format!("{}/{}/_changes", self.base_url, db);
        let since = since.to_string();

        stream::unfold(
            FeedState::Connect { couch, url, since },
            |mut state| async move {
                loop {
                    match state {
                        FeedState::Connect { couch, url, since } => {
                            let request = couch.request(reqwest::Method::GET, &url).query(&[
                                ("feed", "continuous"),
                                ("since", since.as_str()),
                                ("include_docs", "false"),
                                ("heartbeat", "30000"),
                            ]);

                            let response = match request.send().await {
                                Ok(response) => response,
                                Err(err) => {
                                    return Some((
                                        Err(CouchError::RequestExecute(err)),
                                        FeedState::Finished,
                                    ));
                                }
                            };
                            let response = match response.error_for_status() {
                                Ok(response) => response,
                                Err(err) => {
                                    return Some((
                                        Err(CouchError::CouchStatus(err)),
                                        FeedState::Finished,
                                    ));
                                }
                            };

                            debug!("Changes feed open on {url}");
                            let body: FeedBody = Box::pin(
                                response
                                    .bytes_stream()
                                    .map(|chunk| chunk.map(|bytes| bytes.to_vec())),
                            );
                            state = FeedState::Streaming {
                                body,
                                buf: Vec::new(),
                                rows: VecDeque::new(),
                            };
                        }
                        FeedState::Streaming {
                            mut body,
                            mut buf,
                            mut rows,
                        } => {
                            if let Some(row) = rows.pop_front() {
                                return Some((Ok(row), FeedState::Streaming { body, buf, rows }));
                            }

                            match body.next().await {
                                Some(Ok(chunk)) => {
                                    buf.extend_from_slice(&chunk);
                                    // A chunk can end mid-line (or mid-code-point),
                                    // so only complete lines are parsed here.
                                    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                                        let line: Vec<u8> = buf.drain(..=pos).collect();
                                        if let Some(row) = parse_change_line(&line[..pos]) {
                                            rows.push_back(row);
                                        }
                                    }
                                    state = FeedState::Streaming { body, buf, rows };
                                }
                                Some(Err(err)) => {
                                    return Some((
                                        Err(CouchError::RequestBody(err)),
                                        FeedState::Finished,
                                    ));
                                }
                                None => {
                                    debug!("Changes feed closed by the server");
                                    return None;
                                }
                            }
                        }
                        FeedState::Finished => return None,
                    }
                }
            },
        )
    }
}

type FeedBody = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

enum FeedState {
    Connect {
        couch: Couch,
        url: String,
        since: String,
    },
    Streaming {
        body: FeedBody,
        buf: Vec<u8>,
        rows: VecDeque<ChangeRow>,
    },
    Finished,
}

fn parse_change_line(line: &[u8]) -> Option<ChangeRow> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line.trim(),
        Err(_) => {
            warn!("Non-UTF8 line in changes feed");
            return None;
        }
    };
    // Empty lines are heartbeats.
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<ChangeRow>(line) {
        Ok(row) => Some(row),
        Err(err) => {
            // The feed's final row is {"last_seq": ...}, which has no id and
            // is expected not to parse. Anything else is worth a warning.
            if !line.contains("last_seq") {
                warn!("Unparseable changes-feed line ({err}): {line}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_row_with_string_seq() {
        let row = parse_change_line(
            br#"{"seq":"12-g1AAAA","id":"P123","changes":[{"rev":"1-abc"}]}"#,
        )
        .expect("row should parse");
        assert_eq!(row.seq, "12-g1AAAA");
        assert_eq!(row.id, "P123");
        assert!(!row.deleted);
    }

    #[test]
    fn change_row_with_numeric_seq() {
        let row = parse_change_line(br#"{"seq":42,"id":"P456","changes":[]}"#)
            .expect("row should parse");
        assert_eq!(row.seq, "42");
    }

    #[test]
    fn deleted_flag_is_carried() {
        let row = parse_change_line(br#"{"seq":7,"id":"P1","deleted":true,"changes":[]}"#)
            .expect("row should parse");
        assert!(row.deleted);
    }

    #[test]
    fn heartbeats_and_last_seq_are_skipped() {
        assert!(parse_change_line(b"").is_none());
        assert!(parse_change_line(b"   ").is_none());
        assert!(parse_change_line(br#"{"last_seq":"99-xyz","pending":0}"#).is_none());
    }

    #[test]
    fn doc_ids_are_percent_encoded() {
        let couch = Couch::new("http://localhost:5984/", None, None);
        let url = couch.doc_url("projects", "P123+special/id");
        assert_eq!(url, "http://localhost:5984/projects/P123%2Bspecial%2Fid");
    }
}
