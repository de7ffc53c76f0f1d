use std::pin::Pin;

use couch::{ChangeRow, Couch, CouchError};
use futures::{Stream, StreamExt, stream};
use log::{debug, error, warn};
use serde_json::Value;

use crate::seq::SeqTracker;

/// Read-only access to the upstream projects database: document fetch plus
/// the changes feed joined with cursor persistence. Yggdrasil never writes
/// here.
pub struct ProjectDbManager {
    couch: Couch,
    db_name: String,
}

type Feed = Pin<Box<dyn Stream<Item = Result<ChangeRow, CouchError>> + Send>>;

enum ChangesState {
    Open {
        couch: Couch,
        db_name: String,
        tracker: SeqTracker,
    },
    Draining {
        couch: Couch,
        db_name: String,
        tracker: SeqTracker,
        feed: Feed,
    },
}

impl ProjectDbManager {
    pub fn new(couch: Couch, db_name: impl Into<String>) -> Self {
        Self {
            couch,
            db_name: db_name.into(),
        }
    }

    pub async fn fetch_document_by_id(&self, doc_id: &str) -> Option<Value> {
        match self.couch.get(&self.db_name, doc_id).await {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => {
                error!("Document with ID '{doc_id}' not found in the projects database.");
                None
            }
            Err(err) => {
                error!("Error while accessing the projects database: {err}");
                None
            }
        }
    }

    /// One pass over the continuous changes feed, yielding `(document, seq)`
    /// pairs. For every row the full document is fetched and the cursor is
    /// persisted; a failed document fetch is logged and skipped but the
    /// cursor still advances past it. The stream ends when the server closes
    /// the feed (or on a transport error) and the consumer re-enters it.
    pub fn changes(&self, tracker: SeqTracker) -> impl Stream<Item = (Value, String)> + Send {
        let state = ChangesState::Open {
            couch: self.couch.clone(),
            db_name: self.db_name.clone(),
            tracker,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                match state {
                    ChangesState::Open {
                        couch,
                        db_name,
                        tracker,
                    } => {
                        let since = tracker.load().await;
                        debug!("Opening changes feed on '{db_name}' since {since}");
                        let feed: Feed = Box::pin(couch.changes(&db_name, &since));
                        state = ChangesState::Draining {
                            couch,
                            db_name,
                            tracker,
                            feed,
                        };
                    }
                    ChangesState::Draining {
                        couch,
                        db_name,
                        tracker,
                        mut feed,
                    } => {
                        match feed.next().await {
                            Some(Ok(row)) => {
                                let seq = row.seq.clone();
                                let doc = if row.deleted {
                                    None
                                } else {
                                    match couch.get(&db_name, &row.id).await {
                                        Ok(Some(doc)) => Some(doc),
                                        Ok(None) => {
                                            warn!("Document with ID {} is gone.", row.id);
                                            None
                                        }
                                        Err(err) => {
                                            warn!(
                                                "Error fetching changed document '{}': {err}",
                                                row.id
                                            );
                                            None
                                        }
                                    }
                                };

                                // The cursor advances whether or not the
                                // document could be fetched; a poisoned
                                // change must not wedge the feed.
                                if let Err(err) = tracker.save(&seq).await {
                                    error!("Could not persist the change cursor: {err}");
                                }

                                let next = ChangesState::Draining {
                                    couch,
                                    db_name,
                                    tracker,
                                    feed,
                                };
                                match doc {
                                    Some(doc) => return Some(((doc, seq), next)),
                                    None => {
                                        state = next;
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                warn!("Changes feed error: {err}");
                                return None;
                            }
                            None => {
                                debug!("Changes feed drained.");
                                return None;
                            }
                        }
                    }
                }
            }
        })
    }
}
