//! Per-port bindings supplied in a job request (spec §3 "Binding").

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The concrete value attached to a port for a specific job. Shape depends
/// on the port's declared type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    Stream {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    Multistream {
        #[serde(rename = "streamIds")]
        stream_ids: Vec<String>,
    },
    Grid {
        catalog: String,
        dataset: String,
    },
    Collection {
        ports: Vec<IndexedBinding>,
    },
    // Document is last and deliberately the most permissive shape (both
    // fields optional) — every other variant requires a field Document
    // doesn't have, and `deny_unknown_fields` stops it from silently
    // swallowing a Grid/Stream/Collection payload it doesn't recognize.
    #[serde(deny_unknown_fields)]
    Document {
        #[serde(rename = "documentId", skip_serializing_if = "Option::is_none")]
        document_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        document: Option<Value>,
    },
}

/// An element of a collection binding, carrying its position so responses
/// can be reassembled in order (spec §3 "collection").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedBinding {
    pub index: usize,
    #[serde(flatten)]
    pub binding: Binding,
}

impl Binding {
    /// A document binding is "unset" when `document` is absent — this is a
    /// legal state distinct from `wasSupplied == false` (spec §3).
    pub fn document_is_unset(&self) -> bool {
        matches!(self, Binding::Document { document: None, .. })
    }
}
