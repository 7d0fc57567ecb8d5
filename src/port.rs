//! Typed port / binding model (spec §4.2, Design Notes §9).
//!
//! Modeled as a tagged variant rather than the source's base-class-plus-mixin
//! hierarchy: `Port = Stream | Multistream | Document | Grid | Collection`.
//! Collection polymorphism is an enum discriminant on the element kind
//! rather than a generic type parameter, so every port — collection or not —
//! fits in one flat `HashMap<String, Port>` registry (SPEC_FULL §4.2).
//!
//! Mutation only ever happens on document ports; the context's sink is
//! passed in at call time rather than held as a back-reference, avoiding the
//! port↔context reference cycle flagged in Design Notes §9.

use crate::binding::{Binding, IndexedBinding};
use crate::manifest::{Direction, PortDecl, PortType};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// A single recorded document mutation (spec §3 "Port value" invariants).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModifiedDocument {
    #[serde(rename = "documentId", skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub document: Value,
}

/// Shared sink for document mutations, keyed by port name. Passed to
/// [`Port::set_document`] rather than held by the port itself.
#[derive(Debug, Default)]
pub struct ModifiedDocuments(Mutex<HashMap<String, ModifiedDocument>>);

impl ModifiedDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, port_name: &str, entry: ModifiedDocument) {
        self.0.lock().expect("modified-documents poisoned").insert(port_name.to_string(), entry);
    }

    pub fn snapshot(&self) -> HashMap<String, ModifiedDocument> {
        self.0.lock().expect("modified-documents poisoned").clone()
    }
}

/// Shared sink recording which stream/multistream output ports were touched
/// via upstream client side-effects (spec §4.2 "Non-document output ports
/// are reported... only as touched via upstream client side effects").
#[derive(Debug, Default)]
pub struct ModifiedStreams(Mutex<std::collections::HashSet<String>>);

impl ModifiedStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, stream_id: &str) {
        self.0.lock().expect("modified-streams poisoned").insert(stream_id.to_string());
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.0.lock().expect("modified-streams poisoned").contains(stream_id)
    }

    pub fn snapshot(&self) -> std::collections::HashSet<String> {
        self.0.lock().expect("modified-streams poisoned").clone()
    }
}

/// Shared fields carried by every port, regardless of type.
#[derive(Debug, Clone)]
pub struct PortMeta {
    pub name: String,
    pub port_type: PortType,
    pub direction: Direction,
    pub was_supplied: bool,
}

#[derive(Debug)]
pub struct StreamPort {
    pub meta: PortMeta,
    pub stream_id: Option<String>,
}

impl StreamPort {
    pub fn get(&self, default: Option<String>) -> Option<String> {
        if self.meta.was_supplied {
            self.stream_id.clone()
        } else {
            default
        }
    }
}

#[derive(Debug)]
pub struct MultistreamPort {
    pub meta: PortMeta,
    pub stream_ids: Vec<String>,
}

impl MultistreamPort {
    pub fn get(&self, default: Vec<String>) -> Vec<String> {
        if self.meta.was_supplied {
            self.stream_ids.clone()
        } else {
            default
        }
    }
}

#[derive(Debug)]
pub struct DocumentPort {
    pub meta: PortMeta,
    pub document_id: Option<String>,
    /// The position of this port inside its enclosing collection, if any.
    pub index: Option<usize>,
    value: Mutex<Option<Value>>,
}

impl DocumentPort {
    pub fn get(&self, default: Option<Value>) -> Option<Value> {
        if self.meta.was_supplied {
            self.value.lock().expect("document port poisoned").clone()
        } else {
            default
        }
    }

    /// Assign a new value. Only valid on output ports — callers enforce this
    /// at the call site (spec §4.2 "Mutation is permitted only on document
    /// ports"). Records a modification iff the value actually changed.
    pub fn set_document(&self, new_value: Value, sink: &ModifiedDocuments) {
        let mut current = self.value.lock().expect("document port poisoned");
        let changed = current.as_ref() != Some(&new_value);
        *current = Some(new_value.clone());
        if changed {
            sink.record(
                &self.meta.name,
                ModifiedDocument {
                    document_id: self.document_id.clone(),
                    index: self.index,
                    document: new_value,
                },
            );
        }
    }
}

/// A lazily-materialized reference to a dataset within a grid catalog. Holds
/// the authority used to key the shared client cache, plus the catalog/
/// dataset coordinates themselves — the concrete upstream grid client is an
/// external collaborator (spec §1 Non-goals), so this handle is the full
/// contract the core owns.
#[derive(Debug, Clone)]
pub struct GridDatasetRef {
    pub authority: String,
    pub catalog: String,
    pub dataset: String,
}

#[derive(Debug)]
pub struct GridPort {
    pub meta: PortMeta,
    pub catalog: Option<String>,
    pub dataset_path: Option<String>,
}

impl GridPort {
    /// Materialize the dataset reference on first access (spec §4.2 "Grid
    /// dataset lookup"). Returns `None` if the port was never supplied.
    pub fn dataset(&self) -> Option<GridDatasetRef> {
        if !self.meta.was_supplied {
            return None;
        }
        let catalog = self.catalog.clone()?;
        let dataset = self.dataset_path.clone()?;
        let authority = crate::client_cache::authority_of(&catalog);
        Some(GridDatasetRef { authority, catalog, dataset })
    }

    /// Upload policy for an output grid port (spec §4.2 "Upload policy"):
    /// only valid on output ports, and the upload authority must match the
    /// configured read-catalog authority unless an explicit upload client
    /// authority is supplied.
    pub fn check_upload_authority(
        &self,
        upload_authority: &str,
        configured_read_authority: &str,
    ) -> crate::error::Result<()> {
        if self.meta.direction != Direction::Output {
            return Err(crate::error::ExecutionError::UnhandledWorkerException {
                msg: format!("grid port {:?} is not an output port", self.meta.name),
                developer_msg: "upload attempted on non-output grid port".to_string(),
            });
        }
        if upload_authority != configured_read_authority {
            return Err(crate::error::ExecutionError::CrossEnvironmentUpload {
                expected: configured_read_authority.to_string(),
                got: upload_authority.to_string(),
            });
        }
        Ok(())
    }
}

/// A collection port: an ordered list of inner ports of one element kind.
#[derive(Debug)]
pub struct CollectionPort {
    pub meta: PortMeta,
    pub ports: Vec<Port>,
}

impl CollectionPort {
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }
}

impl std::fmt::Display for CollectionPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.ports.iter().map(|p| format!("{:?}", p.meta().port_type)).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// The tagged variant covering every declared port type (spec §9).
#[derive(Debug)]
pub enum Port {
    Stream(StreamPort),
    Multistream(MultistreamPort),
    Document(DocumentPort),
    Grid(GridPort),
    Collection(CollectionPort),
}

impl Port {
    pub fn meta(&self) -> &PortMeta {
        match self {
            Port::Stream(p) => &p.meta,
            Port::Multistream(p) => &p.meta,
            Port::Document(p) => &p.meta,
            Port::Grid(p) => &p.meta,
            Port::Collection(p) => &p.meta,
        }
    }

    pub fn was_supplied(&self) -> bool {
        self.meta().was_supplied
    }

    /// Build a port from its manifest declaration and an optional binding
    /// (absent ⇒ `was_supplied == false`).
    pub fn build(decl: &PortDecl, binding: Option<Binding>) -> Port {
        build_port(decl.name.clone(), decl.port_type, decl.direction, binding, None)
    }
}

fn build_port(
    name: String,
    port_type: PortType,
    direction: Direction,
    binding: Option<Binding>,
    index: Option<usize>,
) -> Port {
    let was_supplied = binding.is_some();
    let meta = PortMeta { name, port_type, direction, was_supplied };

    if port_type.is_collection() {
        let element_type = port_type.element_type();
        let inner_bindings: Vec<IndexedBinding> = match binding {
            Some(Binding::Collection { ports }) => ports,
            _ => Vec::new(),
        };
        // Binding order is authoritative (spec §3 "collection" — ordered;
        // each inner element's `index` matches its position); we trust the
        // array order rather than re-sorting by the carried index.
        let ports: Vec<Port> = inner_bindings
            .into_iter()
            .map(|ib| {
                build_port(
                    format!("{}[{}]", meta.name, ib.index),
                    element_type,
                    direction,
                    Some(ib.binding),
                    Some(ib.index),
                )
            })
            .collect();
        return Port::Collection(CollectionPort { meta, ports });
    }

    match (port_type, binding) {
        (PortType::Stream, Some(Binding::Stream { stream_id })) => {
            Port::Stream(StreamPort { meta, stream_id: Some(stream_id) })
        }
        (PortType::Stream, _) => Port::Stream(StreamPort { meta, stream_id: None }),
        (PortType::Multistream, Some(Binding::Multistream { stream_ids })) => {
            Port::Multistream(MultistreamPort { meta, stream_ids })
        }
        (PortType::Multistream, _) => Port::Multistream(MultistreamPort { meta, stream_ids: Vec::new() }),
        (PortType::Document, Some(Binding::Document { document_id, document })) => {
            Port::Document(DocumentPort {
                meta,
                document_id,
                index,
                value: Mutex::new(document),
            })
        }
        (PortType::Document, _) => Port::Document(DocumentPort {
            meta,
            document_id: None,
            index,
            value: Mutex::new(None),
        }),
        (PortType::Grid, Some(Binding::Grid { catalog, dataset })) => Port::Grid(GridPort {
            meta,
            catalog: Some(catalog),
            dataset_path: Some(dataset),
        }),
        (PortType::Grid, _) => Port::Grid(GridPort { meta, catalog: None, dataset_path: None }),
        (other, _) => unreachable!("collection types handled above, got {:?}", other),
    }
}

/// The registry of ports for one job, keyed by declared name (spec §4.3
/// "the port registry (name → port)").
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: HashMap<String, Port>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: Port) {
        self.ports.insert(port.meta().name.clone(), port);
    }

    pub fn get(&self, name: &str) -> Option<&Port> {
        self.ports.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ports.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Port)> {
        self.ports.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Direction, PortType};

    fn decl(name: &str, port_type: PortType, direction: Direction) -> PortDecl {
        PortDecl { name: name.to_string(), port_type, direction, required: false }
    }

    #[test]
    fn document_port_was_supplied_reflects_binding_presence() {
        let unbound = Port::build(&decl("x", PortType::Document, Direction::Input), None);
        assert!(!unbound.was_supplied());

        let bound = Port::build(
            &decl("x", PortType::Document, Direction::Input),
            Some(Binding::Document { document_id: None, document: Some(Value::String("hi".into())) }),
        );
        assert!(bound.was_supplied());
    }

    #[test]
    fn document_get_returns_default_when_unsupplied() {
        let port = Port::build(&decl("x", PortType::Document, Direction::Input), None);
        if let Port::Document(d) = port {
            assert_eq!(d.get(Some(Value::String("fallback".into()))), Some(Value::String("fallback".into())));
        } else {
            panic!("expected document port");
        }
    }

    #[test]
    fn document_mutation_records_exactly_one_modification() {
        let port = Port::build(
            &decl("out", PortType::Document, Direction::Output),
            Some(Binding::Document { document_id: Some("D1".to_string()), document: Some(Value::String("".into())) }),
        );
        let sink = ModifiedDocuments::new();
        if let Port::Document(d) = &port {
            d.set_document(Value::String("hello!".into()), &sink);
            // Setting the same value again must not add a second entry / re-trigger.
            d.set_document(Value::String("hello!".into()), &sink);
        } else {
            panic!("expected document port");
        }
        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 1);
        let entry = &snapshot["out"];
        assert_eq!(entry.document, Value::String("hello!".into()));
        assert_eq!(entry.document_id, Some("D1".to_string()));
    }

    #[test]
    fn collection_port_preserves_binding_order_and_index() {
        let binding = Binding::Collection {
            ports: vec![
                IndexedBinding { index: 0, binding: Binding::Stream { stream_id: "A".to_string() } },
                IndexedBinding { index: 1, binding: Binding::Stream { stream_id: "B".to_string() } },
            ],
        };
        let port = Port::build(
            &decl("coll", PortType::StreamCollection, Direction::Input),
            Some(binding),
        );
        if let Port::Collection(c) = port {
            assert_eq!(c.len(), 2);
            let ids: Vec<_> = c.iter().map(|p| match p {
                Port::Stream(s) => s.stream_id.clone().unwrap(),
                _ => panic!("expected stream"),
            }).collect();
            assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
        } else {
            panic!("expected collection port");
        }
    }

    #[test]
    fn grid_dataset_materializes_authority_from_catalog() {
        let port = Port::build(
            &decl("grid", PortType::Grid, Direction::Input),
            Some(Binding::Grid { catalog: "http://thredds.example.com:8080/catalog".to_string(), dataset: "foo.nc".to_string() }),
        );
        if let Port::Grid(g) = port {
            let ds = g.dataset().unwrap();
            assert_eq!(ds.authority, "thredds.example.com:8080");
            assert_eq!(ds.dataset, "foo.nc");
        } else {
            panic!("expected grid port");
        }
    }

    #[test]
    fn grid_upload_rejects_mismatched_authority() {
        let port = Port::build(
            &decl("grid_out", PortType::Grid, Direction::Output),
            Some(Binding::Grid { catalog: "http://thredds-read.example.com".to_string(), dataset: "foo.nc".to_string() }),
        );
        if let Port::Grid(g) = port {
            let result = g.check_upload_authority("other-host.example.com", "thredds-read.example.com");
            assert!(result.is_err());
        } else {
            panic!("expected grid port");
        }
    }
}
