//! Per-job execution context (spec §4.3), modeled directly on the teacher's
//! `ExecCtx`/`ExecCtxBuilder`: a builder constructs the context, lazily
//! materializing upstream service configurations exactly as `ExecCtxBuilder`
//! lazily built its `reqwest::Client`.

use crate::client_cache::{authority_of, ClientCache};
use crate::ipc::WorkerMessage;
use crate::log_entry::LogEntry;
use crate::port::{ModifiedDocuments, ModifiedStreams, Port, PortRegistry};
use crate::service_config::{resolve_service_config, ServiceConfig, ServiceConfigInput};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// A materialized upstream client stub. The concrete sensor/analysis/grid
/// clients are an external collaborator (spec §1 Non-goals — "only the
/// factory contract"); this struct is the contract the core owns: a
/// resolved configuration plus the authority it was built for, which is
/// what the client cache keys on.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    pub config: ServiceConfig,
}

/// The four optional upstream service configurations a job request may
/// carry (spec §6: `sensorCloudConfiguration`, `analysisServicesConfiguration`,
/// `threddsConfiguration`, `threddsUploadConfiguration`).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct JobServiceConfigs {
    #[serde(rename = "sensorCloudConfiguration")]
    pub sensor: Option<ServiceConfigInput>,
    #[serde(rename = "analysisServicesConfiguration")]
    pub analysis: Option<ServiceConfigInput>,
    #[serde(rename = "threddsConfiguration")]
    pub grid_read: Option<ServiceConfigInput>,
    #[serde(rename = "threddsUploadConfiguration")]
    pub grid_upload: Option<ServiceConfigInput>,
}

/// The per-job object passed to user code (spec GLOSSARY "Context").
pub struct ExecutionContext {
    pub model_id: String,
    pub debug: bool,
    ports: PortRegistry,
    configs: JobServiceConfigs,
    clients: ClientCache<UpstreamClient>,
    sink: UnboundedSender<WorkerMessage>,
    modified_streams: Arc<ModifiedStreams>,
    modified_documents: Arc<ModifiedDocuments>,
    /// Guards the once-per-job deprecation notice for the legacy
    /// `update(modified_streams, modified_documents)` positional form
    /// (spec §4.3, SPEC_FULL §9 resolved open question).
    legacy_update_warned: AtomicBool,
}

impl ExecutionContext {
    pub fn builder(model_id: impl Into<String>, sink: UnboundedSender<WorkerMessage>) -> ExecutionContextBuilder {
        ExecutionContextBuilder {
            model_id: model_id.into(),
            debug: false,
            ports: PortRegistry::new(),
            configs: JobServiceConfigs::default(),
            sink,
        }
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.get(name)
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    /// Forward a non-terminal progress/message update to the host (spec
    /// §4.3 `update(message?, progress?)`).
    pub fn update(&self, message: Option<String>, progress: Option<f64>) {
        let _ = self.sink.send(WorkerMessage::Update { message, progress });
    }

    /// Legacy positional form accepted for backward compatibility (spec §4.3,
    /// §9 resolved open question: kept but deprecated, still consulted for
    /// result assembly, logged once per job rather than per call).
    pub fn update_legacy(
        &self,
        message: Option<String>,
        progress: Option<f64>,
        modified_streams: Vec<String>,
        modified_documents: Vec<(String, Value)>,
    ) {
        if self
            .legacy_update_warned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::warn!(
                model_id = %self.model_id,
                "update() called with deprecated positional modified_streams/modified_documents arguments"
            );
        }
        for stream_id in modified_streams {
            self.modified_streams.mark(&stream_id);
        }
        for (name, value) in modified_documents {
            self.modified_documents.record(
                &name,
                crate::port::ModifiedDocument { document_id: None, index: None, document: value },
            );
        }
        self.update(message, progress);
    }

    pub fn log(&self, entry: LogEntry) {
        let _ = self.sink.send(WorkerMessage::Log { entries: vec![entry] });
    }

    pub fn modified_streams(&self) -> &ModifiedStreams {
        &self.modified_streams
    }

    pub fn modified_documents(&self) -> &ModifiedDocuments {
        &self.modified_documents
    }

    /// Mark a stream as touched by an upstream-client side effect (spec
    /// §4.2/§4.3 — stream/multistream output ports are reported as "touched"
    /// rather than via direct mutation).
    pub fn mark_stream_modified(&self, stream_id: &str) {
        self.modified_streams.mark(stream_id);
    }

    fn resolve_config(&self, input: &Option<ServiceConfigInput>) -> Option<ServiceConfig> {
        input.as_ref().map(resolve_service_config)
    }

    fn client_for(&self, input: &Option<ServiceConfigInput>) -> Option<Arc<UpstreamClient>> {
        let config = self.resolve_config(input)?;
        let authority = authority_of(&config.url);
        Some(self.clients.get_or_create(&authority, || UpstreamClient { config }))
    }

    /// Lazily materialize the sensor-cloud upstream client (spec §4.3).
    pub fn sensor_client(&self) -> Option<Arc<UpstreamClient>> {
        self.client_for(&self.configs.sensor)
    }

    /// Lazily materialize the analysis-services upstream client (spec §4.3).
    pub fn analysis_client(&self) -> Option<Arc<UpstreamClient>> {
        self.client_for(&self.configs.analysis)
    }

    /// Lazily materialize the grid-read (THREDDS) upstream client (spec §4.3).
    pub fn grid_read_client(&self) -> Option<Arc<UpstreamClient>> {
        self.client_for(&self.configs.grid_read)
    }

    /// Lazily materialize the grid-upload upstream client (spec §4.3, §4.2
    /// "Upload policy" — falls back to the read client's config when no
    /// explicit upload configuration was supplied).
    pub fn grid_upload_client(&self) -> Option<Arc<UpstreamClient>> {
        if self.configs.grid_upload.is_some() {
            self.client_for(&self.configs.grid_upload)
        } else {
            self.grid_read_client()
        }
    }

    pub fn configured_read_authority(&self) -> Option<String> {
        self.resolve_config(&self.configs.grid_read).map(|c| authority_of(&c.url))
    }
}

pub struct ExecutionContextBuilder {
    model_id: String,
    debug: bool,
    ports: PortRegistry,
    configs: JobServiceConfigs,
    sink: UnboundedSender<WorkerMessage>,
}

impl ExecutionContextBuilder {
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn port(mut self, port: Port) -> Self {
        self.ports.insert(port);
        self
    }

    pub fn ports(mut self, ports: PortRegistry) -> Self {
        self.ports = ports;
        self
    }

    pub fn configs(mut self, configs: JobServiceConfigs) -> Self {
        self.configs = configs;
        self
    }

    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            model_id: self.model_id,
            debug: self.debug,
            ports: self.ports,
            configs: self.configs,
            clients: ClientCache::new(),
            sink: self.sink,
            modified_streams: Arc::new(ModifiedStreams::new()),
            modified_documents: Arc::new(ModifiedDocuments::new()),
            legacy_update_warned: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Direction, PortDecl, PortType};

    fn channel() -> (UnboundedSender<WorkerMessage>, tokio::sync::mpsc::UnboundedReceiver<WorkerMessage>) {
        tokio::sync::mpsc::unbounded_channel()
    }

    #[test]
    fn update_forwards_to_sink() {
        let (tx, mut rx) = channel();
        let ctx = ExecutionContext::builder("echo", tx).build();
        ctx.update(Some("halfway".to_string()), Some(0.5));
        let msg = rx.try_recv().unwrap();
        match msg {
            WorkerMessage::Update { message, progress } => {
                assert_eq!(message.as_deref(), Some("halfway"));
                assert_eq!(progress, Some(0.5));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn port_lookup_returns_registered_port() {
        let (tx, _rx) = channel();
        let decl = PortDecl { name: "in".to_string(), port_type: PortType::Document, direction: Direction::Input, required: true };
        let port = Port::build(&decl, None);
        let ctx = ExecutionContext::builder("echo", tx).port(port).build();
        assert!(ctx.port("in").is_some());
        assert!(ctx.port("missing").is_none());
    }

    #[test]
    fn sensor_client_absent_when_not_configured() {
        let (tx, _rx) = channel();
        let ctx = ExecutionContext::builder("echo", tx).build();
        assert!(ctx.sensor_client().is_none());
    }

    #[test]
    fn sensor_client_caches_by_authority() {
        let (tx, _rx) = channel();
        let mut configs = JobServiceConfigs::default();
        configs.sensor = Some(ServiceConfigInput { url: "http://sensors.example.com".to_string(), verify: true, ..Default::default() });
        let ctx = ExecutionContext::builder("echo", tx).configs(configs).build();

        let a = ctx.sensor_client().unwrap();
        let b = ctx.sensor_client().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn grid_upload_client_falls_back_to_read_client() {
        let (tx, _rx) = channel();
        let mut configs = JobServiceConfigs::default();
        configs.grid_read = Some(ServiceConfigInput { url: "http://thredds.example.com".to_string(), verify: true, ..Default::default() });
        let ctx = ExecutionContext::builder("echo", tx).configs(configs).build();

        let upload = ctx.grid_upload_client().unwrap();
        assert_eq!(upload.config.host, "thredds.example.com");
    }

    #[test]
    fn legacy_update_warns_once_and_still_records() {
        let (tx, _rx) = channel();
        let ctx = ExecutionContext::builder("echo", tx).build();
        ctx.update_legacy(None, None, vec!["S1".to_string()], vec![]);
        ctx.update_legacy(None, None, vec!["S2".to_string()], vec![]);
        let streams = ctx.modified_streams().snapshot();
        assert!(streams.contains("S1"));
        assert!(streams.contains("S2"));
    }
}
