//! Run lifecycle state machine.
//!
//! A [`RunMaterializer`] consumes the documents of one run at a time:
//!
//! ```text
//!          start            descriptor             stop
//!   Idle ────────► Open ──────────────► Streaming ───────► Closing ──► Idle
//!                   │                    ▲   │ event/descriptor
//!                   │                    └───┘
//!                   └──────────── stop ─────────────────► Closing ──► Idle
//! ```
//!
//! Pre-run placeholders are resolved once, when the start document arrives,
//! because that is the moment the device state is meaningful. Descriptors and
//! events are only buffered. Everything is written on stop, when the sink is
//! opened, filled depth-first and closed. A document arriving in the wrong
//! state is rejected and leaves the state untouched.

mod report;
mod writer;

pub use report::{LeafFailure, RunReport};

use crate::device::DeviceRegistry;
use crate::error::{AppResult, NexusError, ResolveError};
use crate::experiment::{DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
use crate::resolve::{ResolutionSettings, Resolver, RunContext};
use crate::schema::{SchemaModel, SchemaSet};
use crate::sink::OutputSink;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Placeholder in file name templates replaced by the run uid.
pub const UID_TEMPLATE: &str = "{uid}";
pub const FILE_EXTENSION: &str = "nxs";

/// What to do with a dataset whose value could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Leave the dataset out of the file.
    #[default]
    Omit,
    /// Write the given text instead, with a `resolution_error` attribute.
    Sentinel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Open,
    Streaming,
    Closing,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Open => "open",
            RunState::Streaming => "streaming",
            RunState::Closing => "closing",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writer options independent of the documents of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// Directory output files are created in.
    pub output_dir: PathBuf,
    /// File name template used when the start document has no `nx_file_name`.
    pub file_name: Option<String>,
    pub failure_policy: FailurePolicy,
    pub resolution: ResolutionSettings,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            file_name: None,
            failure_policy: FailurePolicy::default(),
            resolution: ResolutionSettings::default(),
        }
    }
}

/// Output file name for a run: the template (default `{uid}`) with the uid
/// substituted and the `.nxs` extension appended when missing.
pub fn output_file_name(template: Option<&str>, uid: &str) -> String {
    let mut name = template.unwrap_or(UID_TEMPLATE).replace(UID_TEMPLATE, uid);
    let has_extension = Path::new(&name)
        .extension()
        .is_some_and(|ext| ext == FILE_EXTENSION);
    if !has_extension {
        name.push('.');
        name.push_str(FILE_EXTENSION);
    }
    name
}

struct ActiveRun {
    context: RunContext,
    /// Schemas of the run in device order, fallbacks included.
    schemas: Vec<Arc<SchemaModel>>,
}

pub struct RunMaterializer<S: OutputSink> {
    schemas: Arc<SchemaSet>,
    devices: DeviceRegistry,
    resolver: Resolver,
    options: WriterOptions,
    sink: S,
    state: RunState,
    run: Option<ActiveRun>,
}

impl<S: OutputSink> RunMaterializer<S> {
    pub fn new(
        schemas: Arc<SchemaSet>,
        devices: DeviceRegistry,
        sink: S,
        options: WriterOptions,
    ) -> Self {
        Self {
            schemas,
            devices,
            resolver: Resolver::new(options.resolution.clone()),
            options,
            sink,
            state: RunState::Idle,
            run: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Documents buffered for the run in progress.
    pub fn context(&self) -> Option<&RunContext> {
        self.run.as_ref().map(|run| &run.context)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Dispatch a document. Returns the report when the document closed a run.
    pub fn handle(&mut self, document: Document) -> AppResult<Option<RunReport>> {
        match document {
            Document::Start(doc) => self.start(doc).map(|_| None),
            Document::Descriptor(doc) => self.descriptor(doc).map(|_| None),
            Document::Event(doc) => self.event(doc).map(|_| None),
            Document::Stop(doc) => self.stop(doc).map(Some),
        }
    }

    pub fn start(&mut self, start: StartDoc) -> AppResult<()> {
        self.expect_state("start", &[RunState::Idle])?;

        let schemas = match start.embedded_schemas() {
            Some(embedded) => Arc::new(self.schemas.with_embedded(embedded)?),
            None => Arc::clone(&self.schemas),
        };
        let devices: BTreeSet<&str> = schemas.devices().chain(self.devices.names()).collect();
        let run_schemas: Vec<Arc<SchemaModel>> = devices
            .into_iter()
            .map(|device| schemas.for_device(device))
            .collect();

        let mut context = RunContext::new(start);
        for schema in &run_schemas {
            self.resolve_pre_run(schema, &mut context);
        }

        info!(
            "Run '{}' started with {} device schema(s)",
            context.uid(),
            run_schemas.len()
        );
        self.run = Some(ActiveRun {
            context,
            schemas: run_schemas,
        });
        self.state = RunState::Open;
        Ok(())
    }

    pub fn descriptor(&mut self, descriptor: DescriptorDoc) -> AppResult<()> {
        self.expect_state("descriptor", &[RunState::Open, RunState::Streaming])?;
        let run = self.active_run("descriptor")?;
        let name = descriptor.name.clone();
        if run.context.register_descriptor(descriptor) {
            debug!("Registered stream '{}'", name);
        } else {
            warn!("Descriptor of stream '{}' was already registered", name);
        }
        self.state = RunState::Streaming;
        Ok(())
    }

    pub fn event(&mut self, event: EventDoc) -> AppResult<()> {
        self.expect_state("event", &[RunState::Streaming])?;
        let run = self.active_run("event")?;
        let descriptor = event.descriptor.clone();
        if !run.context.add_event(event) {
            warn!("Dropping event of unknown descriptor '{}'", descriptor);
        }
        Ok(())
    }

    /// Write the run and return to idle, whatever the outcome.
    pub fn stop(&mut self, stop: StopDoc) -> AppResult<RunReport> {
        self.expect_state("stop", &[RunState::Open, RunState::Streaming])?;
        let mut run = self.run.take().ok_or(NexusError::InvalidState {
            document: "stop",
            state: self.state.as_str(),
        })?;
        if stop.run_start != run.context.uid() {
            warn!(
                "Stop document refers to run '{}' but run '{}' is open",
                stop.run_start,
                run.context.uid()
            );
        }
        run.context.stop = Some(stop);

        self.state = RunState::Closing;
        let result = self.materialize(&run);
        self.state = RunState::Idle;

        match &result {
            Ok(report) if report.is_complete() => info!(
                "Run '{}' written to '{}' ({} leaves)",
                report.uid,
                report.output_path.display(),
                report.leaves_written
            ),
            Ok(report) => warn!(
                "Run '{}' written to '{}' with {} failed leaf/leaves",
                report.uid,
                report.output_path.display(),
                report.failures.len()
            ),
            Err(e) => error!("Run '{}' aborted: {}", run.context.uid(), e),
        }
        result
    }

    /// Path of the output file for a run started with `start`.
    pub fn output_path(&self, start: &StartDoc) -> PathBuf {
        let template = start.file_name().or(self.options.file_name.as_deref());
        self.options
            .output_dir
            .join(output_file_name(template, &start.uid))
    }

    fn materialize(&mut self, run: &ActiveRun) -> AppResult<RunReport> {
        let output_path = self.output_path(&run.context.start);
        let root = self.sink.open(&output_path)?;

        let walked = {
            let mut tree = writer::TreeWriter::new(
                &mut self.sink,
                &run.context,
                &self.resolver,
                &self.options.failure_policy,
            );
            tree.write_run(root, &run.schemas)
                .map(|()| (tree.leaves_written, std::mem::take(&mut tree.failures)))
        };

        // The sink is closed even when the walk failed; the walk's error wins.
        let closed = self.sink.close();
        let (leaves_written, failures) = match walked {
            Ok(written) => written,
            Err(e) => {
                if let Err(close_error) = closed {
                    warn!(
                        "Closing '{}' after a failed write also failed: {}",
                        output_path.display(),
                        close_error
                    );
                }
                return Err(e.into());
            }
        };
        closed?;
        Ok(RunReport {
            uid: run.context.uid().to_string(),
            output_path,
            leaves_written,
            failures,
        })
    }

    fn resolve_pre_run(&self, schema: &SchemaModel, context: &mut RunContext) {
        let device = self.devices.get(&schema.device);
        for (path, placeholder) in schema.pre_run_placeholders() {
            if context.is_pre_run_cached(&schema.device, placeholder) {
                continue;
            }
            let result = match device {
                Some(device) => self.resolver.resolve_pre_run(placeholder, &**device),
                None => Err(ResolveError::UnknownDevice(schema.device.clone())),
            };
            if let Err(e) = &result {
                debug!("Pre-run value for '{}' unavailable: {}", path, e);
            }
            context.cache_pre_run(&schema.device, placeholder.clone(), result);
        }
    }

    fn expect_state(&self, document: &'static str, allowed: &[RunState]) -> AppResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            warn!("Rejecting '{}' document while {}", document, self.state);
            Err(NexusError::InvalidState {
                document,
                state: self.state.as_str(),
            })
        }
    }

    fn active_run(&mut self, document: &'static str) -> AppResult<&mut ActiveRun> {
        let state = self.state.as_str();
        self.run
            .as_mut()
            .ok_or(NexusError::InvalidState { document, state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDevice;
    use crate::error::LeafError;
    use crate::experiment::DataKey;
    use crate::sink::MemorySink;
    use serde_json::json;
    use tracing_test::traced_test;

    fn materializer(schemas: &[(&str, &str)], devices: DeviceRegistry) -> RunMaterializer<MemorySink> {
        let mut set = SchemaSet::default();
        for (device, text) in schemas {
            set.insert_yaml(device, text).unwrap();
        }
        RunMaterializer::new(Arc::new(set), devices, MemorySink::new(), WriterOptions::default())
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name(None, "abc"), "abc.nxs");
        assert_eq!(output_file_name(Some("scan_{uid}"), "abc"), "scan_abc.nxs");
        assert_eq!(output_file_name(Some("fixed.nxs"), "abc"), "fixed.nxs");
    }

    #[test]
    fn test_wrong_state_is_rejected_without_transition() {
        let mut writer = materializer(&[], DeviceRegistry::new());
        let err = writer.stop(StopDoc::success("nope")).unwrap_err();
        assert!(matches!(
            err,
            NexusError::InvalidState { document: "stop", state: "idle" }
        ));
        assert_eq!(writer.state(), RunState::Idle);

        let start = StartDoc::new();
        writer.start(start.clone()).unwrap();
        assert_eq!(writer.state(), RunState::Open);
        assert!(writer.start(start.clone()).is_err());
        assert!(writer.event(EventDoc::new("d", 1)).is_err());
        assert_eq!(writer.state(), RunState::Open);

        writer
            .descriptor(DescriptorDoc::new(&start.uid, "primary"))
            .unwrap();
        assert_eq!(writer.state(), RunState::Streaming);
        writer.stop(StopDoc::success(&start.uid)).unwrap();
        assert_eq!(writer.state(), RunState::Idle);
    }

    #[test]
    fn test_post_run_dataset_written() {
        let mut writer = materializer(
            &[(
                "mono",
                "nxclass: NXmonochromator\nenergy:\n  nxclass: NX_FLOAT\n  value: $post-run:en\n  dtype: float64\n",
            )],
            DeviceRegistry::new(),
        );
        let start = StartDoc::new();
        let descriptor = DescriptorDoc::new(&start.uid, "primary")
            .with_data_key("mono_en", DataKey::number("SIM:en").with_units("keV"));
        let event = EventDoc::new(&descriptor.uid, 1).with_datum("mono_en", 7.5);

        writer.handle(Document::Start(start.clone())).unwrap();
        writer.handle(Document::Descriptor(descriptor)).unwrap();
        writer.handle(Document::Event(event)).unwrap();
        let report = writer
            .handle(Document::Stop(StopDoc::success(&start.uid)))
            .unwrap()
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.leaves_written, 1);
        let sink = writer.sink();
        let path = "entry/instrument/mono/energy";
        assert_eq!(sink.dataset(path).unwrap().as_f64(), Some(7.5));
        assert_eq!(sink.attribute(path, "units").unwrap().as_text(), Some("keV"));
        assert_eq!(sink.attribute(path, "source").unwrap().as_text(), Some("SIM:en"));
        assert_eq!(
            sink.attribute("entry/instrument/mono", "NX_class").unwrap().as_text(),
            Some("NXmonochromator")
        );
    }

    #[test]
    fn test_pre_run_values_captured_at_start() {
        let devices = DeviceRegistry::new().with(
            StaticDevice::new("mono")
                .with_metadata(json!({"description": "PGM"}))
                .with_component("grating", json!(1200)),
        );
        let mut writer = materializer(
            &[(
                "mono",
                "nxclass: NXmonochromator\ndescription:\n  nxclass: NX_CHAR\n  value: $pre-run-md:description\ngrating:\n  nxclass: NX_INT\n  value: $pre-run-cpt:grating\n  dtype: int32\n",
            )],
            devices,
        );
        let start = StartDoc::new();
        writer.start(start.clone()).unwrap();
        let report = writer.stop(StopDoc::success(&start.uid)).unwrap();

        assert!(report.is_complete(), "{:?}", report.failures);
        let sink = writer.sink();
        assert_eq!(
            sink.dataset("entry/instrument/mono/description").unwrap().as_text(),
            Some("PGM")
        );
        let grating = sink.dataset("entry/instrument/mono/grating").unwrap();
        assert_eq!(grating.dtype, crate::dtype::Dtype::Int32);
        assert_eq!(grating.as_f64(), Some(1200.0));
    }

    #[test]
    fn test_unregistered_device_fails_pre_run_leaves() {
        let mut writer = materializer(
            &[(
                "slit",
                "nxclass: NXslit\ngap:\n  nxclass: NX_FLOAT\n  value: $pre-run-cpt:gap\n",
            )],
            DeviceRegistry::new(),
        );
        let start = StartDoc::new();
        writer.start(start.clone()).unwrap();
        let report = writer.stop(StopDoc::success(&start.uid)).unwrap();

        let failure = report.failure("slit/gap").unwrap();
        assert_eq!(
            failure.error,
            LeafError::Resolve(ResolveError::UnknownDevice("slit".into()))
        );
        assert!(writer.sink().node("entry/instrument/slit/gap").is_none());
    }

    #[test]
    fn test_sentinel_policy() {
        let mut set = SchemaSet::default();
        set.insert_yaml(
            "mono",
            "nxclass: NXmonochromator\nenergy:\n  nxclass: NX_FLOAT\n  value: $post-run:en\n",
        )
        .unwrap();
        let options = WriterOptions {
            failure_policy: FailurePolicy::Sentinel("unavailable".into()),
            ..WriterOptions::default()
        };
        let mut writer =
            RunMaterializer::new(Arc::new(set), DeviceRegistry::new(), MemorySink::new(), options);
        let start = StartDoc::new();
        writer.start(start.clone()).unwrap();
        let report = writer.stop(StopDoc::success(&start.uid)).unwrap();

        assert_eq!(report.failures.len(), 1);
        let path = "entry/instrument/mono/energy";
        assert_eq!(writer.sink().dataset(path).unwrap().as_text(), Some("unavailable"));
        assert!(writer
            .sink()
            .attribute(path, "resolution_error")
            .unwrap()
            .as_text()
            .unwrap()
            .contains("mono_en"));
    }

    #[test]
    #[traced_test]
    fn test_failed_leaves_are_logged() {
        let mut writer = materializer(
            &[(
                "mono",
                "nxclass: NXmonochromator\nenergy:\n  nxclass: NX_FLOAT\n  value: $post-run:en\n",
            )],
            DeviceRegistry::new(),
        );
        let start = StartDoc::new();
        writer.start(start.clone()).unwrap();
        writer.stop(StopDoc::success(&start.uid)).unwrap();

        assert!(logs_contain("Leaf 'mono/energy' not written"));
        assert!(logs_contain("with 1 failed leaf/leaves"));
    }
}
