//! Full runs through the materializer into an in-memory sink.

use daq_nexus::coerce::{TypedData, TypedValue};
use daq_nexus::device::{DeviceRegistry, StaticDevice};
use daq_nexus::dtype::Dtype;
use daq_nexus::error::{LeafError, NexusError, ResolveError, SinkError};
use daq_nexus::experiment::{DataKey, DescriptorDoc, Document, EventDoc, StartDoc, StopDoc};
use daq_nexus::materializer::{RunMaterializer, RunReport, RunState, WriterOptions};
use daq_nexus::resolve::{EventAccumulation, ResolutionSettings};
use daq_nexus::schema::SchemaSet;
use daq_nexus::sink::{MemorySink, NodeId, OutputSink};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

const MONO_SCHEMA: &str = r#"
nx_model: NXmonochromatorModel
nxclass: NXmonochromator
energy:
  nxclass: NX_FLOAT
  value: $post-run:en
  dtype: float64
"#;

fn writer(
    schemas: &[(&str, &str)],
    devices: DeviceRegistry,
    options: WriterOptions,
) -> RunMaterializer<MemorySink> {
    let mut set = SchemaSet::default();
    for (device, text) in schemas {
        set.insert_yaml(device, text).unwrap();
    }
    RunMaterializer::new(Arc::new(set), devices, MemorySink::new(), options)
}

/// Feed start, one descriptor per stream with its events, and stop.
fn run(
    writer: &mut RunMaterializer<MemorySink>,
    start: StartDoc,
    streams: Vec<(DescriptorDoc, Vec<EventDoc>)>,
) -> RunReport {
    let uid = start.uid.clone();
    writer.handle(Document::Start(start)).unwrap();
    for (descriptor, events) in streams {
        writer.handle(Document::Descriptor(descriptor)).unwrap();
        for event in events {
            writer.handle(Document::Event(event)).unwrap();
        }
    }
    writer
        .handle(Document::Stop(StopDoc::success(&uid)))
        .unwrap()
        .unwrap()
}

#[test]
fn energy_from_event_is_written_as_float64() {
    let mut writer = writer(&[("mono", MONO_SCHEMA)], DeviceRegistry::new(), WriterOptions::default());
    let start = StartDoc::new();
    let descriptor = DescriptorDoc::new(&start.uid, "primary")
        .with_data_key("mono_en", DataKey::number("SIM:mono:en"));
    let event = EventDoc::new(&descriptor.uid, 1).with_datum("mono_en", 7.5);

    let report = run(&mut writer, start, vec![(descriptor, vec![event])]);

    assert!(report.is_complete());
    let sink = writer.sink();
    let energy = sink.dataset("entry/instrument/mono/energy").unwrap();
    assert_eq!(energy.dtype, Dtype::Float64);
    assert!(energy.is_scalar());
    assert_eq!(energy.data, TypedData::Float(vec![7.5]));
    assert!(sink
        .attribute("entry/instrument/mono/energy", "transformation")
        .is_none());
    // Contract default of the monochromator.
    assert_eq!(
        sink.attribute("entry/instrument/mono", "default").unwrap().as_text(),
        Some("energy")
    );
}

#[test]
fn one_unresolvable_leaf_of_three() {
    let schema = r#"
nxclass: NXmonochromator
energy:
  nxclass: NX_FLOAT
  value: $post-run:en
  dtype: float64
slit:
  nxclass: NX_FLOAT
  value: $post-run:slit
  dtype: float64
title:
  nxclass: NX_CHAR
  value: Plane grating monochromator
  dtype: str
"#;
    let mut writer = writer(&[("mono", schema)], DeviceRegistry::new(), WriterOptions::default());
    let start = StartDoc::new();
    let descriptor = DescriptorDoc::new(&start.uid, "primary")
        .with_data_key("mono_en", DataKey::number("SIM:mono:en"));
    let event = EventDoc::new(&descriptor.uid, 1).with_datum("mono_en", 7.5);

    let report = run(&mut writer, start, vec![(descriptor, vec![event])]);

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "mono/slit");
    assert_eq!(
        report.failures[0].error,
        LeafError::Resolve(ResolveError::UnresolvedPlaceholder {
            key: "mono_slit".into()
        })
    );
    assert_eq!(report.leaves_written, 2);

    let sink = writer.sink();
    assert_eq!(sink.children("entry/instrument/mono"), vec!["energy", "title"]);
    assert_eq!(
        sink.dataset("entry/instrument/mono/energy").unwrap().as_f64(),
        Some(7.5)
    );
    assert_eq!(
        sink.dataset("entry/instrument/mono/title").unwrap().as_text(),
        Some("Plane grating monochromator")
    );
}

#[test]
fn baseline_answers_what_the_primary_stream_lacks() {
    let schema = r#"
nxclass: NXmonochromator
energy:
  nxclass: NX_FLOAT
  value: $post-run:en
  dtype: float64
grating:
  nxclass: NX_INT
  value: $post-run:grating
"#;
    let mut writer = writer(&[("mono", schema)], DeviceRegistry::new(), WriterOptions::default());
    let start = StartDoc::new();
    let primary = DescriptorDoc::new(&start.uid, "primary")
        .with_data_key("mono_en", DataKey::number("SIM:mono:en"));
    let baseline = DescriptorDoc::new(&start.uid, "baseline")
        .with_data_key("mono_grating", DataKey::integer("SIM:mono:grating"));
    let primary_events = vec![EventDoc::new(&primary.uid, 1).with_datum("mono_en", 7.5)];
    let baseline_events = vec![
        EventDoc::new(&baseline.uid, 1).with_datum("mono_grating", 1200),
        EventDoc::new(&baseline.uid, 2).with_datum("mono_grating", 1200),
    ];

    let report = run(
        &mut writer,
        start,
        vec![(baseline, baseline_events), (primary, primary_events)],
    );

    assert!(report.is_complete(), "{:?}", report.failures);
    let grating = writer
        .sink()
        .dataset("entry/instrument/mono/grating")
        .unwrap();
    assert_eq!(grating.dtype, Dtype::Int64);
    assert_eq!(grating.data, TypedData::Int(vec![1200]));
}

#[test]
fn series_accumulation_writes_timestamp_datasets() {
    let options = WriterOptions {
        resolution: ResolutionSettings {
            event_accumulation: EventAccumulation::Series,
            ..ResolutionSettings::default()
        },
        ..WriterOptions::default()
    };
    let mut writer = writer(&[("mono", MONO_SCHEMA)], DeviceRegistry::new(), options);
    let start = StartDoc::new();
    let descriptor = DescriptorDoc::new(&start.uid, "primary")
        .with_data_key("mono_en", DataKey::number("SIM:mono:en").with_units("keV"));
    let events = vec![
        EventDoc::new(&descriptor.uid, 1).with_datum("mono_en", 7.0),
        EventDoc::new(&descriptor.uid, 2).with_datum("mono_en", 7.5),
        EventDoc::new(&descriptor.uid, 3).with_datum("mono_en", 8.0),
    ];

    let report = run(&mut writer, start, vec![(descriptor, events)]);
    assert!(report.is_complete());

    let sink = writer.sink();
    let energy = sink.dataset("entry/instrument/mono/energy").unwrap();
    assert_eq!(energy.shape, vec![3]);
    assert_eq!(energy.data, TypedData::Float(vec![7.0, 7.5, 8.0]));
    assert_eq!(
        sink.attribute("entry/instrument/mono/energy", "shape").unwrap().data,
        TypedData::Int(vec![3])
    );
    assert_eq!(
        sink.attribute("entry/instrument/mono/energy", "units").unwrap().as_text(),
        Some("keV")
    );
    assert_eq!(
        sink.dataset("entry/instrument/mono/energy_timestamps").unwrap().shape,
        vec![3]
    );
    assert_eq!(
        sink.dataset("entry/instrument/mono/events_timestamps").unwrap().shape,
        vec![3]
    );
}

#[test]
fn transformation_is_applied_and_recorded() {
    let schema = r#"
nxclass: NXmonochromator
energy:
  nxclass: NX_FLOAT
  value: $post-run:en
  dtype: float64
  transformation:
    expression: 3 * x**2 + 1
    target: value
"#;
    let mut writer = writer(&[("mono", schema)], DeviceRegistry::new(), WriterOptions::default());
    let start = StartDoc::new();
    let descriptor = DescriptorDoc::new(&start.uid, "primary")
        .with_data_key("mono_en", DataKey::number("SIM:mono:en"));
    let event = EventDoc::new(&descriptor.uid, 1).with_datum("mono_en", 2.0);

    run(&mut writer, start, vec![(descriptor, vec![event])]);

    let sink = writer.sink();
    assert_eq!(
        sink.dataset("entry/instrument/mono/energy").unwrap().as_f64(),
        Some(13.0)
    );
    assert_eq!(
        sink.attribute("entry/instrument/mono/energy", "transformation")
            .unwrap()
            .as_text(),
        Some(r#"{"expression": "3 * x**2 + 1", "target": "value"}"#)
    );
}

#[test]
fn pre_run_values_and_group_attributes() {
    let schema = r#"
nx_model: NXtransformationsModel
nxclass: NXtransformations
alpha:
  nxclass: NX_FLOAT
  value: $pre-run-cpt:alpha
  dtype: float64
  attributes:
    transformation_type:
      value: rotation
      dtype: str
    vector:
      value: [1, 0, 0]
      dtype: float64
    depends_on:
      value: $pre-run-md:depends_on
  attrs:
    units: deg
    info: {axis: "x"}
"#;
    let devices = DeviceRegistry::new().with(
        StaticDevice::new("stage")
            .with_metadata(json!({"depends_on": "."}))
            .with_component("alpha", json!(12.5)),
    );
    let mut writer = writer(&[("stage", schema)], devices, WriterOptions::default());
    let report = run(&mut writer, StartDoc::new(), Vec::new());
    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(report.leaves_written, 4);

    let sink = writer.sink();
    let path = "entry/instrument/stage/alpha";
    assert_eq!(sink.dataset(path).unwrap().as_f64(), Some(12.5));
    assert_eq!(
        sink.attribute(path, "transformation_type").unwrap().as_text(),
        Some("rotation")
    );
    assert_eq!(
        sink.attribute(path, "vector").unwrap().data,
        TypedData::Float(vec![1.0, 0.0, 0.0])
    );
    assert_eq!(sink.attribute(path, "depends_on").unwrap().as_text(), Some("."));
    assert_eq!(sink.attribute(path, "units").unwrap().as_text(), Some("deg"));
    assert_eq!(
        sink.attribute(path, "info").unwrap().as_text(),
        Some(r#"{"axis": "x"}"#)
    );
}

#[test]
fn file_layout_and_run_info() {
    let devices = DeviceRegistry::new().with(StaticDevice::new("motor"));
    let mut writer = writer(&[("mono", MONO_SCHEMA)], devices, WriterOptions::default());
    let start = StartDoc::new()
        .with_metadata("plan_name", "count")
        .with_metadata("detectors", json!(["det1", "det2"]))
        .with_metadata("nx_file_name", "scan_{uid}");
    let uid = start.uid.clone();

    let report = run(&mut writer, start, Vec::new());

    assert!(report.output_path.ends_with(format!("scan_{}.nxs", uid)));
    let sink = writer.sink();
    assert_eq!(sink.attribute("", "default").unwrap().as_text(), Some("entry"));
    assert_eq!(sink.children(""), vec!["entry"]);
    assert_eq!(sink.children("entry"), vec!["instrument", "run_info"]);
    // Registered device without a schema gets the fallback group.
    assert_eq!(sink.children("entry/instrument"), vec!["mono", "motor"]);
    assert_eq!(
        sink.attribute("entry/instrument/motor", "NX_class").unwrap().as_text(),
        Some("NXmotor")
    );
    assert_eq!(
        sink.dataset("entry/run_info/start/plan_name").unwrap().as_text(),
        Some("count")
    );
    assert_eq!(
        sink.dataset("entry/run_info/start/detectors").unwrap().data,
        TypedData::Text(vec!["det1".into(), "det2".into()])
    );
    assert_eq!(
        sink.dataset("entry/run_info/stop/exit_status").unwrap().as_text(),
        Some("success")
    );
    // The energy leaf had no data in this run.
    assert_eq!(report.failures.len(), 1);
}

#[test]
fn schema_embedded_in_start_document() {
    let mut writer = writer(&[], DeviceRegistry::new(), WriterOptions::default());
    let start = StartDoc::new().with_metadata(
        "nexus_md",
        json!({
            "mono": {
                "nxclass": "NXmonochromator",
                "energy": {"nxclass": "NX_FLOAT", "value": "$post-run:en", "dtype": "float32"}
            }
        }),
    );
    let descriptor = DescriptorDoc::new(&start.uid, "primary")
        .with_data_key("mono_en", DataKey::number("SIM:mono:en"));
    let event = EventDoc::new(&descriptor.uid, 1).with_datum("mono_en", 7.5);

    let report = run(&mut writer, start, vec![(descriptor, vec![event])]);

    assert!(report.is_complete());
    let sink = writer.sink();
    assert_eq!(
        sink.dataset("entry/instrument/mono/energy").unwrap().dtype,
        Dtype::Float32
    );
    assert!(sink.node("entry/run_info/start/nexus_md").is_none());
}

#[test]
fn documents_out_of_order_are_rejected() {
    let mut writer = writer(&[("mono", MONO_SCHEMA)], DeviceRegistry::new(), WriterOptions::default());
    let start = StartDoc::new();
    let descriptor = DescriptorDoc::new(&start.uid, "primary");

    let err = writer
        .handle(Document::Descriptor(descriptor.clone()))
        .unwrap_err();
    assert!(matches!(err, NexusError::InvalidState { document: "descriptor", .. }));
    assert_eq!(writer.state(), RunState::Idle);
    assert!(writer.context().is_none());

    writer.handle(Document::Start(start.clone())).unwrap();
    writer.handle(Document::Descriptor(descriptor)).unwrap();
    let err = writer.handle(Document::Start(StartDoc::new())).unwrap_err();
    assert!(matches!(err, NexusError::InvalidState { document: "start", state: "streaming" }));
    assert_eq!(writer.state(), RunState::Streaming);
    assert_eq!(writer.context().unwrap().uid(), start.uid);
}

#[test]
fn writer_is_reusable_across_runs() {
    let mut writer = writer(&[("mono", MONO_SCHEMA)], DeviceRegistry::new(), WriterOptions::default());
    for value in [7.5, 8.5] {
        let start = StartDoc::new();
        let descriptor = DescriptorDoc::new(&start.uid, "primary")
            .with_data_key("mono_en", DataKey::number("SIM:mono:en"));
        let event = EventDoc::new(&descriptor.uid, 1).with_datum("mono_en", value);
        let report = run(&mut writer, start, vec![(descriptor, vec![event])]);
        assert!(report.is_complete());
        assert_eq!(
            writer.sink().dataset("entry/instrument/mono/energy").unwrap().as_f64(),
            Some(value)
        );
    }
}

#[test]
fn array_source_honours_dtype_attr() {
    let schema = r#"
nxclass: NXdetector
counts:
  nxclass: NX_INT
  value: $post-run:counts
  attrs:
    dtype: int32
spectrum:
  nxclass: NX_FLOAT
  value: $post-run:spectrum
"#;
    let mut writer = writer(&[("det", schema)], DeviceRegistry::new(), WriterOptions::default());
    let start = StartDoc::new();
    let descriptor = DescriptorDoc::new(&start.uid, "primary")
        .with_data_key("det_counts", DataKey::array("SIM:det:counts", vec![3]))
        .with_data_key("det_spectrum", DataKey::array("SIM:det:spectrum", vec![2]));
    let event = EventDoc::new(&descriptor.uid, 1)
        .with_datum("det_counts", json!([4, 5, 6]))
        .with_datum("det_spectrum", json!([1, 2]));

    let report = run(&mut writer, start, vec![(descriptor, vec![event])]);
    assert!(report.is_complete(), "{:?}", report.failures);

    let sink = writer.sink();
    let counts = sink.dataset("entry/instrument/det/counts").unwrap();
    assert_eq!(counts.dtype, Dtype::Int32);
    assert_eq!(counts.data, TypedData::Int(vec![4, 5, 6]));
    let spectrum = sink.dataset("entry/instrument/det/spectrum").unwrap();
    assert_eq!(spectrum.dtype, Dtype::Float64);
    assert_eq!(spectrum.data, TypedData::Float(vec![1.0, 2.0]));
}

/// Accepts groups and attributes but refuses every dataset.
#[derive(Default)]
struct RefusingSink {
    nodes: usize,
    opened: usize,
    closed: usize,
}

impl OutputSink for RefusingSink {
    fn open(&mut self, _path: &Path) -> Result<NodeId, SinkError> {
        self.opened += 1;
        self.nodes = 1;
        Ok(NodeId::ROOT)
    }

    fn create_group(&mut self, _parent: NodeId, _name: &str) -> Result<NodeId, SinkError> {
        self.nodes += 1;
        Ok(NodeId(self.nodes - 1))
    }

    fn create_dataset(
        &mut self,
        _parent: NodeId,
        name: &str,
        _value: &TypedValue,
    ) -> Result<NodeId, SinkError> {
        Err(SinkError::Duplicate(name.to_string()))
    }

    fn set_attribute(
        &mut self,
        _node: NodeId,
        _name: &str,
        _value: &TypedValue,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.closed += 1;
        Ok(())
    }
}

#[test]
fn sink_error_aborts_the_run_and_closes_the_sink() {
    let schema = r#"
nxclass: NXmonochromator
title:
  nxclass: NX_CHAR
  value: Plane grating monochromator
  dtype: str
"#;
    let mut set = SchemaSet::default();
    set.insert_yaml("mono", schema).unwrap();
    let mut writer = RunMaterializer::new(
        Arc::new(set),
        DeviceRegistry::new(),
        RefusingSink::default(),
        WriterOptions::default(),
    );
    let start = StartDoc::new();
    let uid = start.uid.clone();
    writer.handle(Document::Start(start)).unwrap();

    let err = writer
        .handle(Document::Stop(StopDoc::success(&uid)))
        .unwrap_err();
    assert!(matches!(err, NexusError::Sink(SinkError::Duplicate(ref name)) if name == "title"));
    assert_eq!(writer.state(), RunState::Idle);
    assert_eq!(writer.sink().opened, 1);
    assert_eq!(writer.sink().closed, 1);

    // The writer accepts the next run.
    writer.handle(Document::Start(StartDoc::new())).unwrap();
    assert_eq!(writer.state(), RunState::Open);
}
