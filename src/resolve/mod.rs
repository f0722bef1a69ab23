//! Placeholder resolution against devices and run documents.
//!
//! Pre-run placeholders are answered by the device itself when the run
//! starts. Post-run placeholders are answered from the buffered documents
//! when the run stops: first from the regular streams, then from the
//! baseline stream. A placeholder that no stream can answer is an error;
//! there is never a silent default.

pub mod context;

pub use context::{EventSeries, RunContext, Stream};

use crate::device::{lookup, Device};
use crate::dtype::Dtype;
use crate::error::ResolveError;
use crate::experiment::DataKey;
use crate::placeholder::Placeholder;
use crate::value::{infer_dtype, ResolvedValue, Timestamps};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Order in which regular (non-baseline) streams are consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPrecedence {
    /// The stream registered first wins.
    #[default]
    FirstRegistered,
    LastRegistered,
}

/// How repeated event values of one key are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAccumulation {
    /// The value of the last event wins.
    #[default]
    Latest,
    /// Every event value, in order, with its timestamps.
    Series,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionSettings {
    /// Joins a device name and its component name in document keys.
    pub component_delimiter: String,
    pub baseline_stream: String,
    pub stream_precedence: StreamPrecedence,
    pub event_accumulation: EventAccumulation,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            component_delimiter: "_".to_string(),
            baseline_stream: "baseline".to_string(),
            stream_precedence: StreamPrecedence::default(),
            event_accumulation: EventAccumulation::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    settings: ResolutionSettings,
}

impl Resolver {
    pub fn new(settings: ResolutionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ResolutionSettings {
        &self.settings
    }

    /// Resolve a `$pre-run-md:` or `$pre-run-cpt:` placeholder.
    ///
    /// Post-run placeholders are passed to [`Resolver::resolve_post_run`] by callers;
    /// handing one in here reports it as unresolved.
    pub fn resolve_pre_run(
        &self,
        placeholder: &Placeholder,
        device: &dyn Device,
    ) -> Result<ResolvedValue, ResolveError> {
        match placeholder {
            Placeholder::PreRunMetadata { path } => {
                let missing = || ResolveError::MissingMetadataKey {
                    device: device.name().to_string(),
                    path: path.join(":"),
                };
                if path.is_empty() {
                    return Err(missing());
                }
                let value = lookup(device.metadata(), path).ok_or_else(missing)?;
                Ok(ResolvedValue::new(value.clone()))
            }
            Placeholder::PreRunComponent { path } => device
                .read_component(path)
                .map(ResolvedValue::new)
                .map_err(|e| ResolveError::ComponentReadError {
                    device: device.name().to_string(),
                    component: if path.is_empty() {
                        device.name().to_string()
                    } else {
                        path.join(":")
                    },
                    reason: e.to_string(),
                }),
            Placeholder::PostRunComponent { .. } => Err(ResolveError::UnresolvedPlaceholder {
                key: placeholder.to_string(),
            }),
        }
    }

    /// Resolve a `$post-run` placeholder of `device` from the run's documents.
    pub fn resolve_post_run(
        &self,
        placeholder: &Placeholder,
        device: &str,
        ctx: &RunContext,
    ) -> Result<ResolvedValue, ResolveError> {
        let key = placeholder.document_key(device, &self.settings.component_delimiter);

        for stream in self.search_order(ctx) {
            if let Some(value) = self.from_events(stream, &key) {
                debug!("Resolved '{}' from events of stream '{}'", key, stream.name());
                return Ok(value);
            }
            if let Some(value) = from_configuration(stream, device, &key) {
                debug!(
                    "Resolved '{}' from configuration of stream '{}'",
                    key,
                    stream.name()
                );
                return Ok(value);
            }
        }

        Err(ResolveError::UnresolvedPlaceholder { key })
    }

    /// Regular streams in precedence order, then the baseline stream(s).
    fn search_order<'a>(&self, ctx: &'a RunContext) -> Vec<&'a Stream> {
        let baseline_name = self.settings.baseline_stream.as_str();
        let (mut regular, baseline): (Vec<&Stream>, Vec<&Stream>) = ctx
            .streams()
            .iter()
            .partition(|stream| stream.name() != baseline_name);
        if self.settings.stream_precedence == StreamPrecedence::LastRegistered {
            regular.reverse();
        }
        regular.extend(baseline);
        regular
    }

    fn from_events(&self, stream: &Stream, key: &str) -> Option<ResolvedValue> {
        let series = stream.events.get(key)?;
        let data_key = stream.descriptor.data_keys.get(key);
        let raw = match self.settings.event_accumulation {
            EventAccumulation::Latest => series.latest()?.clone(),
            EventAccumulation::Series => Value::Array(series.values.clone()),
        };

        let mut value = typed(raw, data_key);
        if self.settings.event_accumulation == EventAccumulation::Series {
            value = value.timed(Timestamps::Events {
                component: series.timestamps.clone(),
                events: series.event_times.clone(),
            });
        }
        Some(value)
    }
}

fn from_configuration(stream: &Stream, device: &str, key: &str) -> Option<ResolvedValue> {
    let configuration = &stream.descriptor.configuration;
    let (config, raw) = configuration
        .get(device)
        .and_then(|config| config.data.get(key).map(|raw| (config, raw)))
        .or_else(|| {
            configuration
                .values()
                .find_map(|config| config.data.get(key).map(|raw| (config, raw)))
        })?;

    let mut value = typed(raw.clone(), config.data_keys.get(key));
    if let Some(timestamp) = config.timestamps.get(key) {
        value = value.timed(Timestamps::Descriptor(*timestamp));
    }
    Some(value)
}

/// Attach the declared source type and description, falling back to inference.
fn typed(raw: Value, data_key: Option<&DataKey>) -> ResolvedValue {
    let declared = data_key.and_then(|key| Dtype::from_source(&key.dtype));
    let dtype = declared.or_else(|| infer_dtype(&raw));
    let value = ResolvedValue::with_dtype(raw, dtype);
    match data_key {
        Some(key) => value.described_by(key.clone()),
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDevice;
    use crate::experiment::{DescriptorDoc, EventDoc, StartDoc};
    use serde_json::json;

    fn placeholder(raw: &str) -> Placeholder {
        Placeholder::parse(raw).unwrap()
    }

    fn run_with_streams(streams: &[(&str, &str, Value)]) -> RunContext {
        let start = StartDoc::new();
        let mut ctx = RunContext::new(start.clone());
        for (seq, (stream, key, value)) in streams.iter().enumerate() {
            let descriptor = DescriptorDoc::new(&start.uid, stream)
                .with_data_key(key, DataKey::number("SIM"));
            let uid = descriptor.uid.clone();
            ctx.register_descriptor(descriptor);
            ctx.add_event(EventDoc::new(&uid, seq as u64 + 1).with_datum(key, value.clone()));
        }
        ctx
    }

    #[test]
    fn test_pre_run_metadata() {
        let device = StaticDevice::new("mono")
            .with_metadata(json!({"description": "PGM", "worldPosition": {"x": 1.5}}));
        let resolver = Resolver::default();

        let value = resolver
            .resolve_pre_run(&placeholder("$pre-run-md:worldPosition:x"), &device)
            .unwrap();
        assert_eq!(value.raw, json!(1.5));
        assert_eq!(value.dtype, Some(Dtype::Float64));

        let err = resolver
            .resolve_pre_run(&placeholder("$pre-run-md:worldPosition:z"), &device)
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingMetadataKey {
                device: "mono".into(),
                path: "worldPosition:z".into()
            }
        );

        let err = resolver
            .resolve_pre_run(&Placeholder::PreRunMetadata { path: Vec::new() }, &device)
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingMetadataKey { path, .. } if path.is_empty()));
    }

    #[test]
    fn test_pre_run_component() {
        let device = StaticDevice::new("mono")
            .with_component("grating", json!(1200))
            .with_failure("slit", "not connected");
        let resolver = Resolver::default();

        let value = resolver
            .resolve_pre_run(&placeholder("$pre-run-cpt:grating"), &device)
            .unwrap();
        assert_eq!(value.raw, json!(1200));
        assert_eq!(value.dtype, Some(Dtype::Int64));

        let err = resolver
            .resolve_pre_run(&placeholder("$pre-run-cpt:slit"), &device)
            .unwrap_err();
        assert!(matches!(err, ResolveError::ComponentReadError { ref component, .. } if component == "slit"));
    }

    #[test]
    fn test_post_run_from_events() {
        let ctx = run_with_streams(&[("primary", "mono_en", json!(7.5))]);
        let value = Resolver::default()
            .resolve_post_run(&placeholder("$post-run:en"), "mono", &ctx)
            .unwrap();
        assert_eq!(value.raw, json!(7.5));
        assert_eq!(value.dtype, Some(Dtype::Float64));
        assert_eq!(value.description.unwrap().source, "SIM");
    }

    #[test]
    fn test_post_run_baseline_fallback() {
        let ctx = run_with_streams(&[
            ("baseline", "mono_en", json!(1.0)),
            ("primary", "det", json!(5)),
        ]);
        let value = Resolver::default()
            .resolve_post_run(&placeholder("$post-run:en"), "mono", &ctx)
            .unwrap();
        assert_eq!(value.raw, json!(1.0));
    }

    #[test]
    fn test_regular_stream_beats_baseline() {
        let ctx = run_with_streams(&[
            ("baseline", "mono_en", json!(1.0)),
            ("primary", "mono_en", json!(2.0)),
        ]);
        let value = Resolver::default()
            .resolve_post_run(&placeholder("$post-run:en"), "mono", &ctx)
            .unwrap();
        assert_eq!(value.raw, json!(2.0));
    }

    #[test]
    fn test_stream_precedence() {
        let ctx = run_with_streams(&[
            ("primary", "mono_en", json!(1.0)),
            ("secondary", "mono_en", json!(2.0)),
        ]);
        let first = Resolver::default()
            .resolve_post_run(&placeholder("$post-run:en"), "mono", &ctx)
            .unwrap();
        assert_eq!(first.raw, json!(1.0));

        let last = Resolver::new(ResolutionSettings {
            stream_precedence: StreamPrecedence::LastRegistered,
            ..Default::default()
        })
        .resolve_post_run(&placeholder("$post-run:en"), "mono", &ctx)
        .unwrap();
        assert_eq!(last.raw, json!(2.0));
    }

    #[test]
    fn test_post_run_from_configuration() {
        let start = StartDoc::new();
        let mut ctx = RunContext::new(start.clone());
        let descriptor = DescriptorDoc::new(&start.uid, "primary").with_config(
            "mono",
            "mono_grating",
            DataKey::integer("PV:GRATING"),
            1200,
        );
        let time = descriptor.time;
        ctx.register_descriptor(descriptor);

        let value = Resolver::default()
            .resolve_post_run(&placeholder("$post-run:grating"), "mono", &ctx)
            .unwrap();
        assert_eq!(value.raw, json!(1200));
        assert_eq!(value.dtype, Some(Dtype::Int64));
        assert_eq!(value.timestamps, Some(Timestamps::Descriptor(time)));
    }

    #[test]
    fn test_unresolved_post_run() {
        let ctx = run_with_streams(&[("primary", "det", json!(5))]);
        let err = Resolver::default()
            .resolve_post_run(&placeholder("$post-run"), "mono", &ctx)
            .unwrap_err();
        assert_eq!(err, ResolveError::UnresolvedPlaceholder { key: "mono".into() });
    }

    #[test]
    fn test_series_accumulation() {
        let start = StartDoc::new();
        let mut ctx = RunContext::new(start.clone());
        let descriptor = DescriptorDoc::new(&start.uid, "primary")
            .with_data_key("mono_en", DataKey::number("SIM"));
        let uid = descriptor.uid.clone();
        ctx.register_descriptor(descriptor);
        for (seq, value) in [(1, 7.0), (2, 7.5), (3, 8.0)] {
            ctx.add_event(EventDoc::new(&uid, seq).with_datum("mono_en", value));
        }

        let resolver = Resolver::new(ResolutionSettings {
            event_accumulation: EventAccumulation::Series,
            ..Default::default()
        });
        let value = resolver
            .resolve_post_run(&placeholder("$post-run:en"), "mono", &ctx)
            .unwrap();
        assert_eq!(value.raw, json!([7.0, 7.5, 8.0]));
        assert_eq!(value.shape, vec![3]);
        assert!(matches!(value.timestamps, Some(Timestamps::Events { ref events, .. }) if events.len() == 3));

        let latest = Resolver::default()
            .resolve_post_run(&placeholder("$post-run:en"), "mono", &ctx)
            .unwrap();
        assert_eq!(latest.raw, json!(8.0));
    }
}
