//! Per-run buffer of documents and pre-run results.

use crate::error::ResolveError;
use crate::experiment::{DescriptorDoc, EventDoc, StartDoc, StopDoc};
use crate::placeholder::Placeholder;
use crate::value::ResolvedValue;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Values of one data key collected over the events of a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSeries {
    pub values: Vec<Value>,
    /// Per-key timestamps reported by the device.
    pub timestamps: Vec<f64>,
    /// Times of the events that carried the values.
    pub event_times: Vec<f64>,
}

impl EventSeries {
    pub fn latest(&self) -> Option<&Value> {
        self.values.last()
    }
}

/// A registered stream: its descriptor and what its events delivered.
#[derive(Debug, Clone)]
pub struct Stream {
    pub descriptor: DescriptorDoc,
    pub events: BTreeMap<String, EventSeries>,
    pub event_count: usize,
}

impl Stream {
    fn new(descriptor: DescriptorDoc) -> Self {
        Self {
            descriptor,
            events: BTreeMap::new(),
            event_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

type PreRunKey = (String, Placeholder);

/// Everything the writer knows about the run in progress.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub start: StartDoc,
    pub stop: Option<StopDoc>,
    streams: Vec<Stream>,
    by_descriptor: HashMap<String, usize>,
    pre_run: HashMap<PreRunKey, Result<ResolvedValue, ResolveError>>,
}

impl RunContext {
    pub fn new(start: StartDoc) -> Self {
        Self {
            start,
            stop: None,
            streams: Vec::new(),
            by_descriptor: HashMap::new(),
            pre_run: HashMap::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.start.uid
    }

    /// Register a stream. Returns `false` if the descriptor was already known.
    pub fn register_descriptor(&mut self, descriptor: DescriptorDoc) -> bool {
        if self.by_descriptor.contains_key(&descriptor.uid) {
            return false;
        }
        self.by_descriptor
            .insert(descriptor.uid.clone(), self.streams.len());
        self.streams.push(Stream::new(descriptor));
        true
    }

    /// Merge an event into its stream. Returns `false` if the descriptor is unknown.
    pub fn add_event(&mut self, event: EventDoc) -> bool {
        let Some(&index) = self.by_descriptor.get(&event.descriptor) else {
            return false;
        };
        let stream = &mut self.streams[index];
        stream.event_count += 1;
        for (key, value) in event.data {
            let series = stream.events.entry(key.clone()).or_default();
            series
                .timestamps
                .push(event.timestamps.get(&key).copied().unwrap_or(event.time));
            series.event_times.push(event.time);
            series.values.push(value);
        }
        true
    }

    /// Streams in registration order.
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn stream(&self, name: &str) -> Option<&Stream> {
        self.streams.iter().find(|stream| stream.name() == name)
    }

    pub fn cache_pre_run(
        &mut self,
        device: &str,
        placeholder: Placeholder,
        result: Result<ResolvedValue, ResolveError>,
    ) {
        self.pre_run.insert((device.to_string(), placeholder), result);
    }

    pub fn is_pre_run_cached(&self, device: &str, placeholder: &Placeholder) -> bool {
        self.pre_run
            .contains_key(&(device.to_string(), placeholder.clone()))
    }

    pub fn pre_run(
        &self,
        device: &str,
        placeholder: &Placeholder,
    ) -> Option<&Result<ResolvedValue, ResolveError>> {
        self.pre_run.get(&(device.to_string(), placeholder.clone()))
    }
}
