//! Remote-write wire definitions.
//!
//! The messages here stay binary-compatible with the Prometheus remote-write schema. Fields the baseline schema does
//! not know about sit at deliberately high field numbers (`skip_label_name_validation` at 1000) so that a
//! baseline-only decoder simply skips them. Existing field numbers must never be renumbered.
//!
//! Every message derives [`prost::Message`], which is the generic encoding path. The ingestion messages additionally
//! carry a hand-written fast path (see [`fast`]) that computes exact sizes, encodes into a caller-provided buffer of
//! exactly that size, and decodes straight from a byte span.
#![deny(warnings)]
#![deny(missing_docs)]
#![allow(clippy::enum_variant_names)]

pub mod fast;
mod wire;
pub use self::wire::{WireError, WireType, RECURSION_LIMIT};

/// A batch of time series, samples, exemplars, and metadata sent for ingestion.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    /// Series carried by this request.
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,

    /// Where the request originated.
    #[prost(enumeration = "SourceEnum", tag = "2")]
    pub source: i32,

    /// Metric family metadata.
    #[prost(message, repeated, tag = "3")]
    pub metadata: Vec<MetricMetadata>,

    /// Disables label name validation on the receiving side.
    #[prost(bool, tag = "1000")]
    pub skip_label_name_validation: bool,
}

/// Acknowledgement of a [`WriteRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteResponse {}

/// Origin of a [`WriteRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SourceEnum {
    /// Pushed through the remote-write API.
    Api = 0,

    /// Generated by rule evaluation.
    Rule = 1,
}

/// A single series: its labels, samples, and exemplars.
///
/// Samples are expected in ascending timestamp order. This is a producer contract and is not checked on decode.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeSeries {
    /// Series labels. Names are unique within the set.
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<LabelPair>,

    /// Samples, oldest first.
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,

    /// Exemplars attached to the series.
    #[prost(message, repeated, tag = "3")]
    pub exemplars: Vec<Exemplar>,
}

/// A label name/value pair, as raw bytes.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct LabelPair {
    /// Label name.
    #[prost(bytes = "vec", tag = "1")]
    pub name: Vec<u8>,

    /// Label value.
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// A single sample.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Sample {
    /// Sample value.
    #[prost(double, tag = "1")]
    pub value: f64,

    /// Timestamp, in milliseconds since the Unix epoch.
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
}

/// An exemplar: a sample with its own labels, usually pointing at a trace.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Exemplar {
    /// Exemplar labels, distinct from the series labels.
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<LabelPair>,

    /// Exemplar value.
    #[prost(double, tag = "2")]
    pub value: f64,

    /// Timestamp, in milliseconds since the Unix epoch.
    #[prost(int64, tag = "3")]
    pub timestamp_ms: i64,
}

/// Metadata describing a metric family.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricMetadata {
    /// Metric type.
    #[prost(enumeration = "MetricType", tag = "1")]
    pub r#type: i32,

    /// Metric family name.
    #[prost(string, tag = "2")]
    pub metric_family_name: String,

    /// Help text.
    #[prost(string, tag = "4")]
    pub help: String,

    /// Unit.
    #[prost(string, tag = "5")]
    pub unit: String,
}

/// Type of a metric family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
    /// Unknown.
    Unknown = 0,

    /// Counter.
    Counter = 1,

    /// Gauge.
    Gauge = 2,

    /// Histogram.
    Histogram = 3,

    /// Gauge histogram.
    GaugeHistogram = 4,

    /// Summary.
    Summary = 5,

    /// Info.
    Info = 6,

    /// State set.
    StateSet = 7,
}

impl LabelPair {
    /// Creates a label pair from anything that can be viewed as bytes.
    pub fn new(name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        }
    }
}

impl Sample {
    /// Creates a sample.
    pub const fn new(value: f64, timestamp_ms: i64) -> Self {
        Self { value, timestamp_ms }
    }
}

impl WriteRequest {
    /// Returns the total number of samples across all series.
    pub fn sample_count(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.samples.len()).sum()
    }

    /// Returns the total number of exemplars across all series.
    pub fn exemplar_count(&self) -> usize {
        self.timeseries.iter().map(|ts| ts.exemplars.len()).sum()
    }
}
