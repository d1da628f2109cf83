//! Offline tools.

use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use snafu::ensure;
use tessera_core::runtime::ActorError;
use tessera_error::{ErrorContext as _, GenericError};
use tessera_io::{
    buf::BufferSlice,
    codec::{Codec, PROTOBUF_CODEC_NAME},
};
use tessera_protos::{MetricType, WriteRequest};
use tracing::{debug, info, Instrument as _};

use crate::subsystem::{MissingInput, SetupError, Subsystem, SubsystemContext};

const METRIC_NAME_LABEL: &[u8] = b"__name__";

/// Offline tools.
#[derive(Debug, Subcommand)]
pub enum ToolsCommand {
    /// Decodes a serialized write request from disk and logs a summary of it.
    InspectWriteRequest {
        /// Path to the serialized request.
        #[arg(long)]
        file: PathBuf,
    },
}

#[async_trait]
impl Subsystem for ToolsCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::InspectWriteRequest { .. } => "inspect-write-request",
        }
    }

    async fn setup(self, context: &mut SubsystemContext) -> Result<(), SetupError> {
        match self {
            Self::InspectWriteRequest { file } => {
                ensure!(file.is_file(), MissingInput { path: file.clone() });

                let codec = context.codec(PROTOBUF_CODEC_NAME)?;
                let verbose = context.debug_enabled();
                let span = context.span().clone();

                // Returns cleanly once the summary is logged, which stops every other actor.
                context.group_mut().add_actor(
                    "inspect-write-request",
                    inspect_write_request(file, codec, verbose).instrument(span),
                    || {},
                );
                Ok(())
            }
        }
    }
}

/// What a write request carries.
#[derive(Debug, Default, PartialEq)]
struct WriteRequestSummary {
    series: usize,
    samples: usize,
    exemplars: usize,
    metadata: usize,
    metric_names: BTreeSet<String>,
    unsorted_series: usize,
}

impl WriteRequestSummary {
    fn from_request(request: &WriteRequest) -> Self {
        let metric_names = request
            .timeseries
            .iter()
            .filter_map(|series| {
                series
                    .labels
                    .iter()
                    .find(|label| label.name == METRIC_NAME_LABEL)
                    .map(|label| String::from_utf8_lossy(&label.value).into_owned())
            })
            .collect();

        let unsorted_series = request
            .timeseries
            .iter()
            .filter(|series| {
                series
                    .samples
                    .windows(2)
                    .any(|pair| pair[0].timestamp_ms > pair[1].timestamp_ms)
            })
            .count();

        Self {
            series: request.timeseries.len(),
            samples: request.sample_count(),
            exemplars: request.exemplar_count(),
            metadata: request.metadata.len(),
            metric_names,
            unsorted_series,
        }
    }
}

async fn inspect_write_request(file: PathBuf, codec: Arc<dyn Codec>, verbose: bool) -> Result<(), ActorError> {
    let data = tokio::fs::read(&file)
        .await
        .with_error_context(|| format!("Failed to read '{}'.", file.display()))?;
    let request = decode(codec.as_ref(), data)?;
    let summary = WriteRequestSummary::from_request(&request);

    info!(
        file = %file.display(),
        series = summary.series,
        samples = summary.samples,
        exemplars = summary.exemplars,
        metadata = summary.metadata,
        unsorted_series = summary.unsorted_series,
        metric_names = ?summary.metric_names,
        "Inspected write request."
    );

    if verbose {
        for metadata in &request.metadata {
            let metric_type = MetricType::try_from(metadata.r#type).unwrap_or(MetricType::Unknown);
            debug!(
                family = %metadata.metric_family_name,
                metric_type = ?metric_type,
                unit = %metadata.unit,
                help = %metadata.help,
                "Metric metadata."
            );
        }
    }

    Ok(())
}

fn decode(codec: &dyn Codec, data: Vec<u8>) -> Result<WriteRequest, GenericError> {
    let mut request = WriteRequest::default();
    codec
        .unmarshal(&BufferSlice::from(data), &mut request)
        .error_context("Failed to decode write request.")?;
    Ok(request)
}
