use std::sync::Arc;

use indexmap::IndexMap;
use snafu::Snafu;
use tracing::debug;

use super::Codec;

/// Codec registration errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistrationError {
    /// An override was installed for a name that has no baseline codec.
    #[snafu(display("No baseline codec named '{}' is registered; it must be registered before any override.", name))]
    MissingBaseline {
        /// Name of the codec.
        name: String,
    },
}

/// Codecs addressed by name.
///
/// A registry is built once during startup and then shared immutably with the transport.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: IndexMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding `codec` as the baseline for its name.
    pub fn with_baseline(codec: Arc<dyn Codec>) -> Self {
        let mut registry = Self::new();
        registry.register_baseline(codec);
        registry
    }

    /// Registers `codec` as the baseline for its name, replacing any codec previously registered under that name.
    pub fn register_baseline(&mut self, codec: Arc<dyn Codec>) {
        let name = codec.name().to_string();
        debug!(codec = %name, "Registered baseline codec.");
        self.codecs.insert(name, codec);
    }

    /// Replaces the codec registered under `name` with the one produced by `wrap`.
    ///
    /// `wrap` receives the currently registered codec, which lets the override capture it as a fallback.
    ///
    /// # Errors
    ///
    /// If no codec is registered under `name`, an error is returned and the registry is left unchanged.
    pub fn install_override<F>(&mut self, name: &str, wrap: F) -> Result<(), RegistrationError>
    where
        F: FnOnce(Arc<dyn Codec>) -> Arc<dyn Codec>,
    {
        let Some(slot) = self.codecs.get_mut(name) else {
            return Err(RegistrationError::MissingBaseline { name: name.to_string() });
        };

        let baseline = Arc::clone(slot);
        *slot = wrap(baseline);
        debug!(codec = name, "Installed codec override.");
        Ok(())
    }

    /// Returns the codec registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }

    /// Returns the names of all registered codecs, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use tessera_protos::{LabelPair, Sample, TimeSeries, WriteRequest};

    use super::*;
    use crate::{
        buf::TieredBufferPool,
        codec::{PooledCodec, ProtobufCodec, PROTOBUF_CODEC_NAME},
    };

    fn install_pooled(registry: &mut CodecRegistry) -> Result<(), RegistrationError> {
        registry.install_override(PROTOBUF_CODEC_NAME, |baseline| {
            Arc::new(PooledCodec::wrap(baseline, TieredBufferPool::shared()))
        })
    }

    #[test]
    fn override_requires_baseline() {
        let mut registry = CodecRegistry::new();
        let err = install_pooled(&mut registry).unwrap_err();
        assert!(matches!(err, RegistrationError::MissingBaseline { ref name } if name == "proto"));
        assert!(registry.get(PROTOBUF_CODEC_NAME).is_none());
    }

    #[test]
    fn override_keeps_name_and_wire_format() {
        let mut registry = CodecRegistry::with_baseline(Arc::new(ProtobufCodec));
        let baseline = registry.get(PROTOBUF_CODEC_NAME).unwrap();
        install_pooled(&mut registry).unwrap();

        let codec = registry.get(PROTOBUF_CODEC_NAME).unwrap();
        assert_eq!(codec.name(), PROTOBUF_CODEC_NAME);
        assert!(!Arc::ptr_eq(&codec, &baseline));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec![PROTOBUF_CODEC_NAME]);

        let request = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![LabelPair::new("__name__", "cpu")],
                samples: vec![Sample::new(1.0, 1000), Sample::new(2.0, 2000)],
                exemplars: vec![],
            }],
            ..Default::default()
        };

        let encoded = codec.marshal(&request).unwrap();
        assert_eq!(encoded.materialize(), baseline.marshal(&request).unwrap().materialize());

        let mut decoded = WriteRequest::default();
        baseline.unmarshal(&encoded, &mut decoded).unwrap();
        assert_eq!(decoded, request);
    }
}
