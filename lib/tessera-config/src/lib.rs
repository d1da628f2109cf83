//! Layered configuration loading and typed lookup.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{borrow::Cow, path::Path, sync::Arc};

use figment::{error::Kind, providers::Env, Figment};
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tessera_error::GenericError;
use tracing::debug;

mod provider;
use self::provider::YamlFile;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// Environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// Requested field was missing from the configuration.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Help text describing how the field can be set.
        ///
        /// Includes the environment variable spelling of the key when environment variables were loaded.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// Requested field did not have the expected data type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the invalid field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Generic configuration error.
    #[snafu(display("Failed to query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

/// Builds a configuration from an ordered list of sources.
///
/// Sources added later take precedence over sources added earlier. The supported sources are YAML files and prefixed
/// environment variables.
pub struct ConfigurationLoader {
    figment: Figment,
    env_prefixes: Vec<String>,
}

impl Default for ConfigurationLoader {
    fn default() -> Self {
        Self {
            figment: Figment::new(),
            env_prefixes: Vec::new(),
        }
    }
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file could not be read, or is not valid YAML, an error will be returned.
    pub fn from_yaml<P>(mut self, path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let file = YamlFile::read(path.as_ref())
            .map_err(GenericError::from)
            .context(Generic)?;
        debug!(file_path = %path.as_ref().display(), "Loaded configuration file.");

        self.figment = self.figment.admerge(file);
        Ok(self)
    }

    /// Loads configuration from environment variables carrying the given prefix.
    ///
    /// An underscore is appended to the prefix if it does not already end with one, so a prefix of `tessera` matches
    /// `TESSERA_LOG_LEVEL`. Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, an error will be returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let mut prefix = prefix.to_uppercase();
        if !prefix.ends_with('_') {
            prefix.push('_');
        }

        self.figment = self.figment.admerge(Env::prefixed(&prefix));
        self.env_prefixes.push(prefix);
        Ok(self)
    }

    /// Consumes the loader, merging every source into a [`GenericConfiguration`].
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: self.figment,
                env_prefixes: self.env_prefixes,
            }),
        }
    }
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: Vec<String>,
}

/// Merged configuration in its raw form.
///
/// Values are queried by key, using periods to indicate nesting: with `{"runtime": {"debug": true}}`, the key
/// `runtime.debug` yields `true`. Keys that are only present in the environment are found with either spelling.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    /// Creates an empty configuration.
    pub fn empty() -> Self {
        ConfigurationLoader::default().into_generic()
    }

    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = &self.inner.figment;
        let result = match figment.extract_inner(key) {
            // Environment variables never nest, so `runtime.debug` may only exist as `runtime_debug`.
            Err(e) if matches!(e.kind, Kind::MissingField(_)) && key.contains('.') => {
                figment.extract_inner(&key.replace('.', "_"))
            }
            result => result,
        };
        result.map_err(|e| self.convert_error(e))
    }

    /// Gets a configuration value by key.
    ///
    /// ## Errors
    ///
    /// If the key does not exist, or its value could not be deserialized into `T`, an error will be returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets a configuration value by key, if it exists.
    ///
    /// ## Errors
    ///
    /// If the value exists but could not be deserialized into `T`, an error will be returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the entire configuration as `T`.
    ///
    /// ## Errors
    ///
    /// If the configuration could not be deserialized into `T`, an error will be returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner.figment.extract().map_err(|e| self.convert_error(e))
    }

    fn convert_error(&self, e: figment::Error) -> ConfigurationError {
        match e.kind {
            Kind::MissingField(field) => {
                let env_keys = self
                    .inner
                    .env_prefixes
                    .iter()
                    .map(|prefix| format!("{}{}", prefix, field.replace('.', "_").to_uppercase()));
                let keys = std::iter::once(field.to_string()).chain(env_keys).collect::<Vec<_>>();
                let help_text = format!("Try setting `{}`.", keys.join("` or `"));

                ConfigurationError::MissingField { help_text, field }
            }
            Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
                field: e.path.join("."),
                expected_ty,
                actual_ty: actual_ty.to_string(),
            },
            _ => ConfigurationError::Generic { source: e.into() },
        }
    }
}
