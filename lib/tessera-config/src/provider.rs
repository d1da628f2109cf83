use std::path::Path;

use figment::{
    providers::{Format as _, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A YAML file parsed when it is added to the loader, so that a bad file fails loading instead of the first lookup.
pub struct YamlFile {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl YamlFile {
    pub fn read(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        Ok(Self {
            data: Yaml::string(&contents).data()?,
            metadata: Metadata::from("YAML file", path),
        })
    }
}

impl Provider for YamlFile {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
