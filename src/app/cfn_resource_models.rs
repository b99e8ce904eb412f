//! CloudFormation resource model lookup.
//!
//! The digest calculator needs one fact from a resource type's registry schema: its
//! `primaryIdentifier`, the properties that name the physical resource. Lookup is a
//! capability injected into the engine through [`ResourceModelLoader`], so tests can supply
//! arbitrary schemas and the binary can read the schemas CloudFormation publishes.
//!
//! Two implementations are provided:
//!
//! * [`StaticResourceModels`] - an in-memory table, built from code or JSON
//! * [`SchemaDirectoryModels`] - a directory of registry schema files as unpacked from
//!   `CloudformationSchema.zip` (`aws-s3-bucket.json`, `aws-sqs-queue.json`, ...), cached
//!   per type after the first read
//!
//! A type without a model is never an error: the digest falls back to hashing all
//! properties.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// The parts of a resource provider schema the refactor engine uses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceModel {
    /// Property names (not JSON pointers) forming the physical identity of a resource.
    pub primary_identifier: Option<Vec<String>>,
}

impl ResourceModel {
    pub fn with_primary_identifier<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary_identifier: Some(properties.into_iter().map(Into::into).collect()),
        }
    }

    /// Build a model from a registry schema document.
    ///
    /// `primaryIdentifier` entries are JSON pointers such as `/properties/BucketName`;
    /// only top-level property pointers are kept since nested identifiers cannot be
    /// compared as whole property values.
    pub fn from_schema(schema: &Value) -> Self {
        let primary_identifier = schema
            .get("primaryIdentifier")
            .and_then(Value::as_array)
            .map(|pointers| {
                pointers
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|pointer| pointer.strip_prefix("/properties/"))
                    .filter(|name| !name.contains('/'))
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|names| !names.is_empty());
        Self { primary_identifier }
    }
}

/// Capability for looking up resource models by CloudFormation type name.
pub trait ResourceModelLoader: Send + Sync {
    /// Model for `resource_type`, or `None` when the type is unknown.
    fn load_resource_model(&self, resource_type: &str) -> Option<ResourceModel>;
}

/// Loader that knows no types; every digest uses all properties.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResourceModels;

impl ResourceModelLoader for NoResourceModels {
    fn load_resource_model(&self, _resource_type: &str) -> Option<ResourceModel> {
        None
    }
}

/// In-memory resource model table.
#[derive(Debug, Clone, Default)]
pub struct StaticResourceModels {
    models: HashMap<String, ResourceModel>,
}

impl StaticResourceModels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with_model(mut self, resource_type: &str, model: ResourceModel) -> Self {
        self.insert(resource_type, model);
        self
    }

    pub fn insert(&mut self, resource_type: &str, model: ResourceModel) {
        self.models.insert(resource_type.to_string(), model);
    }

    /// Parse `{"AWS::S3::Bucket": {"primaryIdentifier": ["/properties/BucketName"]}, ...}`.
    pub fn from_json(json_content: &str) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct Schemas(HashMap<String, Value>);

        let Schemas(schemas) = serde_json::from_str(json_content)?;
        Ok(Self {
            models: schemas
                .into_iter()
                .map(|(resource_type, schema)| (resource_type, ResourceModel::from_schema(&schema)))
                .collect(),
        })
    }
}

impl ResourceModelLoader for StaticResourceModels {
    fn load_resource_model(&self, resource_type: &str) -> Option<ResourceModel> {
        self.models.get(resource_type).cloned()
    }
}

/// Reads registry schemas from a directory, one file per type.
///
/// Results (including misses) are cached for the lifetime of the loader.
#[derive(Debug)]
pub struct SchemaDirectoryModels {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Option<ResourceModel>>>,
}

impl SchemaDirectoryModels {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// `AWS::S3::Bucket` -> `aws-s3-bucket.json`
    pub fn schema_file_name(resource_type: &str) -> String {
        format!("{}.json", resource_type.to_lowercase().replace("::", "-"))
    }

    fn read_model(&self, resource_type: &str) -> Option<ResourceModel> {
        let path = self.dir.join(Self::schema_file_name(resource_type));
        if !path.exists() {
            trace!("No schema for {} at {:?}", resource_type, path);
            return None;
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read schema {:?}: {}", path, e);
                return None;
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(schema) => {
                let model = ResourceModel::from_schema(&schema);
                debug!(
                    "Loaded schema for {} (primary identifier: {:?})",
                    resource_type, model.primary_identifier
                );
                Some(model)
            }
            Err(e) => {
                warn!("Failed to parse schema {:?}: {}", path, e);
                None
            }
        }
    }
}

impl ResourceModelLoader for SchemaDirectoryModels {
    fn load_resource_model(&self, resource_type: &str) -> Option<ResourceModel> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.get(resource_type) {
                return cached.clone();
            }
        }

        let model = self.read_model(resource_type);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(resource_type.to_string(), model.clone());
        }
        model
    }
}
