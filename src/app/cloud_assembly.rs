//! Reading synthesized cloud assemblies.
//!
//! `cdk synth` writes a `manifest.json` next to the stack templates. Every artifact of
//! type `aws:cloudformation:stack` becomes one local [`CloudFormationStack`]; artifacts of
//! type `cdk:cloud-assembly` (CDK stages) point at nested assembly directories, which are
//! read recursively.
//!
//! ```json
//! {
//!   "version": "36.0.0",
//!   "artifacts": {
//!     "StorageStack": {
//!       "type": "aws:cloudformation:stack",
//!       "environment": "aws://123456789012/eu-west-1",
//!       "properties": { "templateFile": "StorageStack.template.json" }
//!     }
//!   }
//! }
//! ```

use crate::app::cfn_template::CloudFormationTemplate;
use crate::app::refactor::environment::{CloudFormationStack, Environment};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "manifest.json";
const STACK_ARTIFACT: &str = "aws:cloudformation:stack";
const NESTED_ASSEMBLY_ARTIFACT: &str = "cdk:cloud-assembly";

#[derive(Debug, Clone, Deserialize)]
struct AssemblyManifest {
    #[serde(default)]
    artifacts: BTreeMap<String, ArtifactManifest>,
}

#[derive(Debug, Clone, Deserialize)]
struct ArtifactManifest {
    #[serde(rename = "type")]
    artifact_type: String,
    environment: Option<String>,
    #[serde(default)]
    properties: ArtifactProperties,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactProperties {
    template_file: Option<String>,
    stack_name: Option<String>,
    directory_name: Option<String>,
}

/// A cloud assembly directory.
#[derive(Debug, Clone)]
pub struct CloudAssembly {
    dir: PathBuf,
    manifest: AssemblyManifest,
}

impl CloudAssembly {
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let manifest_path = dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&manifest_path).with_context(|| {
            format!(
                "Failed to read {:?}; run 'cdk synth' first or pass --assembly",
                manifest_path
            )
        })?;
        let manifest: AssemblyManifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", manifest_path))?;
        Ok(Self { dir, manifest })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Every stack of this assembly and its nested assemblies, ordered by stack name.
    pub fn stacks(&self) -> Result<Vec<CloudFormationStack>> {
        let mut stacks = Vec::new();
        self.collect_stacks(&mut stacks)?;
        stacks.sort_by(|a, b| a.stack_name.cmp(&b.stack_name));
        Ok(stacks)
    }

    fn collect_stacks(&self, stacks: &mut Vec<CloudFormationStack>) -> Result<()> {
        for (artifact_id, artifact) in &self.manifest.artifacts {
            match artifact.artifact_type.as_str() {
                STACK_ARTIFACT => stacks.push(self.read_stack(artifact_id, artifact)?),
                NESTED_ASSEMBLY_ARTIFACT => {
                    let directory = artifact
                        .properties
                        .directory_name
                        .as_deref()
                        .ok_or_else(|| anyhow!("Nested assembly {} has no directoryName", artifact_id))?;
                    debug!("Reading nested assembly {}", directory);
                    CloudAssembly::load(self.dir.join(directory))?.collect_stacks(stacks)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn read_stack(&self, artifact_id: &str, artifact: &ArtifactManifest) -> Result<CloudFormationStack> {
        let stack_name = artifact
            .properties
            .stack_name
            .clone()
            .unwrap_or_else(|| artifact_id.to_string());

        let environment_name = artifact
            .environment
            .as_deref()
            .ok_or_else(|| anyhow!("Stack {} has no environment in the manifest", stack_name))?;
        let environment = Environment::parse(environment_name).ok_or_else(|| {
            anyhow!(
                "Stack {} has an invalid environment '{}'; expected aws://ACCOUNT/REGION",
                stack_name,
                environment_name
            )
        })?;

        let template_file = artifact
            .properties
            .template_file
            .as_deref()
            .ok_or_else(|| anyhow!("Stack {} has no templateFile", stack_name))?;
        let template_path = self.dir.join(template_file);
        let content = fs::read_to_string(&template_path)
            .with_context(|| format!("Failed to read template {:?}", template_path))?;
        let template = CloudFormationTemplate::from_json(&content)
            .with_context(|| format!("Invalid template for stack {}", stack_name))?;

        debug!(
            "Loaded local stack {} ({} resources) for {}",
            stack_name,
            template.resources().count(),
            environment
        );
        Ok(CloudFormationStack::new(stack_name, environment, template))
    }
}

/// Load every stack of the assembly at `dir`.
pub fn read_local_stacks<P: AsRef<Path>>(dir: P) -> Result<Vec<CloudFormationStack>> {
    let assembly = CloudAssembly::load(dir)?;
    let stacks = assembly.stacks()?;
    info!(
        "Read {} stack(s) from cloud assembly {:?}",
        stacks.len(),
        assembly.directory()
    );
    Ok(stacks)
}
