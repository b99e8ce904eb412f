//! Resources kept out of refactor matching.
//!
//! A resource is excluded when the app marked it with `aws:cdk:do-not-refactor`, or when
//! the user lists it, either as `Stack.LogicalId` or by construct path. A construct path
//! entry also covers everything below it, so `App/Stack/Bucket` excludes
//! `App/Stack/Bucket/Resource`.
//!
//! Exclude files hold one entry per line; blank lines and `#` comments are ignored.

use crate::app::cfn_template::TemplateResource;
use crate::app::refactor::movement::ResourceLocation;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeList {
    entries: BTreeSet<String>,
}

impl ExcludeList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|e| e.as_ref().trim().trim_end_matches('/').to_string())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Parse exclude file content.
    pub fn parse(content: &str) -> Self {
        Self::new(
            content
                .lines()
                .map(|line| line.split('#').next().unwrap_or(""))
                .filter(|line| !line.trim().is_empty()),
        )
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read exclude file {:?}", path))?;
        Ok(Self::parse(&content))
    }

    /// Entries of both lists.
    pub fn merge(mut self, other: ExcludeList) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_excluded(&self, location: &ResourceLocation, resource: &TemplateResource<'_>) -> bool {
        if resource.is_refactor_disabled() {
            return true;
        }
        if self.entries.contains(&location.to_location_string()) {
            return true;
        }
        match resource.construct_path() {
            Some(path) => self.entries.iter().any(|entry| {
                path == entry
                    || path
                        .strip_prefix(entry.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }),
            None => false,
        }
    }
}
