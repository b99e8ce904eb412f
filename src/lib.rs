//! CDK Refactor - stack refactor planning for CDK applications
//!
//! `cdk_refactor` compares the stacks a CDK application synthesizes against the stacks
//! currently deployed in CloudFormation, detects resources that were moved between stacks
//! or renamed, and produces a refactor plan CloudFormation can execute without replacing
//! those resources.
//!
//! # Core Features
//!
//! - **Resource digests**: Content hashes that recognize the same resource across
//!   template revisions, independent of logical IDs and construct paths
//! - **Movement detection**: Pairs deployed resources with local resources sharing a digest
//! - **Ambiguity reporting**: Digest groups that cannot be safely resolved are returned as
//!   data instead of guessed
//! - **Cross-stack dependency graph**: `Ref`, `Fn::GetAtt`, `Fn::ImportValue` and `DependsOn`
//!   edges across every stack of an environment
//! - **Stack definitions**: The templates a `CreateStackRefactor` call needs, with S3 offload
//!   for templates above the inline size limit
//!
//! # Architecture Overview
//!
//! - **Template layer** ([`app::cfn_template`], [`app::cfn_intrinsic_functions`]):
//!   order-preserving CloudFormation templates and intrinsic function parsing
//! - **Refactor engine** ([`app::refactor`]): pure, synchronous planning per environment
//! - **Integration layer** ([`app::aws_client`], [`app::cloud_assembly`],
//!   [`app::cfn_resource_models`]): CloudFormation/S3/STS access, synthesized assemblies
//!   and resource schemas
//!
//! # Getting Started
//!
//! The entry point for a full plan is [`app::refactor::plan_refactor`]. Each stage is also
//! usable on its own, for example [`app::refactor::digest::compute_template_digests`] for a
//! single template or [`app::refactor::graph::ResourceGraph::from_stacks`] for dependency
//! analysis.

#![warn(clippy::all, rust_2018_idioms)]

// Include logging macros first
#[macro_use]
pub mod logging_macros;

pub mod app;

pub use app::refactor::{plan_refactor, RefactorOptions, RefactorPlan};
