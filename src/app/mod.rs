//! Core modules for CDK stack refactoring.
//!
//! # Module Organization
//!
//! ## CloudFormation Templates
//! - [`cfn_template`] - Order-preserving template wrapper, exports, metadata
//! - [`cfn_intrinsic_functions`] - Tagged intrinsic function parsing shared by the graph and digests
//! - [`cfn_resource_models`] - Resource schema lookup (primary identifiers)
//!
//! ## Inputs
//! - [`cloud_assembly`] - Synthesized cloud assembly reader (local stacks)
//! - [`aws_client`] - CloudFormation, S3 and STS capability (deployed stacks, uploads)
//! - [`refactor_config`] - Configuration file loading
//!
//! ## Engine
//! - [`refactor`] - Environment grouping, digests, movements, mappings, graph and stack definitions

pub mod aws_client;
pub mod cfn_intrinsic_functions;
pub mod cfn_resource_models;
pub mod cfn_template;
pub mod cloud_assembly;
pub mod refactor;
pub mod refactor_config;
