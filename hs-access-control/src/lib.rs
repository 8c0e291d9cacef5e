//! Resource sharing and group membership authorization for HydroShare
//!
//! This crate decides what a user may do to a resource or group and applies
//! the grant and revoke side effects of sharing:
//! - Effective privilege resolution from direct and group-inherited grants
//! - Sharing, unsharing and single-step undo with a provenance log
//! - Group membership invitations and join requests
//! - Pluggable storage (in-memory or Postgres)
//!
//! # Core Concepts
//!
//! - **Privilege**: an ordered level, `None < View < Change < Owner`
//! - **Grant**: a held (or revoked) privilege of a grantee over a target
//! - **Grantee**: a user, or a group receiving access to a resource
//! - **Target**: a resource, or a group whose membership is being granted
//!
//! Every resource and group always keeps at least one owner.
//!
//! # Example
//!
//! ```rust
//! use hs_access_control::{AccessControl, Grantee, InMemoryGrantStore, PrivilegeLevel, Principal, Resource, Target};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let access = AccessControl::new(Arc::new(InMemoryGrantStore::new()));
//!
//!     let owner = Principal::new("alice");
//!     let editor = Principal::new("bob");
//!     access.register_principal(owner.clone()).await?;
//!     access.register_principal(editor.clone()).await?;
//!
//!     let resource = Resource::new("Logan River discharge");
//!     let target = Target::Resource(resource.id);
//!     access.create_resource(&owner, resource).await?;
//!
//!     access.share(&owner, Grantee::User(editor.id), target, PrivilegeLevel::Change).await?;
//!     assert_eq!(access.effective_privilege(&editor, target).await?, PrivilegeLevel::Change);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod explicit;
pub mod logging;
pub mod membership;
pub mod models;
pub mod privilege;
pub mod repository;
pub mod resolver;
pub mod share;

pub use config::{AccessControlConfig, LogFormat};
pub use engine::AccessControl;
pub use error::{AccessError, DenialReason};
pub use models::*;
pub use privilege::PrivilegeLevel;
pub use repository::{GrantStore, InMemoryGrantStore, PostgresGrantStore};
