use crate::{
    error::{AccessError, DenialReason},
    models::*,
    privilege::PrivilegeLevel,
    repository::GrantStore,
};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves the effective privilege of a user over a resource or group.
///
/// Combines:
/// - the user's direct grant on the target
/// - for resources, grants held by every active group the user belongs to
///
/// The resolver never writes to the store.
pub struct PrivilegeResolver {
    store: Arc<dyn GrantStore>,

    /// Grant-derived levels keyed by (user, target), before the immutable cap
    cache: Option<Arc<DashMap<(UserId, Target), PrivilegeLevel>>>,
}

impl PrivilegeResolver {
    pub fn new(store: Arc<dyn GrantStore>) -> Self {
        Self { store, cache: None }
    }

    /// Enable caching of resolved privileges
    pub fn with_cache(mut self) -> Self {
        self.cache = Some(Arc::new(DashMap::new()));
        self
    }

    /// Drop every cached privilege. Called after each mutation.
    pub fn invalidate(&self) {
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
    }

    /// Reject deactivated accounts before any other check
    pub fn ensure_active(principal: &Principal) -> Result<(), AccessError> {
        if principal.is_active {
            Ok(())
        } else {
            warn!("Rejected inactive user {}", principal);
            Err(AccessError::denied(DenialReason::InactiveUser))
        }
    }

    pub async fn load_resource(&self, id: ResourceId) -> Result<Resource, AccessError> {
        self.store
            .resource(id)
            .await?
            .ok_or_else(|| AccessError::NotFound(format!("resource {}", id)))
    }

    pub async fn load_group(&self, id: GroupId) -> Result<Group, AccessError> {
        self.store
            .group(id)
            .await?
            .ok_or_else(|| AccessError::NotFound(format!("group {}", id)))
    }

    pub async fn load_principal(&self, id: UserId) -> Result<Principal, AccessError> {
        self.store
            .principal(id)
            .await?
            .ok_or_else(|| AccessError::NotFound(format!("user {}", id)))
    }

    /// Effective privilege of `principal` over `target`.
    ///
    /// Inactive users are refused before anything is computed. Superusers
    /// hold OWNER over every existing target. On immutable or published
    /// resources CHANGE is reduced to VIEW; OWNER is kept.
    pub async fn effective_privilege(
        &self,
        principal: &Principal,
        target: Target,
    ) -> Result<PrivilegeLevel, AccessError> {
        Self::ensure_active(principal)?;

        let immutable = match target {
            Target::Resource(id) => self.load_resource(id).await?.is_immutable(),
            Target::Group(id) => {
                self.load_group(id).await?;
                false
            }
        };

        if principal.is_superuser {
            return Ok(PrivilegeLevel::Owner);
        }

        let granted = self.granted_privilege(principal.id, target).await?;

        if immutable && granted == PrivilegeLevel::Change {
            debug!("Capping CHANGE to VIEW on immutable {}", target);
            return Ok(PrivilegeLevel::View);
        }

        Ok(granted)
    }

    /// Highest held grant level of a user over a target, direct or via groups
    async fn granted_privilege(
        &self,
        user: UserId,
        target: Target,
    ) -> Result<PrivilegeLevel, AccessError> {
        let cache_key = (user, target);

        if let Some(ref cache) = self.cache {
            if let Some(level) = cache.get(&cache_key) {
                debug!("Cache hit for privilege of user:{} on {}", user, target);
                return Ok(*level);
            }
        }

        let direct = self.direct_privilege(Grantee::User(user), target).await?;
        let level = match target {
            // Nothing exceeds a direct OWNER grant
            Target::Resource(resource) if direct < PrivilegeLevel::Owner => {
                direct.max(self.group_privilege(user, resource).await?)
            }
            _ => direct,
        };

        debug!("Resolved user:{} on {} to {}", user, target, level);

        if let Some(ref cache) = self.cache {
            cache.insert(cache_key, level);
        }

        Ok(level)
    }

    /// Held direct grant level of a grantee over a target
    pub async fn direct_privilege(
        &self,
        grantee: Grantee,
        target: Target,
    ) -> Result<PrivilegeLevel, AccessError> {
        let key = GrantKey::new(grantee, target)?;
        Ok(self
            .store
            .grant(&key)
            .await?
            .map(|g| g.held_privilege())
            .unwrap_or_default())
    }

    /// Highest level any of the user's active groups holds over a resource
    async fn group_privilege(
        &self,
        user: UserId,
        resource: ResourceId,
    ) -> Result<PrivilegeLevel, AccessError> {
        let mut best = PrivilegeLevel::None;

        for group in self.active_groups_of(user).await? {
            let level = self
                .direct_privilege(Grantee::Group(group.id), Target::Resource(resource))
                .await?;
            if level > best {
                debug!("Group {} gives {} on resource:{}", group.name, level, resource);
                best = level;
            }
        }

        Ok(best)
    }

    /// Active groups in which the user holds a membership grant
    pub async fn active_groups_of(&self, user: UserId) -> Result<Vec<Group>, AccessError> {
        let memberships = self.store.held_grants_of(Grantee::User(user)).await?;

        let mut groups = Vec::new();
        for grant in memberships {
            if let Target::Group(group_id) = grant.key.target {
                if let Some(group) = self.store.group(group_id).await? {
                    if group.active {
                        groups.push(group);
                    }
                }
            }
        }
        Ok(groups)
    }

    // =============================================================================
    // Capability checks
    // =============================================================================

    /// Only owners may create a new version, and not while the resource is
    /// locked by another versioning operation. Editors cannot version.
    pub async fn can_create_resource_version(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        Self::ensure_active(principal)?;

        let target = self.load_resource(resource).await?;
        if target.locked {
            debug!("Resource {} is locked for versioning", resource);
            return Ok(false);
        }

        let level = self
            .effective_privilege(principal, Target::Resource(resource))
            .await?;
        Ok(level == PrivilegeLevel::Owner)
    }

    pub async fn can_view_resource(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        Self::ensure_active(principal)?;

        if self.load_resource(resource).await?.public {
            return Ok(true);
        }
        Ok(self
            .effective_privilege(principal, Target::Resource(resource))
            .await?
            .can_view())
    }

    /// Immutable resources cannot be changed except by superusers
    pub async fn can_change_resource(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        Self::ensure_active(principal)?;

        let target = self.load_resource(resource).await?;
        if principal.is_superuser {
            return Ok(true);
        }
        if target.is_immutable() {
            return Ok(false);
        }
        Ok(self
            .effective_privilege(principal, Target::Resource(resource))
            .await?
            .can_change())
    }

    pub async fn can_delete_resource(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        Ok(self
            .effective_privilege(principal, Target::Resource(resource))
            .await?
            .is_owner())
    }

    pub async fn can_view_group(
        &self,
        principal: &Principal,
        group: GroupId,
    ) -> Result<bool, AccessError> {
        Self::ensure_active(principal)?;

        if self.load_group(group).await?.public {
            return Ok(true);
        }
        Ok(self
            .effective_privilege(principal, Target::Group(group))
            .await?
            .can_view())
    }

    pub async fn can_change_group(
        &self,
        principal: &Principal,
        group: GroupId,
    ) -> Result<bool, AccessError> {
        Ok(self
            .effective_privilege(principal, Target::Group(group))
            .await?
            .can_change())
    }

    // =============================================================================
    // Holders
    // =============================================================================

    /// Users holding a direct OWNER grant, earliest grant first
    pub async fn owners(&self, target: Target) -> Result<Vec<Principal>, AccessError> {
        let mut owners = Vec::new();
        for grant in self.store.held_grants_on(target).await? {
            if let (Grantee::User(user), PrivilegeLevel::Owner) = (grant.key.grantee, grant.privilege)
            {
                if let Some(principal) = self.store.principal(user).await? {
                    owners.push(principal);
                }
            }
        }
        Ok(owners)
    }

    /// Users holding any membership grant on the group
    pub async fn group_members(&self, group: GroupId) -> Result<Vec<Principal>, AccessError> {
        self.load_group(group).await?;

        let mut members = Vec::new();
        for grant in self.store.held_grants_on(Target::Group(group)).await? {
            if let Grantee::User(user) = grant.key.grantee {
                if let Some(principal) = self.store.principal(user).await? {
                    members.push(principal);
                }
            }
        }
        Ok(members)
    }

    pub async fn is_member(&self, user: UserId, group: GroupId) -> Result<bool, AccessError> {
        Ok(!self
            .direct_privilege(Grantee::User(user), Target::Group(group))
            .await?
            .is_none())
    }
}
