use crate::{
    config::AccessControlConfig,
    error::{AccessError, DenialReason},
    explicit::ExplicitAccess,
    membership::GroupMembershipWorkflow,
    models::*,
    privilege::PrivilegeLevel,
    repository::{GrantStore, InMemoryGrantStore, PostgresGrantStore},
    resolver::PrivilegeResolver,
    share::ShareProtocol,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Access control engine for resources and groups.
///
/// Wires the privilege resolver, the share protocol and the membership
/// workflow over one grant store.
pub struct AccessControl {
    store: Arc<dyn GrantStore>,

    resolver: Arc<PrivilegeResolver>,

    sharing: Arc<ShareProtocol>,

    membership: GroupMembershipWorkflow,

    explicit: ExplicitAccess,
}

impl AccessControl {
    pub fn new(store: Arc<dyn GrantStore>) -> Self {
        Self::assemble(store, PrivilegeResolver::new)
    }

    /// Cache resolved privileges until the next mutation
    pub fn with_cache(store: Arc<dyn GrantStore>) -> Self {
        Self::assemble(store, |store| PrivilegeResolver::new(store).with_cache())
    }

    fn assemble(
        store: Arc<dyn GrantStore>,
        resolver: impl FnOnce(Arc<dyn GrantStore>) -> PrivilegeResolver,
    ) -> Self {
        let resolver = Arc::new(resolver(store.clone()));
        let sharing = Arc::new(ShareProtocol::new(store.clone(), resolver.clone()));
        let membership =
            GroupMembershipWorkflow::new(store.clone(), resolver.clone(), sharing.clone());
        let explicit = ExplicitAccess::new(store.clone());

        Self {
            store,
            resolver,
            sharing,
            membership,
            explicit,
        }
    }

    /// Postgres when a database URL is configured, in-memory otherwise
    pub async fn from_config(config: &AccessControlConfig) -> Result<Self, AccessError> {
        let store: Arc<dyn GrantStore> = match config.database_url.as_deref() {
            Some(url) if config.uses_database() => {
                let store = PostgresGrantStore::connect(url, config.max_connections).await?;
                store.migrate().await?;
                info!("Access control backed by Postgres");
                Arc::new(store)
            }
            _ => {
                info!("Access control backed by in-memory store");
                Arc::new(InMemoryGrantStore::new())
            }
        };

        Ok(if config.privilege_cache {
            Self::with_cache(store)
        } else {
            Self::new(store)
        })
    }

    pub fn store(&self) -> Arc<dyn GrantStore> {
        self.store.clone()
    }

    // =============================================================================
    // Lifecycle
    // =============================================================================

    pub async fn register_principal(&self, principal: Principal) -> Result<(), AccessError> {
        info!("Registering {}", principal);
        self.store.save_principal(principal).await?;
        self.resolver.invalidate();
        Ok(())
    }

    /// Store a new resource with `owner` as its first OWNER
    pub async fn create_resource(
        &self,
        owner: &Principal,
        resource: Resource,
    ) -> Result<Grant, AccessError> {
        PrivilegeResolver::ensure_active(owner)?;

        let id = resource.id;
        info!("Creating resource {} owned by {}", id, owner);
        self.store.save_resource(resource).await?;
        let grant = self
            .store
            .apply_grant(GrantChange::grant(
                GrantKey::user_resource(owner.id, id),
                owner.id,
                PrivilegeLevel::Owner,
            ))
            .await?;
        self.resolver.invalidate();
        Ok(grant)
    }

    /// Store a new group with `owner` as its first OWNER
    pub async fn create_group(&self, owner: &Principal, group: Group) -> Result<Grant, AccessError> {
        PrivilegeResolver::ensure_active(owner)?;

        let id = group.id;
        info!("Creating group {} owned by {}", group.name, owner);
        self.store.save_group(group).await?;
        let grant = self
            .store
            .apply_grant(GrantChange::grant(
                GrantKey::user_group(owner.id, id),
                owner.id,
                PrivilegeLevel::Owner,
            ))
            .await?;
        self.resolver.invalidate();
        Ok(grant)
    }

    /// Save changed resource flags (public, published, shareable, ...).
    /// Owners only. Publication can only be withdrawn by a superuser.
    pub async fn update_resource(
        &self,
        actor: &Principal,
        resource: Resource,
    ) -> Result<(), AccessError> {
        self.require_owner(actor, Target::Resource(resource.id)).await?;
        let existing = self.resolver.load_resource(resource.id).await?;
        if existing.published && !resource.published && !actor.is_superuser {
            warn!("{} may not unpublish resource {}", actor, resource.id);
            return Err(AccessError::denied(DenialReason::ImmutableResource));
        }
        info!("Updating resource {} flags", resource.id);
        self.store.save_resource(resource).await?;
        self.resolver.invalidate();
        Ok(())
    }

    pub async fn delete_resource(
        &self,
        actor: &Principal,
        resource: ResourceId,
    ) -> Result<(), AccessError> {
        self.require_owner(actor, Target::Resource(resource)).await?;
        info!("Deleting resource {} by {}", resource, actor);
        self.store.delete_resource(resource).await?;
        self.resolver.invalidate();
        Ok(())
    }

    pub async fn delete_group(&self, actor: &Principal, group: GroupId) -> Result<(), AccessError> {
        self.require_owner(actor, Target::Group(group)).await?;
        info!("Deleting group {} by {}", group, actor);
        self.store.delete_group(group).await?;
        self.resolver.invalidate();
        Ok(())
    }

    /// Activate or deactivate a group. Deactivating retires its pending
    /// membership requests.
    pub async fn set_group_active(
        &self,
        actor: &Principal,
        group_id: GroupId,
        active: bool,
    ) -> Result<(), AccessError> {
        self.require_owner(actor, Target::Group(group_id)).await?;

        let mut group = self.resolver.load_group(group_id).await?;
        if group.active == active {
            return Ok(());
        }
        group.active = active;
        self.store.save_group(group).await?;
        self.resolver.invalidate();
        info!("Group {} set active={} by {}", group_id, active, actor);

        if !active {
            self.membership.retire_pending_requests(group_id).await?;
        }
        Ok(())
    }

    async fn require_owner(&self, actor: &Principal, target: Target) -> Result<(), AccessError> {
        if self.resolver.effective_privilege(actor, target).await?.is_owner() {
            Ok(())
        } else {
            warn!("{} is not an owner of {}", actor, target);
            Err(AccessError::denied(DenialReason::InsufficientPrivilege))
        }
    }

    // =============================================================================
    // Privilege resolution
    // =============================================================================

    pub async fn effective_privilege(
        &self,
        principal: &Principal,
        target: Target,
    ) -> Result<PrivilegeLevel, AccessError> {
        self.resolver.effective_privilege(principal, target).await
    }

    pub async fn can_create_resource_version(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        self.resolver
            .can_create_resource_version(principal, resource)
            .await
    }

    pub async fn can_view_resource(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        self.resolver.can_view_resource(principal, resource).await
    }

    pub async fn can_change_resource(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        self.resolver.can_change_resource(principal, resource).await
    }

    pub async fn can_delete_resource(
        &self,
        principal: &Principal,
        resource: ResourceId,
    ) -> Result<bool, AccessError> {
        self.resolver.can_delete_resource(principal, resource).await
    }

    pub async fn can_view_group(
        &self,
        principal: &Principal,
        group: GroupId,
    ) -> Result<bool, AccessError> {
        self.resolver.can_view_group(principal, group).await
    }

    pub async fn can_change_group(
        &self,
        principal: &Principal,
        group: GroupId,
    ) -> Result<bool, AccessError> {
        self.resolver.can_change_group(principal, group).await
    }

    pub async fn owners(&self, target: Target) -> Result<Vec<Principal>, AccessError> {
        self.resolver.owners(target).await
    }

    pub async fn group_members(&self, group: GroupId) -> Result<Vec<Principal>, AccessError> {
        self.resolver.group_members(group).await
    }

    // =============================================================================
    // Explicit access queries
    // =============================================================================

    pub async fn get_users_with_explicit_access(
        &self,
        target: Target,
        level: PrivilegeLevel,
        include_user_granted: bool,
        include_group_granted: bool,
    ) -> Result<HashSet<Principal>, AccessError> {
        self.explicit
            .users_with_explicit_access(target, level, include_user_granted, include_group_granted)
            .await
    }

    pub async fn get_resources_with_explicit_access(
        &self,
        user: UserId,
        level: PrivilegeLevel,
        via_user: bool,
        via_group: bool,
    ) -> Result<Vec<ResourceId>, AccessError> {
        self.explicit
            .resources_with_explicit_access(user, level, via_user, via_group)
            .await
    }

    pub async fn get_groups_with_explicit_access(
        &self,
        resource: ResourceId,
        level: PrivilegeLevel,
    ) -> Result<Vec<Group>, AccessError> {
        self.explicit
            .groups_with_explicit_access(resource, level)
            .await
    }

    // =============================================================================
    // Sharing
    // =============================================================================

    pub async fn share(
        &self,
        grantor: &Principal,
        grantee: Grantee,
        target: Target,
        level: PrivilegeLevel,
    ) -> Result<Grant, AccessError> {
        self.sharing.share(grantor, grantee, target, level).await
    }

    pub async fn unshare(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<(), AccessError> {
        self.sharing.unshare(actor, grantee, target).await
    }

    pub async fn can_unshare(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<bool, AccessError> {
        self.sharing.can_unshare(actor, grantee, target).await
    }

    pub async fn undo_share(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<(), AccessError> {
        self.sharing.undo_share(actor, grantee, target).await
    }

    pub async fn can_undo_share(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<bool, AccessError> {
        self.sharing.can_undo_share(actor, grantee, target).await
    }

    // =============================================================================
    // Group membership
    // =============================================================================

    pub async fn create_group_membership_request(
        &self,
        from_user: &Principal,
        group: GroupId,
        invitee: Option<UserId>,
        explanation: Option<String>,
    ) -> Result<MembershipOutcome, AccessError> {
        self.membership
            .create_request(from_user, group, invitee, explanation)
            .await
    }

    pub async fn act_on_group_membership_request(
        &self,
        actor: &Principal,
        request: RequestId,
        accept: bool,
    ) -> Result<(), AccessError> {
        self.membership.act_on_request(actor, request, accept).await
    }

    pub async fn group_membership_requests_for_user(
        &self,
        user: UserId,
    ) -> Result<Vec<MembershipRequest>, AccessError> {
        self.membership.requests_for_user(user).await
    }

    pub async fn group_membership_requests_for_group(
        &self,
        group: GroupId,
    ) -> Result<Vec<MembershipRequest>, AccessError> {
        self.membership.requests_for_group(group).await
    }
}
