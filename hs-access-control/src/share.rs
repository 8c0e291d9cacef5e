use crate::{
    error::{AccessError, DenialReason},
    models::*,
    privilege::PrivilegeLevel,
    repository::GrantStore,
    resolver::PrivilegeResolver,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A validated share, ready to be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePlan {
    pub key: GrantKey,
    pub grantor: UserId,
    pub level: PrivilegeLevel,
    /// The grantee's current held grant, if any
    pub existing: Option<Grant>,
}

impl SharePlan {
    /// Re-sharing at the held level changes nothing
    pub fn is_noop(&self) -> bool {
        self.existing
            .as_ref()
            .map(|g| g.held_privilege() == self.level)
            .unwrap_or(false)
    }
}

/// Grants, revokes and undoes privileges, enforcing who may do what
pub struct ShareProtocol {
    store: Arc<dyn GrantStore>,
    resolver: Arc<PrivilegeResolver>,
}

impl ShareProtocol {
    pub fn new(store: Arc<dyn GrantStore>, resolver: Arc<PrivilegeResolver>) -> Self {
        Self { store, resolver }
    }

    /// Grant `level` over `target` to `grantee`.
    ///
    /// Re-sharing at the level already held succeeds without recording
    /// anything.
    pub async fn share(
        &self,
        grantor: &Principal,
        grantee: Grantee,
        target: Target,
        level: PrivilegeLevel,
    ) -> Result<Grant, AccessError> {
        let plan = self.authorize_share(grantor, grantee, target, level).await?;
        self.apply(plan).await
    }

    /// Validate a share without writing anything
    pub async fn authorize_share(
        &self,
        grantor: &Principal,
        grantee: Grantee,
        target: Target,
        level: PrivilegeLevel,
    ) -> Result<SharePlan, AccessError> {
        PrivilegeResolver::ensure_active(grantor)?;

        let key = GrantKey::new(grantee, target)?;
        if level.is_none() {
            return Err(AccessError::InvalidPrivilege(
                "use unshare to remove a privilege".to_string(),
            ));
        }
        if level > key.max_privilege() {
            return Err(AccessError::InvalidPrivilege(format!(
                "{} cannot be granted {} over {}",
                grantee, level, target
            )));
        }

        self.check_grantee(grantee).await?;

        let shareable = match target {
            Target::Resource(id) => {
                let resource = self.resolver.load_resource(id).await?;
                if resource.is_immutable() && level == PrivilegeLevel::Change {
                    return Err(self.deny(grantor, target, DenialReason::ImmutableResource));
                }
                resource.shareable
            }
            Target::Group(id) => {
                let group = self.resolver.load_group(id).await?;
                if !group.active {
                    return Err(self.deny(grantor, target, DenialReason::InactiveGroup));
                }
                group.shareable
            }
        };

        let grantor_level = self.resolver.effective_privilege(grantor, target).await?;
        let existing = self.store.grant(&key).await?.filter(|g| g.is_held);

        if grantor_level < PrivilegeLevel::Owner {
            if level == PrivilegeLevel::Owner {
                return Err(self.deny(grantor, target, DenialReason::InsufficientPrivilege));
            }
            if !shareable {
                return Err(self.deny(grantor, target, DenialReason::NotShareable));
            }
            if grantor_level < level {
                return Err(self.deny(grantor, target, DenialReason::InsufficientPrivilege));
            }
            // Only owners may lower someone else's privilege
            if let Some(ref current) = existing {
                if current.privilege > level {
                    return Err(self.deny(grantor, target, DenialReason::InsufficientPrivilege));
                }
            }
        }

        Ok(SharePlan {
            key,
            grantor: grantor.id,
            level,
            existing,
        })
    }

    /// Write a validated share to the store
    pub async fn apply(&self, plan: SharePlan) -> Result<Grant, AccessError> {
        if plan.is_noop() {
            debug!("{} already held at {}", plan.key, plan.level);
            if let Some(existing) = plan.existing {
                return Ok(existing);
            }
        }

        let grant = self
            .store
            .apply_grant(GrantChange::grant(plan.key, plan.grantor, plan.level))
            .await?;
        self.resolver.invalidate();

        info!(
            grantor = %plan.grantor,
            grantee = %plan.key.grantee,
            target = %plan.key.target,
            privilege = %plan.level,
            "Shared"
        );
        Ok(grant)
    }

    /// Revoke the grantee's privilege over the target.
    ///
    /// Owners of the target may unshare anyone, users may always unshare
    /// themselves, and owners of a group may remove that group's access.
    pub async fn unshare(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<(), AccessError> {
        PrivilegeResolver::ensure_active(actor)?;

        let key = GrantKey::new(grantee, target)?;
        self.store
            .grant(&key)
            .await?
            .filter(|g| g.is_held)
            .ok_or_else(|| AccessError::NotFound(format!("held grant {}", key)))?;

        if !self.may_unshare(actor, grantee, target).await? {
            return Err(self.deny(actor, target, DenialReason::InsufficientPrivilege));
        }

        self.store
            .apply_grant(GrantChange::revoke(key, actor.id))
            .await?;
        self.resolver.invalidate();

        info!(actor = %actor.id, grantee = %grantee, target = %target, "Unshared");
        Ok(())
    }

    /// Whether `actor` may revoke the grantee's privilege over the target
    pub async fn can_unshare(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<bool, AccessError> {
        PrivilegeResolver::ensure_active(actor)?;

        let key = GrantKey::new(grantee, target)?;
        let Some(current) = self.store.grant(&key).await?.filter(|g| g.is_held) else {
            return Ok(false);
        };
        if !self.may_unshare(actor, grantee, target).await? {
            return Ok(false);
        }
        if current.privilege == PrivilegeLevel::Owner {
            return Ok(self.owner_count(target).await? > 1);
        }
        Ok(true)
    }

    async fn may_unshare(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<bool, AccessError> {
        if grantee == Grantee::User(actor.id) {
            return Ok(true);
        }
        if self.resolver.effective_privilege(actor, target).await? == PrivilegeLevel::Owner {
            return Ok(true);
        }
        if let Grantee::Group(group) = grantee {
            let level = self
                .resolver
                .effective_privilege(actor, Target::Group(group))
                .await?;
            return Ok(level == PrivilegeLevel::Owner);
        }
        Ok(false)
    }

    /// Whether `actor` may undo the latest change to (grantee, target).
    ///
    /// The latest log entry must be the actor's own and not itself an undo,
    /// and restoring the previous state must leave the target an owner.
    pub async fn can_undo_share(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<bool, AccessError> {
        PrivilegeResolver::ensure_active(actor)?;

        let key = GrantKey::new(grantee, target)?;
        Ok(self.undo_plan(actor, &key).await?.is_some())
    }

    /// Restore the state of (grantee, target) before the actor's latest
    /// share or unshare.
    pub async fn undo_share(
        &self,
        actor: &Principal,
        grantee: Grantee,
        target: Target,
    ) -> Result<(), AccessError> {
        PrivilegeResolver::ensure_active(actor)?;

        let key = GrantKey::new(grantee, target)?;
        let log = self.store.provenance(&key).await?;
        if log.is_empty() {
            return Err(AccessError::NotFound(format!("share history for {}", key)));
        }

        let Some(change) = self.undo_plan(actor, &key).await? else {
            if self.undo_would_orphan(&key, &log).await? {
                return Err(AccessError::LastOwner(target));
            }
            if self.undo_restores_change_on_immutable(&key, &log).await? {
                return Err(self.deny(actor, target, DenialReason::ImmutableResource));
            }
            return Err(self.deny(actor, target, DenialReason::InsufficientPrivilege));
        };

        self.store.apply_grant(change.clone()).await?;
        self.resolver.invalidate();

        info!(
            actor = %actor.id,
            grantee = %grantee,
            target = %target,
            restored = %change.privilege,
            "Undid share"
        );
        Ok(())
    }

    /// The change that would undo the actor's latest entry, if undo is allowed
    async fn undo_plan(
        &self,
        actor: &Principal,
        key: &GrantKey,
    ) -> Result<Option<GrantChange>, AccessError> {
        let log = self.store.provenance(key).await?;
        let Some(latest) = log.last() else {
            return Ok(None);
        };
        if latest.grantor != actor.id || latest.undone {
            return Ok(None);
        }
        if self.undo_would_orphan(key, &log).await?
            || self.undo_restores_change_on_immutable(key, &log).await?
        {
            return Ok(None);
        }

        let change = match previous_entry(&log) {
            Some(previous) => GrantChange::undo(*key, previous.grantor, previous.privilege),
            None => GrantChange::undo(*key, actor.id, PrivilegeLevel::None),
        };
        Ok(Some(change))
    }

    /// Restoring the previous entry would remove the target's only owner
    async fn undo_would_orphan(
        &self,
        key: &GrantKey,
        log: &[ProvenanceRecord],
    ) -> Result<bool, AccessError> {
        let current = self
            .store
            .grant(key)
            .await?
            .map(|g| g.held_privilege())
            .unwrap_or_default();
        let restored = previous_entry(log)
            .map(|r| r.privilege)
            .unwrap_or_default();

        if current == PrivilegeLevel::Owner && restored < PrivilegeLevel::Owner {
            return Ok(self.owner_count(key.target).await? <= 1);
        }
        Ok(false)
    }

    /// CHANGE is never written on a published or immutable resource
    async fn undo_restores_change_on_immutable(
        &self,
        key: &GrantKey,
        log: &[ProvenanceRecord],
    ) -> Result<bool, AccessError> {
        let Target::Resource(resource) = key.target else {
            return Ok(false);
        };
        if previous_entry(log).map(|r| r.privilege) != Some(PrivilegeLevel::Change) {
            return Ok(false);
        }
        Ok(self.resolver.load_resource(resource).await?.is_immutable())
    }

    async fn owner_count(&self, target: Target) -> Result<usize, AccessError> {
        Ok(self
            .store
            .held_grants_on(target)
            .await?
            .iter()
            .filter(|g| g.privilege == PrivilegeLevel::Owner)
            .count())
    }

    async fn check_grantee(&self, grantee: Grantee) -> Result<(), AccessError> {
        match grantee {
            Grantee::User(id) => {
                if !self.resolver.load_principal(id).await?.is_active {
                    return Err(AccessError::denied(DenialReason::InactiveUser));
                }
            }
            Grantee::Group(id) => {
                if !self.resolver.load_group(id).await?.active {
                    return Err(AccessError::denied(DenialReason::InactiveGroup));
                }
            }
        }
        Ok(())
    }

    fn deny(&self, actor: &Principal, target: Target, reason: DenialReason) -> AccessError {
        warn!(actor = %actor.id, target = %target, reason = %reason, "Share denied");
        AccessError::denied(reason)
    }
}

/// The entry before the latest one
fn previous_entry(log: &[ProvenanceRecord]) -> Option<&ProvenanceRecord> {
    log.len().checked_sub(2).and_then(|i| log.get(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryGrantStore;

    struct Fixture {
        store: Arc<InMemoryGrantStore>,
        sharing: ShareProtocol,
        owner: Principal,
        resource: Resource,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryGrantStore::new());
        let resolver = Arc::new(PrivilegeResolver::new(store.clone()));
        let sharing = ShareProtocol::new(store.clone(), resolver);

        let owner = Principal::new("owner");
        let resource = Resource::new("dataset");
        store.save_principal(owner.clone()).await.unwrap();
        store.save_resource(resource.clone()).await.unwrap();
        store
            .apply_grant(GrantChange::grant(
                GrantKey::user_resource(owner.id, resource.id),
                owner.id,
                PrivilegeLevel::Owner,
            ))
            .await
            .unwrap();

        Fixture {
            store,
            sharing,
            owner,
            resource,
        }
    }

    async fn user(fx: &Fixture, name: &str) -> Principal {
        let user = Principal::new(name);
        fx.store.save_principal(user.clone()).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_share_is_idempotent() {
        let fx = fixture().await;
        let bob = user(&fx, "bob").await;
        let target = Target::Resource(fx.resource.id);

        let first = fx
            .sharing
            .share(&fx.owner, Grantee::User(bob.id), target, PrivilegeLevel::View)
            .await
            .unwrap();
        let second = fx
            .sharing
            .share(&fx.owner, Grantee::User(bob.id), target, PrivilegeLevel::View)
            .await
            .unwrap();
        assert_eq!(first, second);

        let log = fx
            .store
            .provenance(&GrantKey::user_resource(bob.id, fx.resource.id))
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn test_non_owner_sharing_rules() {
        let fx = fixture().await;
        let editor = user(&fx, "editor").await;
        let carol = user(&fx, "carol").await;
        let target = Target::Resource(fx.resource.id);

        fx.sharing
            .share(&fx.owner, Grantee::User(editor.id), target, PrivilegeLevel::Change)
            .await
            .unwrap();

        // Editors can share up to CHANGE but never OWNER
        fx.sharing
            .share(&editor, Grantee::User(carol.id), target, PrivilegeLevel::Change)
            .await
            .unwrap();
        let err = fx
            .sharing
            .share(&editor, Grantee::User(carol.id), target, PrivilegeLevel::Owner)
            .await
            .unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));

        // and cannot lower someone else's grant
        let err = fx
            .sharing
            .share(&editor, Grantee::User(carol.id), target, PrivilegeLevel::View)
            .await
            .unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));

        // Unshareable resources can only be shared by owners
        let mut resource = fx.resource.clone();
        resource.shareable = false;
        fx.store.save_resource(resource).await.unwrap();
        let dave = user(&fx, "dave").await;
        let err = fx
            .sharing
            .share(&editor, Grantee::User(dave.id), target, PrivilegeLevel::View)
            .await
            .unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::NotShareable));
        fx.sharing
            .share(&fx.owner, Grantee::User(dave.id), target, PrivilegeLevel::View)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_undo_restores_previous_level() {
        let fx = fixture().await;
        let bob = user(&fx, "bob").await;
        let grantee = Grantee::User(bob.id);
        let target = Target::Resource(fx.resource.id);

        fx.sharing
            .share(&fx.owner, grantee, target, PrivilegeLevel::View)
            .await
            .unwrap();
        fx.sharing
            .share(&fx.owner, grantee, target, PrivilegeLevel::Change)
            .await
            .unwrap();

        assert!(fx.sharing.can_undo_share(&fx.owner, grantee, target).await.unwrap());
        assert!(!fx.sharing.can_undo_share(&bob, grantee, target).await.unwrap());

        fx.sharing.undo_share(&fx.owner, grantee, target).await.unwrap();
        let grant = fx
            .store
            .grant(&GrantKey::user_resource(bob.id, fx.resource.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.held_privilege(), PrivilegeLevel::View);

        // An undo cannot itself be undone
        assert!(!fx.sharing.can_undo_share(&fx.owner, grantee, target).await.unwrap());
    }

    #[tokio::test]
    async fn test_undo_blocked_after_other_grantor() {
        let fx = fixture().await;
        let co_owner = user(&fx, "co-owner").await;
        let bob = user(&fx, "bob").await;
        let grantee = Grantee::User(bob.id);
        let target = Target::Resource(fx.resource.id);

        fx.sharing
            .share(&fx.owner, Grantee::User(co_owner.id), target, PrivilegeLevel::Owner)
            .await
            .unwrap();
        fx.sharing
            .share(&fx.owner, grantee, target, PrivilegeLevel::View)
            .await
            .unwrap();
        fx.sharing
            .share(&co_owner, grantee, target, PrivilegeLevel::Change)
            .await
            .unwrap();

        assert!(!fx.sharing.can_undo_share(&fx.owner, grantee, target).await.unwrap());
        let err = fx
            .sharing
            .undo_share(&fx.owner, grantee, target)
            .await
            .unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));
        assert!(fx.sharing.can_undo_share(&co_owner, grantee, target).await.unwrap());
    }

    #[tokio::test]
    async fn test_undo_of_creation_grant_is_refused() {
        let fx = fixture().await;
        let grantee = Grantee::User(fx.owner.id);
        let target = Target::Resource(fx.resource.id);

        assert!(!fx.sharing.can_undo_share(&fx.owner, grantee, target).await.unwrap());
        let err = fx
            .sharing
            .undo_share(&fx.owner, grantee, target)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::LastOwner(_)));
    }
}
