use crate::{
    error::{AccessError, DenialReason},
    models::*,
    privilege::PrivilegeLevel,
    repository::GrantStore,
    resolver::PrivilegeResolver,
    share::ShareProtocol,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Invitations and self-join requests for group membership.
///
/// A request is PENDING until it is accepted, declined or cancelled, after
/// which it is REDEEMED for good. Accepting grants VIEW on the group.
pub struct GroupMembershipWorkflow {
    store: Arc<dyn GrantStore>,
    resolver: Arc<PrivilegeResolver>,
    sharing: Arc<ShareProtocol>,
}

impl GroupMembershipWorkflow {
    pub fn new(
        store: Arc<dyn GrantStore>,
        resolver: Arc<PrivilegeResolver>,
        sharing: Arc<ShareProtocol>,
    ) -> Self {
        Self {
            store,
            resolver,
            sharing,
        }
    }

    /// Invite `invitee` to the group, or ask to join it when `invitee` is `None`.
    ///
    /// Self-join requests to auto-approving groups are granted on the spot and
    /// no request is stored.
    pub async fn create_request(
        &self,
        from_user: &Principal,
        group_id: GroupId,
        invitee: Option<UserId>,
        explanation: Option<String>,
    ) -> Result<MembershipOutcome, AccessError> {
        PrivilegeResolver::ensure_active(from_user)?;

        let group = self.active_group(group_id).await?;

        let request = match invitee {
            Some(invitee_id) => {
                let level = self
                    .resolver
                    .effective_privilege(from_user, Target::Group(group_id))
                    .await?;
                if !level.is_owner() {
                    warn!("{} cannot invite to group {}: not an owner", from_user, group.name);
                    return Err(AccessError::denied(DenialReason::InsufficientPrivilege));
                }

                let invitee = self.resolver.load_principal(invitee_id).await?;
                if !invitee.is_active {
                    return Err(AccessError::denied(DenialReason::InactiveUser));
                }
                MembershipRequest::invitation(from_user.id, group_id, invitee_id)
            }
            None => {
                let explanation = explanation
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty());
                if group.requires_explanation && explanation.is_none() {
                    return Err(AccessError::denied(DenialReason::ExplanationRequired));
                }
                MembershipRequest::join_request(from_user.id, group_id, explanation)
            }
        };

        let candidate = request.candidate();
        if self.resolver.is_member(candidate, group_id).await? {
            return Err(AccessError::DuplicateRequest(format!(
                "user:{} is already a member of group {}",
                candidate, group.name
            )));
        }

        if !request.is_invitation() && group.auto_approve {
            return self.auto_approve(from_user, &group).await;
        }

        let request = self.store.insert_request(request).await?;
        info!(
            request = %request.id,
            from = %request.request_from,
            candidate = %candidate,
            group = %group_id,
            invitation = request.is_invitation(),
            "Created membership request"
        );
        Ok(MembershipOutcome::Created(request))
    }

    async fn auto_approve(
        &self,
        user: &Principal,
        group: &Group,
    ) -> Result<MembershipOutcome, AccessError> {
        // A pending invitation for the same pair still blocks the join
        let pending = self
            .store
            .pending_requests(RequestFilter::Pair(user.id, group.id))
            .await?;
        if !pending.is_empty() {
            return Err(AccessError::DuplicateRequest(format!(
                "user:{} already has a pending request for group {}",
                user.id, group.name
            )));
        }

        let owner = self
            .earliest_active_owner(group)
            .await?
            .ok_or_else(|| AccessError::NotFound(format!("active owner of group {}", group.name)))?;

        let grant = self
            .sharing
            .share(
                &owner,
                Grantee::User(user.id),
                Target::Group(group.id),
                PrivilegeLevel::View,
            )
            .await?;

        info!("Auto-approved {} into group {}", user, group.name);
        Ok(MembershipOutcome::AutoApproved(grant))
    }

    async fn earliest_active_owner(&self, group: &Group) -> Result<Option<Principal>, AccessError> {
        Ok(self
            .resolver
            .owners(Target::Group(group.id))
            .await?
            .into_iter()
            .find(|p| p.is_active))
    }

    /// The principal recorded as grantor when a request is accepted.
    ///
    /// The preferred grantor must still be an active owner of the group,
    /// otherwise the earliest active owner stands in.
    async fn accepting_grantor(
        &self,
        preferred: UserId,
        group: &Group,
    ) -> Result<Principal, AccessError> {
        let preferred = self.resolver.load_principal(preferred).await?;
        if preferred.is_active
            && self
                .resolver
                .effective_privilege(&preferred, Target::Group(group.id))
                .await?
                .is_owner()
        {
            return Ok(preferred);
        }

        match self.earliest_active_owner(group).await? {
            Some(owner) => {
                info!(
                    "{} can no longer grant membership in {}, {} grants instead",
                    preferred, group.name, owner
                );
                Ok(owner)
            }
            None => {
                warn!("Group {} has no active owner to grant membership", group.name);
                Err(AccessError::denied(DenialReason::InsufficientPrivilege))
            }
        }
    }

    /// Accept or decline a pending request.
    ///
    /// Invitees answer their invitations and inviters may retract them; group
    /// owners answer join requests and requesters may cancel their own.
    pub async fn act_on_request(
        &self,
        actor: &Principal,
        request_id: RequestId,
        accept: bool,
    ) -> Result<(), AccessError> {
        PrivilegeResolver::ensure_active(actor)?;

        let request = self
            .store
            .request(request_id)
            .await?
            .filter(|r| r.state() == RequestState::Pending)
            .ok_or_else(|| {
                AccessError::NotFound(format!("pending membership request {}", request_id))
            })?;
        let group = self.active_group(request.group_to_join).await?;
        let target = Target::Group(group.id);

        let is_owner = self.resolver.effective_privilege(actor, target).await?.is_owner();
        let grantor = match request.invitation_to {
            Some(invitee) if actor.id == invitee => Some(request.request_from),
            Some(_) if actor.id == request.request_from && !accept => None,
            None if actor.id == request.request_from && !accept => None,
            None if is_owner => Some(actor.id),
            _ => {
                warn!("{} may not act on membership request {}", actor, request_id);
                return Err(AccessError::denied(DenialReason::InsufficientPrivilege));
            }
        };

        if !accept {
            self.store.redeem_request(request_id).await?;
            info!(request = %request_id, actor = %actor.id, "Declined membership request");
            return Ok(());
        }

        let candidate = request.candidate();
        let plan = if self.resolver.is_member(candidate, group.id).await? {
            None
        } else {
            let grantor = match grantor {
                Some(id) => self.accepting_grantor(id, &group).await?,
                None => return Err(AccessError::denied(DenialReason::InsufficientPrivilege)),
            };
            Some(
                self.sharing
                    .authorize_share(&grantor, Grantee::User(candidate), target, PrivilegeLevel::View)
                    .await?,
            )
        };

        self.store.redeem_request(request_id).await?;

        if let Some(plan) = plan {
            if let Err(e) = self.sharing.apply(plan).await {
                warn!("Granting membership for request {} failed: {}", request_id, e);
                self.store.reopen_request(request_id).await?;
                return Err(e);
            }
        }

        info!(
            request = %request_id,
            actor = %actor.id,
            member = %candidate,
            group = %group.id,
            "Accepted membership request"
        );
        Ok(())
    }

    /// Pending requests in which the user is the prospective member
    pub async fn requests_for_user(
        &self,
        user: UserId,
    ) -> Result<Vec<MembershipRequest>, AccessError> {
        self.store.pending_requests(RequestFilter::ForUser(user)).await
    }

    pub async fn requests_for_group(
        &self,
        group: GroupId,
    ) -> Result<Vec<MembershipRequest>, AccessError> {
        self.store.pending_requests(RequestFilter::ForGroup(group)).await
    }

    /// Redeem every pending request for a group, e.g. when it is deactivated.
    /// Returns how many were retired.
    pub async fn retire_pending_requests(&self, group: GroupId) -> Result<usize, AccessError> {
        let mut retired = 0;
        for request in self.requests_for_group(group).await? {
            match self.store.redeem_request(request.id).await {
                Ok(_) => retired += 1,
                // Redeemed concurrently
                Err(AccessError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if retired > 0 {
            info!("Retired {} pending requests for group:{}", retired, group);
        }
        Ok(retired)
    }

    async fn active_group(&self, id: GroupId) -> Result<Group, AccessError> {
        let group = self.resolver.load_group(id).await?;
        if !group.active {
            return Err(AccessError::denied(DenialReason::InactiveGroup));
        }
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryGrantStore;

    struct Fixture {
        store: Arc<InMemoryGrantStore>,
        workflow: GroupMembershipWorkflow,
        owner: Principal,
        group: Group,
    }

    async fn fixture(configure: impl FnOnce(&mut Group)) -> Fixture {
        let store = Arc::new(InMemoryGrantStore::new());
        let resolver = Arc::new(PrivilegeResolver::new(store.clone()));
        let sharing = Arc::new(ShareProtocol::new(store.clone(), resolver.clone()));
        let workflow = GroupMembershipWorkflow::new(store.clone(), resolver, sharing);

        let owner = Principal::new("owner");
        let mut group = Group::new("hydrologists");
        configure(&mut group);
        store.save_principal(owner.clone()).await.unwrap();
        store.save_group(group.clone()).await.unwrap();
        store
            .apply_grant(GrantChange::grant(
                GrantKey::user_group(owner.id, group.id),
                owner.id,
                PrivilegeLevel::Owner,
            ))
            .await
            .unwrap();

        Fixture {
            store,
            workflow,
            owner,
            group,
        }
    }

    async fn user(fx: &Fixture, name: &str) -> Principal {
        let user = Principal::new(name);
        fx.store.save_principal(user.clone()).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_requester_cannot_accept_own_request() {
        let fx = fixture(|_| {}).await;
        let alice = user(&fx, "alice").await;

        let outcome = fx
            .workflow
            .create_request(&alice, fx.group.id, None, None)
            .await
            .unwrap();
        let request = outcome.request().unwrap().clone();

        let err = fx
            .workflow
            .act_on_request(&alice, request.id, true)
            .await
            .unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));

        // Cancelling is allowed
        fx.workflow.act_on_request(&alice, request.id, false).await.unwrap();
        assert!(fx.workflow.requests_for_user(alice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inviter_may_retract() {
        let fx = fixture(|_| {}).await;
        let bob = user(&fx, "bob").await;

        let outcome = fx
            .workflow
            .create_request(&fx.owner, fx.group.id, Some(bob.id), None)
            .await
            .unwrap();
        let invitation = outcome.request().unwrap().clone();
        assert_eq!(fx.workflow.requests_for_user(bob.id).await.unwrap(), vec![invitation.clone()]);

        let err = fx
            .workflow
            .act_on_request(&fx.owner, invitation.id, true)
            .await
            .unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));

        fx.workflow
            .act_on_request(&fx.owner, invitation.id, false)
            .await
            .unwrap();
        assert!(fx.workflow.requests_for_group(fx.group.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explanation_required() {
        let fx = fixture(|g| g.requires_explanation = true).await;
        let alice = user(&fx, "alice").await;

        let err = fx
            .workflow
            .create_request(&alice, fx.group.id, None, Some("   ".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::ExplanationRequired));

        let outcome = fx
            .workflow
            .create_request(&alice, fx.group.id, None, Some("I study rivers".to_string()))
            .await
            .unwrap();
        assert_eq!(
            outcome.request().unwrap().explanation.as_deref(),
            Some("I study rivers")
        );
    }

    #[tokio::test]
    async fn test_retire_pending_requests() {
        let fx = fixture(|_| {}).await;
        for name in ["alice", "bob"] {
            let u = user(&fx, name).await;
            fx.workflow
                .create_request(&u, fx.group.id, None, None)
                .await
                .unwrap();
        }

        assert_eq!(fx.workflow.retire_pending_requests(fx.group.id).await.unwrap(), 2);
        assert!(fx.workflow.requests_for_group(fx.group.id).await.unwrap().is_empty());
    }
}
