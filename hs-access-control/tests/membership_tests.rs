use hs_access_control::*;
use std::sync::Arc;

async fn setup() -> (AccessControl, Principal, Group) {
    let access = AccessControl::new(Arc::new(InMemoryGrantStore::new()));
    let owner = Principal::new("owner");
    access.register_principal(owner.clone()).await.unwrap();
    let group = Group::new("CUAHSI");
    access.create_group(&owner, group.clone()).await.unwrap();
    (access, owner, group)
}

async fn user(access: &AccessControl, name: &str) -> Principal {
    let user = Principal::new(name);
    access.register_principal(user.clone()).await.unwrap();
    user
}

#[tokio::test]
async fn test_join_request_accepted_then_rejoin() {
    let (access, owner, group) = setup().await;
    let alice = user(&access, "alice").await;

    let outcome = access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap();
    let request = outcome.request().unwrap().clone();
    assert_eq!(request.state(), RequestState::Pending);
    assert_eq!(
        access.group_membership_requests_for_group(group.id).await.unwrap().len(),
        1
    );

    let before = access.group_members(group.id).await.unwrap().len();
    access
        .act_on_group_membership_request(&owner, request.id, true)
        .await
        .unwrap();

    assert_eq!(access.group_members(group.id).await.unwrap().len(), before + 1);
    assert!(access
        .group_membership_requests_for_group(group.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        access
            .effective_privilege(&alice, Target::Group(group.id))
            .await
            .unwrap(),
        PrivilegeLevel::View
    );

    // A redeemed request cannot be acted on again
    let err = access
        .act_on_group_membership_request(&owner, request.id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::NotFound(_)));

    // Members cannot ask to join
    let err = access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::DuplicateRequest(_)));

    // After leaving, asking again creates a fresh request
    access
        .unshare(&alice, Grantee::User(alice.id), Target::Group(group.id))
        .await
        .unwrap();
    let again = access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap();
    let fresh = again.request().unwrap();
    assert_ne!(fresh.id, request.id);
    assert_eq!(
        access.group_membership_requests_for_group(group.id).await.unwrap(),
        vec![fresh.clone()]
    );
}

#[tokio::test]
async fn test_double_invitation_is_duplicate() {
    let (access, owner, group) = setup().await;
    let bob = user(&access, "bob").await;

    access
        .create_group_membership_request(&owner, group.id, Some(bob.id), None)
        .await
        .unwrap();
    let err = access
        .create_group_membership_request(&owner, group.id, Some(bob.id), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::DuplicateRequest(_)));

    // Asking to join while invited is a duplicate in the other direction
    let err = access
        .create_group_membership_request(&bob, group.id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::DuplicateRequest(_)));
}

#[tokio::test]
async fn test_invitation_accepted_by_invitee() {
    let (access, owner, group) = setup().await;
    let bob = user(&access, "bob").await;

    let outcome = access
        .create_group_membership_request(&owner, group.id, Some(bob.id), None)
        .await
        .unwrap();
    let invitation = outcome.request().unwrap().clone();
    assert!(invitation.is_invitation());
    assert_eq!(
        access.group_membership_requests_for_user(bob.id).await.unwrap(),
        vec![invitation.clone()]
    );

    access
        .act_on_group_membership_request(&bob, invitation.id, true)
        .await
        .unwrap();

    let grant = access
        .store()
        .grant(&GrantKey::user_group(bob.id, group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(grant.held_privilege(), PrivilegeLevel::View);
    assert_eq!(grant.grantor, owner.id);
    assert!(access
        .group_membership_requests_for_user(bob.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invitation_declined() {
    let (access, owner, group) = setup().await;
    let bob = user(&access, "bob").await;

    let outcome = access
        .create_group_membership_request(&owner, group.id, Some(bob.id), None)
        .await
        .unwrap();
    let invitation = outcome.request().unwrap().clone();

    access
        .act_on_group_membership_request(&bob, invitation.id, false)
        .await
        .unwrap();
    assert!(access
        .store()
        .grant(&GrantKey::user_group(bob.id, group.id))
        .await
        .unwrap()
        .is_none());
    assert!(access
        .group_membership_requests_for_group(group.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_only_owners_invite() {
    let (access, _owner, group) = setup().await;
    let alice = user(&access, "alice").await;
    let bob = user(&access, "bob").await;

    let err = access
        .create_group_membership_request(&alice, group.id, Some(bob.id), None)
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));
}

#[tokio::test]
async fn test_only_owners_answer_join_requests() {
    let (access, _owner, group) = setup().await;
    let alice = user(&access, "alice").await;
    let bob = user(&access, "bob").await;

    let outcome = access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap();
    let request = outcome.request().unwrap().clone();

    let err = access
        .act_on_group_membership_request(&bob, request.id, true)
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));
    let err = access
        .act_on_group_membership_request(&bob, request.id, false)
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));
    assert_eq!(
        access.group_membership_requests_for_user(alice.id).await.unwrap(),
        vec![request]
    );
}

#[tokio::test]
async fn test_auto_approve_grants_immediately() {
    let access = AccessControl::new(Arc::new(InMemoryGrantStore::new()));
    let owner = user(&access, "owner").await;
    let alice = user(&access, "alice").await;

    let mut group = Group::new("open lab");
    group.auto_approve = true;
    access.create_group(&owner, group.clone()).await.unwrap();

    let outcome = access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap();
    let grant = match outcome {
        MembershipOutcome::AutoApproved(grant) => grant,
        other => panic!("expected auto-approval, got {:?}", other),
    };
    assert_eq!(grant.key, GrantKey::user_group(alice.id, group.id));
    assert_eq!(grant.privilege, PrivilegeLevel::View);
    assert_eq!(grant.grantor, owner.id);
    assert!(access
        .group_membership_requests_for_group(group.id)
        .await
        .unwrap()
        .is_empty());

    // Invitations are never auto-approved
    let bob = user(&access, "bob").await;
    let outcome = access
        .create_group_membership_request(&owner, group.id, Some(bob.id), None)
        .await
        .unwrap();
    assert!(outcome.request().is_some());
}

#[tokio::test]
async fn test_inactive_group_refuses_requests() {
    let (access, owner, group) = setup().await;
    let alice = user(&access, "alice").await;
    let bob = user(&access, "bob").await;

    access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap();
    access.set_group_active(&owner, group.id, false).await.unwrap();

    // Deactivation retired the pending request
    assert!(access
        .group_membership_requests_for_user(alice.id)
        .await
        .unwrap()
        .is_empty());

    let err = access
        .create_group_membership_request(&bob, group.id, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::InactiveGroup));
}

#[tokio::test]
async fn test_inactive_requester_rejected() {
    let (access, _owner, group) = setup().await;
    let gone = Principal::new("gone").deactivated();
    access.register_principal(gone.clone()).await.unwrap();

    let err = access
        .create_group_membership_request(&gone, group.id, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::InactiveUser));
}

#[tokio::test]
async fn test_deleting_group_removes_requests() {
    let (access, owner, group) = setup().await;
    let alice = user(&access, "alice").await;

    access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap();
    access.delete_group(&owner, group.id).await.unwrap();

    assert!(access
        .group_membership_requests_for_user(alice.id)
        .await
        .unwrap()
        .is_empty());
    let err = access
        .create_group_membership_request(&alice, group.id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::NotFound(_)));
}

#[tokio::test]
async fn test_invitation_from_deactivated_owner_granted_by_co_owner() {
    let (access, owner, group) = setup().await;
    let carol = user(&access, "carol").await;
    let bob = user(&access, "bob").await;
    access
        .share(&owner, Grantee::User(carol.id), Target::Group(group.id), PrivilegeLevel::Owner)
        .await
        .unwrap();

    let invitation = access
        .create_group_membership_request(&owner, group.id, Some(bob.id), None)
        .await
        .unwrap()
        .request()
        .unwrap()
        .clone();
    access
        .register_principal(owner.clone().deactivated())
        .await
        .unwrap();

    access
        .act_on_group_membership_request(&bob, invitation.id, true)
        .await
        .unwrap();

    let grant = access
        .store()
        .grant(&GrantKey::user_group(bob.id, group.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(grant.held_privilege(), PrivilegeLevel::View);
    assert_eq!(grant.grantor, carol.id);
    assert!(access
        .group_membership_requests_for_user(bob.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_invitation_without_active_owner_stays_pending() {
    let (access, owner, group) = setup().await;
    let bob = user(&access, "bob").await;

    let invitation = access
        .create_group_membership_request(&owner, group.id, Some(bob.id), None)
        .await
        .unwrap()
        .request()
        .unwrap()
        .clone();
    access
        .register_principal(owner.clone().deactivated())
        .await
        .unwrap();

    let err = access
        .act_on_group_membership_request(&bob, invitation.id, true)
        .await
        .unwrap_err();
    assert_eq!(err.denial_reason(), Some(DenialReason::InsufficientPrivilege));
    assert_eq!(
        access.group_membership_requests_for_user(bob.id).await.unwrap(),
        vec![invitation]
    );
}
