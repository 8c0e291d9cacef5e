use crate::error::AccessError;
use crate::privilege::PrivilegeLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a user account
    UserId
);
id_type!(
    /// Identifies a group
    GroupId
);
id_type!(
    /// Identifies a resource
    ResourceId
);
id_type!(
    /// Identifies a group membership request
    RequestId
);

/// A user account as seen by the authorization engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: UserId,
    pub username: String,
    pub is_active: bool,
    pub is_superuser: bool,
}

impl Principal {
    /// An active, non-superuser account
    pub fn new(username: &str) -> Self {
        Self {
            id: UserId::new(),
            username: username.to_string(),
            is_active: true,
            is_superuser: false,
        }
    }

    pub fn superuser(username: &str) -> Self {
        Self {
            is_superuser: true,
            ..Self::new(username)
        }
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user:{}#{}", self.username, self.id)
    }
}

/// A named collection of users that is itself shareable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub public: bool,
    pub discoverable: bool,
    pub active: bool,
    pub shareable: bool,
    /// Self-join requests are granted immediately
    pub auto_approve: bool,
    /// Self-join requests must carry an explanation
    pub requires_explanation: bool,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            id: GroupId::new(),
            name: name.to_string(),
            public: true,
            discoverable: true,
            active: true,
            shareable: true,
            auto_approve: false,
            requires_explanation: false,
        }
    }
}

/// A sharable artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub title: String,
    pub public: bool,
    pub discoverable: bool,
    pub published: bool,
    pub immutable: bool,
    pub shareable: bool,
    /// Set while a new version is being created
    pub locked: bool,
}

impl Resource {
    pub fn new(title: &str) -> Self {
        Self {
            id: ResourceId::new(),
            title: title.to_string(),
            public: false,
            discoverable: false,
            published: false,
            immutable: false,
            shareable: true,
            locked: false,
        }
    }

    /// Published resources are immutable as well
    pub fn is_immutable(&self) -> bool {
        self.immutable || self.published
    }
}

/// Something that can receive a privilege
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Grantee {
    User(UserId),
    Group(GroupId),
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grantee::User(id) => write!(f, "user:{}", id),
            Grantee::Group(id) => write!(f, "group:{}", id),
        }
    }
}

/// Something privileges are granted over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Target {
    Resource(ResourceId),
    Group(GroupId),
}

impl Target {
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Resource(_) => "resource",
            Target::Group(_) => "group",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Target::Resource(id) => id.0,
            Target::Group(id) => id.0,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// The (grantee, target) pair a grant row is keyed by.
///
/// Only three combinations are legal: user over resource, group over
/// resource, user over group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    pub grantee: Grantee,
    pub target: Target,
}

impl GrantKey {
    pub fn new(grantee: Grantee, target: Target) -> Result<Self, AccessError> {
        if let (Grantee::Group(_), Target::Group(_)) = (grantee, target) {
            return Err(AccessError::InvalidPrivilege(
                "groups cannot hold privileges over groups".to_string(),
            ));
        }
        Ok(Self { grantee, target })
    }

    pub fn user_resource(user: UserId, resource: ResourceId) -> Self {
        Self {
            grantee: Grantee::User(user),
            target: Target::Resource(resource),
        }
    }

    pub fn group_resource(group: GroupId, resource: ResourceId) -> Self {
        Self {
            grantee: Grantee::Group(group),
            target: Target::Resource(resource),
        }
    }

    pub fn user_group(user: UserId, group: GroupId) -> Self {
        Self {
            grantee: Grantee::User(user),
            target: Target::Group(group),
        }
    }

    /// Highest level this combination may hold
    pub fn max_privilege(&self) -> PrivilegeLevel {
        match self.grantee {
            Grantee::User(_) => PrivilegeLevel::Owner,
            Grantee::Group(_) => PrivilegeLevel::Change,
        }
    }
}

impl fmt::Display for GrantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.grantee, self.target)
    }
}

/// A recorded privilege of `grantee` over `target`.
///
/// Revoking a grant clears `is_held` and keeps the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub key: GrantKey,
    pub grantor: UserId,
    pub privilege: PrivilegeLevel,
    pub granted_at: DateTime<Utc>,
    pub is_held: bool,
}

impl Grant {
    /// The privilege currently conferred by this row
    pub fn held_privilege(&self) -> PrivilegeLevel {
        if self.is_held {
            self.privilege
        } else {
            PrivilegeLevel::None
        }
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (granted by user:{}{})",
            self.key,
            self.privilege,
            self.grantor,
            if self.is_held { "" } else { ", revoked" }
        )
    }
}

/// One entry of the per-pair action log used to undo shares.
///
/// `privilege` is the level the pair was left at; `None` records an unshare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub key: GrantKey,
    pub grantor: UserId,
    pub privilege: PrivilegeLevel,
    pub recorded_at: DateTime<Utc>,
    /// Written by an undo; such entries cannot themselves be undone
    pub undone: bool,
}

/// A requested change to a grant row, applied atomically by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantChange {
    pub key: GrantKey,
    pub grantor: UserId,
    /// `PrivilegeLevel::None` revokes
    pub privilege: PrivilegeLevel,
    pub undo: bool,
}

impl GrantChange {
    pub fn grant(key: GrantKey, grantor: UserId, privilege: PrivilegeLevel) -> Self {
        Self {
            key,
            grantor,
            privilege,
            undo: false,
        }
    }

    pub fn revoke(key: GrantKey, actor: UserId) -> Self {
        Self::grant(key, actor, PrivilegeLevel::None)
    }

    pub fn undo(key: GrantKey, grantor: UserId, privilege: PrivilegeLevel) -> Self {
        Self {
            undo: true,
            ..Self::grant(key, grantor, privilege)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Redeemed,
}

/// Either an invitation (owner to candidate) or a self-join request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRequest {
    pub id: RequestId,
    pub request_from: UserId,
    pub group_to_join: GroupId,
    /// Set for invitations, `None` for self-join requests
    pub invitation_to: Option<UserId>,
    pub explanation: Option<String>,
    pub redeemed: bool,
    pub created_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl MembershipRequest {
    pub fn invitation(from: UserId, group: GroupId, invitee: UserId) -> Self {
        Self {
            id: RequestId::new(),
            request_from: from,
            group_to_join: group,
            invitation_to: Some(invitee),
            explanation: None,
            redeemed: false,
            created_at: Utc::now(),
            redeemed_at: None,
        }
    }

    pub fn join_request(from: UserId, group: GroupId, explanation: Option<String>) -> Self {
        Self {
            id: RequestId::new(),
            request_from: from,
            group_to_join: group,
            invitation_to: None,
            explanation,
            redeemed: false,
            created_at: Utc::now(),
            redeemed_at: None,
        }
    }

    pub fn is_invitation(&self) -> bool {
        self.invitation_to.is_some()
    }

    /// The user who would become a member
    pub fn candidate(&self) -> UserId {
        self.invitation_to.unwrap_or(self.request_from)
    }

    pub fn state(&self) -> RequestState {
        if self.redeemed {
            RequestState::Redeemed
        } else {
            RequestState::Pending
        }
    }
}

/// Result of creating a membership request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOutcome {
    /// A pending request was stored
    Created(MembershipRequest),
    /// The group auto-approves self-join requests; membership was granted
    /// and no request was stored
    AutoApproved(Grant),
}

impl MembershipOutcome {
    pub fn request(&self) -> Option<&MembershipRequest> {
        match self {
            MembershipOutcome::Created(request) => Some(request),
            MembershipOutcome::AutoApproved(_) => None,
        }
    }
}

/// Selects pending membership requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFilter {
    /// Requests whose candidate is this user
    ForUser(UserId),
    ForGroup(GroupId),
    /// The (candidate, group) pair
    Pair(UserId, GroupId),
}

impl RequestFilter {
    pub fn matches(&self, request: &MembershipRequest) -> bool {
        match *self {
            RequestFilter::ForUser(user) => request.candidate() == user,
            RequestFilter::ForGroup(group) => request.group_to_join == group,
            RequestFilter::Pair(user, group) => {
                request.candidate() == user && request.group_to_join == group
            }
        }
    }
}
