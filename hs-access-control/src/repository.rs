use crate::{error::AccessError, models::*, privilege::PrivilegeLevel};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

pub mod postgres;

pub use postgres::PostgresGrantStore;

/// Persistence for principals, groups, resources, grants and membership
/// requests.
///
/// Mutating grant and request methods are atomic: `apply_grant` refuses to
/// leave a target without an owner and `insert_request` refuses a second
/// pending request for the same (candidate, group) pair, each checked under
/// the same lock or transaction as the write.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn save_principal(&self, principal: Principal) -> Result<(), AccessError>;

    async fn principal(&self, id: UserId) -> Result<Option<Principal>, AccessError>;

    async fn save_group(&self, group: Group) -> Result<(), AccessError>;

    async fn group(&self, id: GroupId) -> Result<Option<Group>, AccessError>;

    async fn save_resource(&self, resource: Resource) -> Result<(), AccessError>;

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>, AccessError>;

    /// Remove a resource together with every grant and log entry on it
    async fn delete_resource(&self, id: ResourceId) -> Result<(), AccessError>;

    /// Remove a group, its memberships, its grants on resources and its
    /// membership requests
    async fn delete_group(&self, id: GroupId) -> Result<(), AccessError>;

    /// The grant row for a pair, held or not
    async fn grant(&self, key: &GrantKey) -> Result<Option<Grant>, AccessError>;

    /// Held grants over a target
    async fn held_grants_on(&self, target: Target) -> Result<Vec<Grant>, AccessError>;

    /// Held grants received by a grantee
    async fn held_grants_of(&self, grantee: Grantee) -> Result<Vec<Grant>, AccessError>;

    /// Upsert (or revoke, for `PrivilegeLevel::None`) a grant and append to
    /// the pair's provenance log.
    ///
    /// Fails with `LastOwner` when the change would leave the target with no
    /// held owner, and with `NotFound` when revoking a pair with no row.
    async fn apply_grant(&self, change: GrantChange) -> Result<Grant, AccessError>;

    /// Provenance log for a pair, oldest first
    async fn provenance(&self, key: &GrantKey) -> Result<Vec<ProvenanceRecord>, AccessError>;

    /// Insert a pending request, failing with `DuplicateRequest` if one is
    /// already pending for the same (candidate, group) pair
    async fn insert_request(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, AccessError>;

    async fn request(&self, id: RequestId) -> Result<Option<MembershipRequest>, AccessError>;

    /// Pending requests matching a filter, oldest first
    async fn pending_requests(
        &self,
        filter: RequestFilter,
    ) -> Result<Vec<MembershipRequest>, AccessError>;

    /// Mark a pending request redeemed; `NotFound` if it is missing or
    /// already redeemed
    async fn redeem_request(&self, id: RequestId) -> Result<MembershipRequest, AccessError>;

    /// Return a redeemed request to pending after a failed acceptance
    async fn reopen_request(&self, id: RequestId) -> Result<(), AccessError>;
}

/// Registry of per-key mutexes so that unrelated keys never contend.
///
/// An entry lives only while some caller holds or waits on it.
struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Run `f` while holding the lock for `key`
    fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        // Entry creation happens under the same shard lock, so a count of
        // one means nobody else can be holding or waiting on this mutex
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

/// In-memory grant store for testing and development
pub struct InMemoryGrantStore {
    principals: DashMap<UserId, Principal>,
    groups: DashMap<GroupId, Group>,
    resources: DashMap<ResourceId, Resource>,
    user_resource: DashMap<(UserId, ResourceId), Grant>,
    group_resource: DashMap<(GroupId, ResourceId), Grant>,
    user_group: DashMap<(UserId, GroupId), Grant>,
    provenance: DashMap<GrantKey, Vec<ProvenanceRecord>>,
    requests: DashMap<RequestId, MembershipRequest>,
    target_locks: KeyedLocks<Target>,
    request_locks: KeyedLocks<(UserId, GroupId)>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self {
            principals: DashMap::new(),
            groups: DashMap::new(),
            resources: DashMap::new(),
            user_resource: DashMap::new(),
            group_resource: DashMap::new(),
            user_group: DashMap::new(),
            provenance: DashMap::new(),
            requests: DashMap::new(),
            target_locks: KeyedLocks::new(),
            request_locks: KeyedLocks::new(),
        }
    }

    fn read_grant(&self, key: &GrantKey) -> Option<Grant> {
        match (key.grantee, key.target) {
            (Grantee::User(u), Target::Resource(r)) => {
                self.user_resource.get(&(u, r)).map(|g| g.value().clone())
            }
            (Grantee::Group(g), Target::Resource(r)) => {
                self.group_resource.get(&(g, r)).map(|g| g.value().clone())
            }
            (Grantee::User(u), Target::Group(g)) => {
                self.user_group.get(&(u, g)).map(|g| g.value().clone())
            }
            (Grantee::Group(_), Target::Group(_)) => None,
        }
    }

    fn write_grant(&self, grant: Grant) -> Result<(), AccessError> {
        match (grant.key.grantee, grant.key.target) {
            (Grantee::User(u), Target::Resource(r)) => {
                self.user_resource.insert((u, r), grant);
            }
            (Grantee::Group(g), Target::Resource(r)) => {
                self.group_resource.insert((g, r), grant);
            }
            (Grantee::User(u), Target::Group(g)) => {
                self.user_group.insert((u, g), grant);
            }
            (Grantee::Group(_), Target::Group(_)) => {
                return Err(AccessError::InvalidPrivilege(
                    "groups cannot hold privileges over groups".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn held_on(&self, target: Target) -> Vec<Grant> {
        let mut grants: Vec<Grant> = match target {
            Target::Resource(resource) => self
                .user_resource
                .iter()
                .filter(|entry| entry.key().1 == resource)
                .map(|entry| entry.value().clone())
                .chain(
                    self.group_resource
                        .iter()
                        .filter(|entry| entry.key().1 == resource)
                        .map(|entry| entry.value().clone()),
                )
                .collect(),
            Target::Group(group) => self
                .user_group
                .iter()
                .filter(|entry| entry.key().1 == group)
                .map(|entry| entry.value().clone())
                .collect(),
        };
        grants.retain(|g| g.is_held);
        grants.sort_by_key(|g| g.granted_at);
        grants
    }

    fn owner_count(&self, target: Target) -> usize {
        self.held_on(target)
            .iter()
            .filter(|g| g.privilege == PrivilegeLevel::Owner)
            .count()
    }

    fn apply_locked(&self, change: GrantChange) -> Result<Grant, AccessError> {
        let target = change.key.target.clone();
        self.target_locks
            .with_lock(&target, || self.apply_unlocked(change))
    }

    fn apply_unlocked(&self, change: GrantChange) -> Result<Grant, AccessError> {
        let key = change.key;
        let current = self.read_grant(&key);
        let current_level = current
            .as_ref()
            .map(Grant::held_privilege)
            .unwrap_or_default();

        if current_level == PrivilegeLevel::Owner
            && change.privilege < PrivilegeLevel::Owner
            && self.owner_count(key.target) <= 1
        {
            return Err(AccessError::LastOwner(key.target));
        }

        let now = Utc::now();
        let grant = match (current, change.privilege) {
            (None, PrivilegeLevel::None) => {
                return Err(AccessError::NotFound(format!("grant {}", key)));
            }
            (Some(mut existing), PrivilegeLevel::None) => {
                existing.is_held = false;
                existing
            }
            (_, privilege) => Grant {
                key,
                grantor: change.grantor,
                privilege,
                granted_at: now,
                is_held: true,
            },
        };

        self.write_grant(grant.clone())?;
        self.provenance.entry(key).or_default().push(ProvenanceRecord {
            key,
            grantor: change.grantor,
            privilege: change.privilege,
            recorded_at: now,
            undone: change.undo,
        });

        debug!("Applied grant change: {}", grant);
        Ok(grant)
    }

    fn pending_for_pair(&self, candidate: UserId, group: GroupId, except: Option<RequestId>) -> bool {
        let filter = RequestFilter::Pair(candidate, group);
        self.requests.iter().any(|entry| {
            let request = entry.value();
            Some(request.id) != except
                && request.state() == RequestState::Pending
                && filter.matches(request)
        })
    }

    fn insert_request_locked(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, AccessError> {
        let pair = (request.candidate(), request.group_to_join);
        self.request_locks.with_lock(&pair, || {
            if self.pending_for_pair(pair.0, pair.1, None) {
                return Err(AccessError::DuplicateRequest(format!(
                    "user:{} already has a pending request for group:{}",
                    pair.0, pair.1
                )));
            }

            self.requests.insert(request.id, request.clone());
            Ok(request)
        })
    }

    /// Flip a request between pending and redeemed under its pair lock.
    ///
    /// Reopening is refused while another request for the pair is pending.
    fn set_redeemed(&self, id: RequestId, redeemed: bool) -> Result<MembershipRequest, AccessError> {
        let pair = self
            .requests
            .get(&id)
            .map(|r| (r.candidate(), r.group_to_join))
            .ok_or_else(|| AccessError::NotFound(format!("membership request {}", id)))?;

        self.request_locks.with_lock(&pair, || {
            if !redeemed && self.pending_for_pair(pair.0, pair.1, Some(id)) {
                return Err(AccessError::DuplicateRequest(format!(
                    "request {} cannot be reopened while another is pending",
                    id
                )));
            }

            let mut entry = self
                .requests
                .get_mut(&id)
                .ok_or_else(|| AccessError::NotFound(format!("membership request {}", id)))?;
            let wanted = if redeemed {
                RequestState::Pending
            } else {
                RequestState::Redeemed
            };
            if entry.state() != wanted {
                return Err(AccessError::NotFound(format!(
                    "{} membership request {}",
                    if redeemed { "pending" } else { "redeemed" },
                    id
                )));
            }
            entry.redeemed = redeemed;
            entry.redeemed_at = if redeemed { Some(Utc::now()) } else { None };
            Ok(entry.value().clone())
        })
    }
}

impl Default for InMemoryGrantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn save_principal(&self, principal: Principal) -> Result<(), AccessError> {
        self.principals.insert(principal.id, principal);
        Ok(())
    }

    async fn principal(&self, id: UserId) -> Result<Option<Principal>, AccessError> {
        Ok(self.principals.get(&id).map(|p| p.value().clone()))
    }

    async fn save_group(&self, group: Group) -> Result<(), AccessError> {
        self.groups.insert(group.id, group);
        Ok(())
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>, AccessError> {
        Ok(self.groups.get(&id).map(|g| g.value().clone()))
    }

    async fn save_resource(&self, resource: Resource) -> Result<(), AccessError> {
        self.resources.insert(resource.id, resource);
        Ok(())
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>, AccessError> {
        Ok(self.resources.get(&id).map(|r| r.value().clone()))
    }

    async fn delete_resource(&self, id: ResourceId) -> Result<(), AccessError> {
        let target = Target::Resource(id);
        self.target_locks.with_lock(&target, || {
            self.user_resource.retain(|(_, r), _| *r != id);
            self.group_resource.retain(|(_, r), _| *r != id);
            self.provenance.retain(|key, _| key.target != target);
            self.resources.remove(&id);
        });
        Ok(())
    }

    async fn delete_group(&self, id: GroupId) -> Result<(), AccessError> {
        let target = Target::Group(id);
        self.target_locks.with_lock(&target, || {
            self.user_group.retain(|(_, g), _| *g != id);
            self.group_resource.retain(|(g, _), _| *g != id);
            self.provenance
                .retain(|key, _| key.target != target && key.grantee != Grantee::Group(id));
            self.requests.retain(|_, r| r.group_to_join != id);
            self.groups.remove(&id);
        });
        Ok(())
    }

    async fn grant(&self, key: &GrantKey) -> Result<Option<Grant>, AccessError> {
        Ok(self.read_grant(key))
    }

    async fn held_grants_on(&self, target: Target) -> Result<Vec<Grant>, AccessError> {
        Ok(self.held_on(target))
    }

    async fn held_grants_of(&self, grantee: Grantee) -> Result<Vec<Grant>, AccessError> {
        let mut grants: Vec<Grant> = match grantee {
            Grantee::User(user) => self
                .user_resource
                .iter()
                .filter(|entry| entry.key().0 == user)
                .map(|entry| entry.value().clone())
                .chain(
                    self.user_group
                        .iter()
                        .filter(|entry| entry.key().0 == user)
                        .map(|entry| entry.value().clone()),
                )
                .collect(),
            Grantee::Group(group) => self
                .group_resource
                .iter()
                .filter(|entry| entry.key().0 == group)
                .map(|entry| entry.value().clone())
                .collect(),
        };
        grants.retain(|g| g.is_held);
        grants.sort_by_key(|g| g.granted_at);
        Ok(grants)
    }

    async fn apply_grant(&self, change: GrantChange) -> Result<Grant, AccessError> {
        self.apply_locked(change)
    }

    async fn provenance(&self, key: &GrantKey) -> Result<Vec<ProvenanceRecord>, AccessError> {
        Ok(self
            .provenance
            .get(key)
            .map(|records| records.value().clone())
            .unwrap_or_default())
    }

    async fn insert_request(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, AccessError> {
        self.insert_request_locked(request)
    }

    async fn request(&self, id: RequestId) -> Result<Option<MembershipRequest>, AccessError> {
        Ok(self.requests.get(&id).map(|r| r.value().clone()))
    }

    async fn pending_requests(
        &self,
        filter: RequestFilter,
    ) -> Result<Vec<MembershipRequest>, AccessError> {
        let mut requests: Vec<MembershipRequest> = self
            .requests
            .iter()
            .filter(|entry| {
                entry.value().state() == RequestState::Pending && filter.matches(entry.value())
            })
            .map(|entry| entry.value().clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }

    async fn redeem_request(&self, id: RequestId) -> Result<MembershipRequest, AccessError> {
        self.set_redeemed(id, true)
    }

    async fn reopen_request(&self, id: RequestId) -> Result<(), AccessError> {
        self.set_redeemed(id, false).map(|_| ())
    }
}
