use crate::{
    error::AccessError,
    models::*,
    privilege::PrivilegeLevel,
    repository::GrantStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Lists who holds an exact privilege level through explicit grants.
///
/// "Explicit" means a held grant at exactly the requested level, either
/// directly or through membership in a group holding it. Users who own the
/// target directly are never reported as group-granted holders.
pub struct ExplicitAccess {
    store: Arc<dyn GrantStore>,
}

impl ExplicitAccess {
    pub fn new(store: Arc<dyn GrantStore>) -> Self {
        Self { store }
    }

    /// Active users holding `level` over `target`.
    ///
    /// Returns an empty set when both sources are excluded.
    pub async fn users_with_explicit_access(
        &self,
        target: Target,
        level: PrivilegeLevel,
        include_user_granted: bool,
        include_group_granted: bool,
    ) -> Result<HashSet<Principal>, AccessError> {
        let mut users = HashSet::new();
        if !include_user_granted && !include_group_granted {
            return Ok(users);
        }

        let grants = self.store.held_grants_on(target).await?;

        if include_user_granted {
            for grant in grants.iter().filter(|g| g.privilege == level) {
                if let Grantee::User(user) = grant.key.grantee {
                    self.push_active(&mut users, user).await?;
                }
            }
        }

        // Groups only hold grants over resources
        if include_group_granted && matches!(target, Target::Resource(_)) {
            let owners: HashSet<UserId> = grants
                .iter()
                .filter(|g| g.privilege == PrivilegeLevel::Owner)
                .filter_map(|g| match g.key.grantee {
                    Grantee::User(user) => Some(user),
                    Grantee::Group(_) => None,
                })
                .collect();

            for grant in grants.iter().filter(|g| g.privilege == level) {
                let Grantee::Group(group_id) = grant.key.grantee else {
                    continue;
                };
                match self.store.group(group_id).await? {
                    Some(group) if group.active => {}
                    _ => continue,
                }

                for membership in self.store.held_grants_on(Target::Group(group_id)).await? {
                    if let Grantee::User(user) = membership.key.grantee {
                        if !owners.contains(&user) {
                            self.push_active(&mut users, user).await?;
                        }
                    }
                }
            }
        }

        debug!("{} users hold explicit {} on {}", users.len(), level, target);
        Ok(users)
    }

    /// Resources over which `user` holds exactly `level`, directly or via an
    /// active group. Resources the user owns directly are never listed via
    /// groups.
    pub async fn resources_with_explicit_access(
        &self,
        user: UserId,
        level: PrivilegeLevel,
        via_user: bool,
        via_group: bool,
    ) -> Result<Vec<ResourceId>, AccessError> {
        let mut resources = Vec::new();
        if !via_user && !via_group {
            return Ok(resources);
        }

        let grants = self.store.held_grants_of(Grantee::User(user)).await?;
        let mut seen = HashSet::new();

        if via_user {
            for grant in grants.iter().filter(|g| g.privilege == level) {
                if let Target::Resource(resource) = grant.key.target {
                    if seen.insert(resource) {
                        resources.push(resource);
                    }
                }
            }
        }

        if via_group {
            let owned: HashSet<ResourceId> = grants
                .iter()
                .filter(|g| g.privilege == PrivilegeLevel::Owner)
                .filter_map(|g| match g.key.target {
                    Target::Resource(resource) => Some(resource),
                    Target::Group(_) => None,
                })
                .collect();

            for membership in &grants {
                let Target::Group(group_id) = membership.key.target else {
                    continue;
                };
                match self.store.group(group_id).await? {
                    Some(group) if group.active => {}
                    _ => continue,
                }

                for grant in self.store.held_grants_of(Grantee::Group(group_id)).await? {
                    if grant.privilege != level {
                        continue;
                    }
                    if let Target::Resource(resource) = grant.key.target {
                        if !owned.contains(&resource) && seen.insert(resource) {
                            resources.push(resource);
                        }
                    }
                }
            }
        }

        Ok(resources)
    }

    /// Active groups holding exactly `level` over a resource
    pub async fn groups_with_explicit_access(
        &self,
        resource: ResourceId,
        level: PrivilegeLevel,
    ) -> Result<Vec<Group>, AccessError> {
        let mut groups = Vec::new();
        for grant in self.store.held_grants_on(Target::Resource(resource)).await? {
            if grant.privilege != level {
                continue;
            }
            if let Grantee::Group(group_id) = grant.key.grantee {
                if let Some(group) = self.store.group(group_id).await? {
                    if group.active {
                        groups.push(group);
                    }
                }
            }
        }
        Ok(groups)
    }

    async fn push_active(
        &self,
        users: &mut HashSet<Principal>,
        user: UserId,
    ) -> Result<(), AccessError> {
        if let Some(principal) = self.store.principal(user).await? {
            if principal.is_active {
                users.insert(principal);
            }
        }
        Ok(())
    }
}
