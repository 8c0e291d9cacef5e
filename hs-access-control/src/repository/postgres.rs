//! PostgreSQL-backed grant store
//!
//! Grants live in three relation tables (user/resource, group/resource,
//! user/group). Each mutation runs in its own transaction:
//! - grant changes lock the target's held owner rows and the grant row
//!   with `FOR UPDATE` before the last-owner check
//! - a partial unique index rejects a second pending membership request
//! - request redemption is a compare-and-set on `redeemed`

use crate::{
    error::AccessError,
    models::*,
    privilege::PrivilegeLevel,
    repository::GrantStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

/// Table and column names for one grant relation
struct GrantTable {
    table: &'static str,
    grantee_col: &'static str,
    target_col: &'static str,
}

const USER_RESOURCE: GrantTable = GrantTable {
    table: "user_resource_privileges",
    grantee_col: "user_id",
    target_col: "resource_id",
};

const GROUP_RESOURCE: GrantTable = GrantTable {
    table: "group_resource_privileges",
    grantee_col: "group_id",
    target_col: "resource_id",
};

const USER_GROUP: GrantTable = GrantTable {
    table: "user_group_privileges",
    grantee_col: "user_id",
    target_col: "group_id",
};

impl GrantTable {
    fn for_key(key: &GrantKey) -> Result<&'static GrantTable, AccessError> {
        match (key.grantee, key.target) {
            (Grantee::User(_), Target::Resource(_)) => Ok(&USER_RESOURCE),
            (Grantee::Group(_), Target::Resource(_)) => Ok(&GROUP_RESOURCE),
            (Grantee::User(_), Target::Group(_)) => Ok(&USER_GROUP),
            (Grantee::Group(_), Target::Group(_)) => Err(AccessError::InvalidPrivilege(
                "groups cannot hold privileges over groups".to_string(),
            )),
        }
    }

    /// The relation holding owners of a target
    fn owners_of(target: Target) -> &'static GrantTable {
        match target {
            Target::Resource(_) => &USER_RESOURCE,
            Target::Group(_) => &USER_GROUP,
        }
    }

    fn select_sql(&self, filter: &str) -> String {
        format!(
            "SELECT {g} AS grantee_id, {t} AS target_id, grantor_id, privilege, granted_at, is_held \
             FROM {table} WHERE {filter}",
            g = self.grantee_col,
            t = self.target_col,
            table = self.table,
            filter = filter,
        )
    }

    fn key(&self, grantee_id: Uuid, target_id: Uuid) -> GrantKey {
        let grantee = if self.grantee_col == "group_id" {
            Grantee::Group(GroupId(grantee_id))
        } else {
            Grantee::User(UserId(grantee_id))
        };
        let target = if self.target_col == "group_id" {
            Target::Group(GroupId(target_id))
        } else {
            Target::Resource(ResourceId(target_id))
        };
        GrantKey { grantee, target }
    }

    fn grant_from_row(&self, row: &PgRow) -> Result<Grant, AccessError> {
        let privilege: String = row.try_get("privilege")?;
        Ok(Grant {
            key: self.key(row.try_get("grantee_id")?, row.try_get("target_id")?),
            grantor: UserId(row.try_get("grantor_id")?),
            privilege: privilege.parse()?,
            granted_at: row.try_get("granted_at")?,
            is_held: row.try_get("is_held")?,
        })
    }
}

fn grantee_parts(grantee: Grantee) -> (&'static str, Uuid) {
    match grantee {
        Grantee::User(id) => ("user", id.0),
        Grantee::Group(id) => ("group", id.0),
    }
}

fn grantee_from_parts(kind: &str, id: Uuid) -> Result<Grantee, AccessError> {
    match kind {
        "user" => Ok(Grantee::User(UserId(id))),
        "group" => Ok(Grantee::Group(GroupId(id))),
        other => Err(AccessError::StorageError(format!(
            "unknown grantee kind '{}'",
            other
        ))),
    }
}

fn target_from_parts(kind: &str, id: Uuid) -> Result<Target, AccessError> {
    match kind {
        "resource" => Ok(Target::Resource(ResourceId(id))),
        "group" => Ok(Target::Group(GroupId(id))),
        other => Err(AccessError::StorageError(format!(
            "unknown target kind '{}'",
            other
        ))),
    }
}

fn request_from_row(row: &PgRow) -> Result<MembershipRequest, AccessError> {
    Ok(MembershipRequest {
        id: RequestId(row.try_get("id")?),
        request_from: UserId(row.try_get("request_from")?),
        group_to_join: GroupId(row.try_get("group_to_join")?),
        invitation_to: row.try_get::<Option<Uuid>, _>("invitation_to")?.map(UserId),
        explanation: row.try_get("explanation")?,
        redeemed: row.try_get("redeemed")?,
        created_at: row.try_get("created_at")?,
        redeemed_at: row.try_get::<Option<DateTime<Utc>>, _>("redeemed_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNIQUE_VIOLATION),
        _ => false,
    }
}

const REQUEST_COLUMNS: &str =
    "id, request_from, group_to_join, invitation_to, explanation, redeemed, created_at, redeemed_at";

/// PostgreSQL-backed grant store
pub struct PostgresGrantStore {
    pool: PgPool,
}

impl PostgresGrantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create with connection string
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AccessError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| AccessError::StorageError(format!("Failed to connect: {}", e)))?;

        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), AccessError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AccessError::StorageError(format!("Migration failed: {}", e)))?;
        info!("Access control schema is up to date");
        Ok(())
    }

    async fn held_in(
        &self,
        table: &GrantTable,
        column: &str,
        id: Uuid,
    ) -> Result<Vec<Grant>, AccessError> {
        let sql = format!(
            "{} ORDER BY granted_at",
            table.select_sql(&format!("{} = $1 AND is_held", column))
        );
        let rows = sqlx::query(&sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(|row| table.grant_from_row(row)).collect()
    }
}

#[async_trait]
impl GrantStore for PostgresGrantStore {
    async fn save_principal(&self, principal: Principal) -> Result<(), AccessError> {
        sqlx::query(
            r#"
            INSERT INTO principals (id, username, is_active, is_superuser)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                username = EXCLUDED.username,
                is_active = EXCLUDED.is_active,
                is_superuser = EXCLUDED.is_superuser
            "#,
        )
        .bind(principal.id.0)
        .bind(&principal.username)
        .bind(principal.is_active)
        .bind(principal.is_superuser)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn principal(&self, id: UserId) -> Result<Option<Principal>, AccessError> {
        let row = sqlx::query(
            "SELECT id, username, is_active, is_superuser FROM principals WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Principal {
                id: UserId(row.try_get("id")?),
                username: row.try_get("username")?,
                is_active: row.try_get("is_active")?,
                is_superuser: row.try_get("is_superuser")?,
            })
        })
        .transpose()
    }

    async fn save_group(&self, group: Group) -> Result<(), AccessError> {
        sqlx::query(
            r#"
            INSERT INTO access_groups (
                id, name, public, discoverable, active, shareable,
                auto_approve, requires_explanation
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                public = EXCLUDED.public,
                discoverable = EXCLUDED.discoverable,
                active = EXCLUDED.active,
                shareable = EXCLUDED.shareable,
                auto_approve = EXCLUDED.auto_approve,
                requires_explanation = EXCLUDED.requires_explanation
            "#,
        )
        .bind(group.id.0)
        .bind(&group.name)
        .bind(group.public)
        .bind(group.discoverable)
        .bind(group.active)
        .bind(group.shareable)
        .bind(group.auto_approve)
        .bind(group.requires_explanation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>, AccessError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, public, discoverable, active, shareable,
                   auto_approve, requires_explanation
            FROM access_groups WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Group {
                id: GroupId(row.try_get("id")?),
                name: row.try_get("name")?,
                public: row.try_get("public")?,
                discoverable: row.try_get("discoverable")?,
                active: row.try_get("active")?,
                shareable: row.try_get("shareable")?,
                auto_approve: row.try_get("auto_approve")?,
                requires_explanation: row.try_get("requires_explanation")?,
            })
        })
        .transpose()
    }

    async fn save_resource(&self, resource: Resource) -> Result<(), AccessError> {
        sqlx::query(
            r#"
            INSERT INTO resources (
                id, title, public, discoverable, published, immutable, shareable, locked
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                public = EXCLUDED.public,
                discoverable = EXCLUDED.discoverable,
                published = EXCLUDED.published,
                immutable = EXCLUDED.immutable,
                shareable = EXCLUDED.shareable,
                locked = EXCLUDED.locked
            "#,
        )
        .bind(resource.id.0)
        .bind(&resource.title)
        .bind(resource.public)
        .bind(resource.discoverable)
        .bind(resource.published)
        .bind(resource.immutable)
        .bind(resource.shareable)
        .bind(resource.locked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>, AccessError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, public, discoverable, published, immutable, shareable, locked
            FROM resources WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(Resource {
                id: ResourceId(row.try_get("id")?),
                title: row.try_get("title")?,
                public: row.try_get("public")?,
                discoverable: row.try_get("discoverable")?,
                published: row.try_get("published")?,
                immutable: row.try_get("immutable")?,
                shareable: row.try_get("shareable")?,
                locked: row.try_get("locked")?,
            })
        })
        .transpose()
    }

    async fn delete_resource(&self, id: ResourceId) -> Result<(), AccessError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM privilege_provenance WHERE target_kind = 'resource' AND target_id = $1",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        // Grants cascade with the resource row
        sqlx::query("DELETE FROM resources WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("Deleted resource {} and its grants", id);
        Ok(())
    }

    async fn delete_group(&self, id: GroupId) -> Result<(), AccessError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM privilege_provenance
            WHERE (target_kind = 'group' AND target_id = $1)
               OR (grantee_kind = 'group' AND grantee_id = $1)
            "#,
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        // Memberships, group grants and requests cascade with the group row
        sqlx::query("DELETE FROM access_groups WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!("Deleted group {} with its memberships and requests", id);
        Ok(())
    }

    async fn grant(&self, key: &GrantKey) -> Result<Option<Grant>, AccessError> {
        let table = GrantTable::for_key(key)?;
        let (_, grantee_id) = grantee_parts(key.grantee);
        let sql = table.select_sql(&format!(
            "{} = $1 AND {} = $2",
            table.grantee_col, table.target_col
        ));

        let row = sqlx::query(&sql)
            .bind(grantee_id)
            .bind(key.target.id())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| table.grant_from_row(&row)).transpose()
    }

    async fn held_grants_on(&self, target: Target) -> Result<Vec<Grant>, AccessError> {
        let mut grants = match target {
            Target::Resource(id) => {
                let mut grants = self.held_in(&USER_RESOURCE, "resource_id", id.0).await?;
                grants.extend(self.held_in(&GROUP_RESOURCE, "resource_id", id.0).await?);
                grants
            }
            Target::Group(id) => self.held_in(&USER_GROUP, "group_id", id.0).await?,
        };
        grants.sort_by_key(|g| g.granted_at);
        Ok(grants)
    }

    async fn held_grants_of(&self, grantee: Grantee) -> Result<Vec<Grant>, AccessError> {
        let mut grants = match grantee {
            Grantee::User(id) => {
                let mut grants = self.held_in(&USER_RESOURCE, "user_id", id.0).await?;
                grants.extend(self.held_in(&USER_GROUP, "user_id", id.0).await?);
                grants
            }
            Grantee::Group(id) => self.held_in(&GROUP_RESOURCE, "group_id", id.0).await?,
        };
        grants.sort_by_key(|g| g.granted_at);
        Ok(grants)
    }

    async fn apply_grant(&self, change: GrantChange) -> Result<Grant, AccessError> {
        let key = change.key;
        let table = GrantTable::for_key(&key)?;
        let owners_table = GrantTable::owners_of(key.target);
        let (grantee_kind, grantee_id) = grantee_parts(key.grantee);
        let target_id = key.target.id();

        debug!("Applying grant change in PostgreSQL: {} -> {}", key, change.privilege);

        let mut tx = self.pool.begin().await?;

        // Serialize against every other change touching this target's owners
        let owners: Vec<Uuid> = sqlx::query_scalar(&format!(
            "SELECT {g} FROM {table} WHERE {t} = $1 AND privilege = 'owner' AND is_held FOR UPDATE",
            g = owners_table.grantee_col,
            table = owners_table.table,
            t = owners_table.target_col,
        ))
        .bind(target_id)
        .fetch_all(&mut *tx)
        .await?;

        let current_sql = format!(
            "{} FOR UPDATE",
            table.select_sql(&format!(
                "{} = $1 AND {} = $2",
                table.grantee_col, table.target_col
            ))
        );
        let current = sqlx::query(&current_sql)
            .bind(grantee_id)
            .bind(target_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| table.grant_from_row(&row))
            .transpose()?;

        let current_level = current
            .as_ref()
            .map(Grant::held_privilege)
            .unwrap_or_default();
        if current_level == PrivilegeLevel::Owner
            && change.privilege < PrivilegeLevel::Owner
            && owners.len() <= 1
        {
            // Dropping the transaction rolls it back
            return Err(AccessError::LastOwner(key.target));
        }

        let now = Utc::now();
        let grant = match (current, change.privilege) {
            (None, PrivilegeLevel::None) => {
                return Err(AccessError::NotFound(format!("grant {}", key)));
            }
            (Some(mut existing), PrivilegeLevel::None) => {
                sqlx::query(&format!(
                    "UPDATE {} SET is_held = FALSE WHERE {} = $1 AND {} = $2",
                    table.table, table.grantee_col, table.target_col
                ))
                .bind(grantee_id)
                .bind(target_id)
                .execute(&mut *tx)
                .await?;
                existing.is_held = false;
                existing
            }
            (_, privilege) => {
                sqlx::query(&format!(
                    "INSERT INTO {table} ({g}, {t}, grantor_id, privilege, granted_at, is_held) \
                     VALUES ($1, $2, $3, $4, $5, TRUE) \
                     ON CONFLICT ({g}, {t}) DO UPDATE SET \
                        grantor_id = EXCLUDED.grantor_id, \
                        privilege = EXCLUDED.privilege, \
                        granted_at = EXCLUDED.granted_at, \
                        is_held = TRUE",
                    table = table.table,
                    g = table.grantee_col,
                    t = table.target_col,
                ))
                .bind(grantee_id)
                .bind(target_id)
                .bind(change.grantor.0)
                .bind(privilege.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;

                Grant {
                    key,
                    grantor: change.grantor,
                    privilege,
                    granted_at: now,
                    is_held: true,
                }
            }
        };

        sqlx::query(
            r#"
            INSERT INTO privilege_provenance (
                grantee_kind, grantee_id, target_kind, target_id,
                grantor_id, privilege, recorded_at, undone
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(grantee_kind)
        .bind(grantee_id)
        .bind(key.target.kind())
        .bind(target_id)
        .bind(change.grantor.0)
        .bind(change.privilege.as_str())
        .bind(now)
        .bind(change.undo)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!("Grant change committed: {}", grant);
        Ok(grant)
    }

    async fn provenance(&self, key: &GrantKey) -> Result<Vec<ProvenanceRecord>, AccessError> {
        let (grantee_kind, grantee_id) = grantee_parts(key.grantee);

        let rows = sqlx::query(
            r#"
            SELECT grantee_kind, grantee_id, target_kind, target_id,
                   grantor_id, privilege, recorded_at, undone
            FROM privilege_provenance
            WHERE grantee_kind = $1 AND grantee_id = $2
              AND target_kind = $3 AND target_id = $4
            ORDER BY id
            "#,
        )
        .bind(grantee_kind)
        .bind(grantee_id)
        .bind(key.target.kind())
        .bind(key.target.id())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let grantee_kind: String = row.try_get("grantee_kind")?;
                let target_kind: String = row.try_get("target_kind")?;
                let privilege: String = row.try_get("privilege")?;
                Ok(ProvenanceRecord {
                    key: GrantKey {
                        grantee: grantee_from_parts(&grantee_kind, row.try_get("grantee_id")?)?,
                        target: target_from_parts(&target_kind, row.try_get("target_id")?)?,
                    },
                    grantor: UserId(row.try_get("grantor_id")?),
                    privilege: privilege.parse()?,
                    recorded_at: row.try_get("recorded_at")?,
                    undone: row.try_get("undone")?,
                })
            })
            .collect()
    }

    async fn insert_request(
        &self,
        request: MembershipRequest,
    ) -> Result<MembershipRequest, AccessError> {
        let result = sqlx::query(
            r#"
            INSERT INTO group_membership_requests (
                id, request_from, group_to_join, invitation_to, explanation,
                redeemed, created_at, redeemed_at
            ) VALUES ($1, $2, $3, $4, $5, FALSE, $6, NULL)
            "#,
        )
        .bind(request.id.0)
        .bind(request.request_from.0)
        .bind(request.group_to_join.0)
        .bind(request.invitation_to.map(|u| u.0))
        .bind(&request.explanation)
        .bind(request.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(request),
            Err(e) if is_unique_violation(&e) => Err(AccessError::DuplicateRequest(format!(
                "user:{} already has a pending request for group:{}",
                request.candidate(),
                request.group_to_join
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn request(&self, id: RequestId) -> Result<Option<MembershipRequest>, AccessError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM group_membership_requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| request_from_row(&row)).transpose()
    }

    async fn pending_requests(
        &self,
        filter: RequestFilter,
    ) -> Result<Vec<MembershipRequest>, AccessError> {
        let base = format!(
            "SELECT {} FROM group_membership_requests WHERE NOT redeemed",
            REQUEST_COLUMNS
        );

        let rows = match filter {
            RequestFilter::ForUser(user) => {
                sqlx::query(&format!(
                    "{} AND COALESCE(invitation_to, request_from) = $1 ORDER BY created_at",
                    base
                ))
                .bind(user.0)
                .fetch_all(&self.pool)
                .await?
            }
            RequestFilter::ForGroup(group) => {
                sqlx::query(&format!("{} AND group_to_join = $1 ORDER BY created_at", base))
                    .bind(group.0)
                    .fetch_all(&self.pool)
                    .await?
            }
            RequestFilter::Pair(user, group) => {
                sqlx::query(&format!(
                    "{} AND COALESCE(invitation_to, request_from) = $1 AND group_to_join = $2 \
                     ORDER BY created_at",
                    base
                ))
                .bind(user.0)
                .bind(group.0)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(request_from_row).collect()
    }

    async fn redeem_request(&self, id: RequestId) -> Result<MembershipRequest, AccessError> {
        let row = sqlx::query(&format!(
            "UPDATE group_membership_requests SET redeemed = TRUE, redeemed_at = NOW() \
             WHERE id = $1 AND NOT redeemed RETURNING {}",
            REQUEST_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => request_from_row(&row),
            None => Err(AccessError::NotFound(format!(
                "pending membership request {}",
                id
            ))),
        }
    }

    async fn reopen_request(&self, id: RequestId) -> Result<(), AccessError> {
        let result = sqlx::query(
            "UPDATE group_membership_requests SET redeemed = FALSE, redeemed_at = NULL \
             WHERE id = $1 AND redeemed",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(AccessError::NotFound(format!(
                "redeemed membership request {}",
                id
            ))),
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(AccessError::DuplicateRequest(format!(
                "request {} cannot be reopened while another is pending",
                id
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
