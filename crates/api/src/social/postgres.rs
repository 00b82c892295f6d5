//! Postgres social graph over the account service's tables

use async_trait::async_trait;
use chatgate_shared::{GatewayError, GatewayResult};
use sqlx::PgPool;

use super::{
    FriendRequestRecord, GroupInfo, GroupJoinRecord, RequestAction, SocialGraph, UserProfile,
    ROLE_MEMBER, STATUS_PENDING,
};

#[derive(Clone)]
pub struct PgSocialGraph {
    pool: PgPool,
}

impl PgSocialGraph {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SocialGraph for PgSocialGraph {
    async fn user(&self, uid: &str) -> GatewayResult<Option<UserProfile>> {
        let user = sqlx::query_as::<_, UserProfile>(
            "SELECT uid, name, COALESCE(avatar, '') AS avatar FROM users WHERE uid = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn are_friends(&self, a: &str, b: &str) -> GatewayResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM friend
                WHERE (user_id = $1 AND friend_id = $2) OR (user_id = $2 AND friend_id = $1)
            )
            "#,
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn has_pending_friend_request(&self, from_uid: &str, to_uid: &str) -> GatewayResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM friend_request
                WHERE from_uid = $1 AND to_uid = $2 AND status = $3
            )
            "#,
        )
        .bind(from_uid)
        .bind(to_uid)
        .bind(STATUS_PENDING)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_friend_request(
        &self,
        from_uid: &str,
        to_uid: &str,
        message: &str,
    ) -> GatewayResult<FriendRequestRecord> {
        let record = sqlx::query_as::<_, FriendRequestRecord>(
            r#"
            INSERT INTO friend_request (from_uid, to_uid, message, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING request_id, from_uid, to_uid, message, status, created_at
            "#,
        )
        .bind(from_uid)
        .bind(to_uid)
        .bind(message)
        .bind(STATUS_PENDING)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn friend_request(&self, request_id: i64) -> GatewayResult<Option<FriendRequestRecord>> {
        let record = sqlx::query_as::<_, FriendRequestRecord>(
            r#"
            SELECT request_id, from_uid, to_uid, message, status, created_at
            FROM friend_request
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn resolve_friend_request(&self, request_id: i64, action: RequestAction) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;

        let resolved: Option<(String, String)> = sqlx::query_as(
            r#"
            UPDATE friend_request
            SET status = $2, updated_at = NOW()
            WHERE request_id = $1 AND status = $3
            RETURNING from_uid, to_uid
            "#,
        )
        .bind(request_id)
        .bind(action.status())
        .bind(STATUS_PENDING)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((from_uid, to_uid)) = resolved else {
            tx.rollback().await?;
            return Err(GatewayError::conflict("request already handled"));
        };

        if action == RequestAction::Accept {
            for (user_id, friend_id) in [(&from_uid, &to_uid), (&to_uid, &from_uid)] {
                sqlx::query(
                    r#"
                    INSERT INTO friend (user_id, friend_id, created_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(friend_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn group(&self, gid: i64) -> GatewayResult<Option<GroupInfo>> {
        let group = sqlx::query_as::<_, GroupInfo>("SELECT gid, name FROM chat_group WHERE gid = $1")
            .bind(gid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    async fn member_role(&self, gid: i64, uid: &str) -> GatewayResult<Option<String>> {
        let role: Option<String> =
            sqlx::query_scalar("SELECT role FROM group_member WHERE gid = $1 AND uid = $2")
                .bind(gid)
                .bind(uid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(role)
    }

    async fn has_pending_join_request(&self, uid: &str, gid: i64) -> GatewayResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM group_join_request
                WHERE user_id = $1 AND group_id = $2 AND status = $3
            )
            "#,
        )
        .bind(uid)
        .bind(gid)
        .bind(STATUS_PENDING)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_join_request(&self, uid: &str, gid: i64, message: &str) -> GatewayResult<GroupJoinRecord> {
        let record = sqlx::query_as::<_, GroupJoinRecord>(
            r#"
            INSERT INTO group_join_request (user_id, group_id, message, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING request_id, user_id, group_id, message, status, created_at
            "#,
        )
        .bind(uid)
        .bind(gid)
        .bind(message)
        .bind(STATUS_PENDING)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn join_request(&self, request_id: i64) -> GatewayResult<Option<GroupJoinRecord>> {
        let record = sqlx::query_as::<_, GroupJoinRecord>(
            r#"
            SELECT request_id, user_id, group_id, message, status, created_at
            FROM group_join_request
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn resolve_join_request(
        &self,
        request_id: i64,
        handler_uid: &str,
        action: RequestAction,
    ) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;

        let resolved: Option<(String, i64)> = sqlx::query_as(
            r#"
            UPDATE group_join_request
            SET status = $2, handler_uid = $3, updated_at = NOW()
            WHERE request_id = $1 AND status = $4
            RETURNING user_id, group_id
            "#,
        )
        .bind(request_id)
        .bind(action.status())
        .bind(handler_uid)
        .bind(STATUS_PENDING)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, group_id)) = resolved else {
            tx.rollback().await?;
            return Err(GatewayError::conflict("request already handled"));
        };

        if action == RequestAction::Accept {
            sqlx::query(
                r#"
                INSERT INTO group_member (gid, uid, role, joined_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(group_id)
            .bind(&user_id)
            .bind(ROLE_MEMBER)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn members_with_roles(&self, gid: i64, roles: &[&str]) -> GatewayResult<Vec<String>> {
        let roles: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
        let uids: Vec<String> = sqlx::query_scalar(
            "SELECT uid FROM group_member WHERE gid = $1 AND role = ANY($2) ORDER BY uid",
        )
        .bind(gid)
        .bind(&roles)
        .fetch_all(&self.pool)
        .await?;
        Ok(uids)
    }
}
