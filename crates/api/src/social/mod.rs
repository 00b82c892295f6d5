//! Friend and group-join requests
//!
//! The social graph lives in tables owned by the account service. The gateway reads and
//! updates them through [`SocialGraph`] and pushes `_received` / `_result` notices to
//! counterparts that are connected to this gateway.

mod postgres;

pub use postgres::PgSocialGraph;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chatgate_shared::{GatewayError, GatewayResult};
use serde::Serialize;
use time::OffsetDateTime;

use crate::websocket::connection::Connection;
use crate::websocket::events::{
    FriendRequestNotice, FriendRequestPayload, FriendRequestResultNotice, GroupJoinNotice,
    GroupJoinPayload, GroupJoinResultNotice, HandleRequestPayload, RequestAck, ServerFrame,
};
use crate::websocket::registry::ConnectionRegistry;

pub const STATUS_PENDING: &str = "pending";
pub const ROLE_OWNER: &str = "owner";
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_MEMBER: &str = "member";

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserProfile {
    pub uid: String,
    pub name: String,
    pub avatar: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FriendRequestRecord {
    pub request_id: i64,
    pub from_uid: String,
    pub to_uid: String,
    pub message: String,
    pub status: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GroupInfo {
    pub gid: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct GroupJoinRecord {
    pub request_id: i64,
    pub user_id: String,
    pub group_id: i64,
    pub message: String,
    pub status: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Accept,
    Reject,
}

impl RequestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestAction::Accept => "accept",
            RequestAction::Reject => "reject",
        }
    }

    /// Status a resolved request is stored with
    pub fn status(&self) -> &'static str {
        match self {
            RequestAction::Accept => "accepted",
            RequestAction::Reject => "rejected",
        }
    }
}

impl FromStr for RequestAction {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(RequestAction::Accept),
            "reject" => Ok(RequestAction::Reject),
            _ => Err(GatewayError::validation("action must be accept or reject")),
        }
    }
}

#[async_trait]
pub trait SocialGraph: Send + Sync {
    async fn user(&self, uid: &str) -> GatewayResult<Option<UserProfile>>;

    async fn are_friends(&self, a: &str, b: &str) -> GatewayResult<bool>;

    async fn has_pending_friend_request(&self, from_uid: &str, to_uid: &str) -> GatewayResult<bool>;

    async fn create_friend_request(
        &self,
        from_uid: &str,
        to_uid: &str,
        message: &str,
    ) -> GatewayResult<FriendRequestRecord>;

    async fn friend_request(&self, request_id: i64) -> GatewayResult<Option<FriendRequestRecord>>;

    /// Move a pending request to its final status; accepting also creates both
    /// friendship rows. One transaction. Conflict if it is no longer pending.
    async fn resolve_friend_request(&self, request_id: i64, action: RequestAction) -> GatewayResult<()>;

    async fn group(&self, gid: i64) -> GatewayResult<Option<GroupInfo>>;

    async fn member_role(&self, gid: i64, uid: &str) -> GatewayResult<Option<String>>;

    async fn has_pending_join_request(&self, uid: &str, gid: i64) -> GatewayResult<bool>;

    async fn create_join_request(&self, uid: &str, gid: i64, message: &str) -> GatewayResult<GroupJoinRecord>;

    async fn join_request(&self, request_id: i64) -> GatewayResult<Option<GroupJoinRecord>>;

    /// Move a pending join request to its final status; accepting also adds the
    /// applicant as a member. One transaction. Conflict if it is no longer pending.
    async fn resolve_join_request(
        &self,
        request_id: i64,
        handler_uid: &str,
        action: RequestAction,
    ) -> GatewayResult<()>;

    /// Members of `gid` holding one of `roles`
    async fn members_with_roles(&self, gid: i64, roles: &[&str]) -> GatewayResult<Vec<String>>;
}

/// Handles the social frames of an authenticated session
pub struct SocialService {
    graph: Arc<dyn SocialGraph>,
    registry: Arc<ConnectionRegistry>,
}

impl SocialService {
    pub fn new(graph: Arc<dyn SocialGraph>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { graph, registry }
    }

    /// Best-effort notice to a user connected here
    async fn notify<T: Serialize>(&self, user_id: &str, frame: &T) {
        let Some(conn) = self.registry.lookup(user_id).await else {
            return;
        };
        if let Err(e) = conn.send(frame) {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to deliver social notice");
        }
    }

    fn reply(caller: &Connection, frame: ServerFrame) {
        if let Err(e) = caller.send(&frame) {
            tracing::warn!(session_id = %caller.session_id, error = %e, "Failed to queue reply");
        }
    }

    async fn profile(&self, uid: &str) -> GatewayResult<UserProfile> {
        self.graph
            .user(uid)
            .await?
            .ok_or_else(|| GatewayError::not_found("user does not exist"))
    }

    pub async fn friend_request(
        &self,
        caller_id: &str,
        caller: &Connection,
        payload: FriendRequestPayload,
    ) -> GatewayResult<()> {
        if payload.to_uid.is_empty() {
            return Err(GatewayError::validation("to_uid is required"));
        }
        if payload.to_uid == caller_id {
            return Err(GatewayError::validation("cannot send a friend request to yourself"));
        }
        self.profile(&payload.to_uid).await?;
        if self.graph.are_friends(caller_id, &payload.to_uid).await? {
            return Err(GatewayError::conflict("already friends"));
        }
        if self
            .graph
            .has_pending_friend_request(caller_id, &payload.to_uid)
            .await?
        {
            return Err(GatewayError::conflict("friend request already pending"));
        }

        let from = self.profile(caller_id).await?;
        let request = self
            .graph
            .create_friend_request(caller_id, &payload.to_uid, &payload.message)
            .await?;

        tracing::info!(
            request_id = request.request_id,
            from_uid = %caller_id,
            to_uid = %payload.to_uid,
            "Friend request created"
        );

        Self::reply(caller, ServerFrame::FriendRequestResponse(RequestAck::ok("friend request sent")));
        self.notify(
            &payload.to_uid,
            &ServerFrame::FriendRequestReceived(FriendRequestNotice {
                request_id: request.request_id,
                from_uid: from.uid,
                from_name: from.name,
                from_avatar: from.avatar,
                message: request.message,
                created_at: request.created_at,
            }),
        )
        .await;
        Ok(())
    }

    pub async fn handle_friend_request(
        &self,
        caller_id: &str,
        caller: &Connection,
        payload: HandleRequestPayload,
    ) -> GatewayResult<()> {
        let action: RequestAction = payload.action.parse()?;
        let request = self
            .graph
            .friend_request(payload.request_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("friend request does not exist"))?;

        if request.to_uid != caller_id {
            return Err(GatewayError::auth("not allowed to handle this request"));
        }
        if request.status != STATUS_PENDING {
            return Err(GatewayError::conflict("request already handled"));
        }

        let handler = self.profile(caller_id).await?;
        self.graph.resolve_friend_request(request.request_id, action).await?;

        let message = match action {
            RequestAction::Accept => "friend request accepted",
            RequestAction::Reject => "friend request rejected",
        };
        tracing::info!(
            request_id = request.request_id,
            handler = %caller_id,
            action = action.as_str(),
            "Friend request resolved"
        );

        Self::reply(caller, ServerFrame::FriendRequestHandleResponse(RequestAck::ok(message)));
        self.notify(
            &request.from_uid,
            &ServerFrame::FriendRequestResult(FriendRequestResultNotice {
                request_id: request.request_id,
                from_uid: handler.uid,
                from_name: handler.name,
                action: action.as_str().to_string(),
                message: message.to_string(),
            }),
        )
        .await;
        Ok(())
    }

    pub async fn group_join_request(
        &self,
        caller_id: &str,
        caller: &Connection,
        payload: GroupJoinPayload,
    ) -> GatewayResult<()> {
        if payload.group_id == 0 {
            return Err(GatewayError::validation("group_id is required"));
        }
        let group = self
            .graph
            .group(payload.group_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("group does not exist"))?;
        if self.graph.member_role(group.gid, caller_id).await?.is_some() {
            return Err(GatewayError::conflict("already a member of this group"));
        }
        if self.graph.has_pending_join_request(caller_id, group.gid).await? {
            return Err(GatewayError::conflict("join request already pending"));
        }

        let from = self.profile(caller_id).await?;
        let request = self
            .graph
            .create_join_request(caller_id, group.gid, &payload.message)
            .await?;

        tracing::info!(
            request_id = request.request_id,
            group_id = group.gid,
            user_id = %caller_id,
            "Group join request created"
        );

        Self::reply(caller, ServerFrame::GroupJoinRequestResponse(RequestAck::ok("join request sent")));

        let notice = ServerFrame::GroupJoinRequestReceived(GroupJoinNotice {
            request_id: request.request_id,
            group_id: group.gid,
            group_name: group.name,
            from_uid: from.uid,
            from_name: from.name,
            from_avatar: from.avatar,
            message: request.message,
            created_at: request.created_at,
        });
        for admin in self
            .graph
            .members_with_roles(request.group_id, &[ROLE_OWNER, ROLE_ADMIN])
            .await?
        {
            self.notify(&admin, &notice).await;
        }
        Ok(())
    }

    pub async fn handle_group_join_request(
        &self,
        caller_id: &str,
        caller: &Connection,
        payload: HandleRequestPayload,
    ) -> GatewayResult<()> {
        let action: RequestAction = payload.action.parse()?;
        let request = self
            .graph
            .join_request(payload.request_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("join request does not exist"))?;
        let group = self
            .graph
            .group(request.group_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("group does not exist"))?;

        let role = match self.graph.member_role(group.gid, caller_id).await? {
            Some(role) if role == ROLE_OWNER || role == ROLE_ADMIN => role,
            _ => return Err(GatewayError::auth("only group owners and admins can handle join requests")),
        };
        if request.status != STATUS_PENDING {
            return Err(GatewayError::conflict("request already handled"));
        }

        let handler = self.profile(caller_id).await?;
        self.graph
            .resolve_join_request(request.request_id, caller_id, action)
            .await?;

        let message = match action {
            RequestAction::Accept => "join request accepted",
            RequestAction::Reject => "join request rejected",
        };
        tracing::info!(
            request_id = request.request_id,
            group_id = group.gid,
            handler = %caller_id,
            action = action.as_str(),
            "Group join request resolved"
        );

        Self::reply(caller, ServerFrame::GroupJoinRequestHandleResponse(RequestAck::ok(message)));

        let notice = ServerFrame::GroupJoinRequestResult(GroupJoinResultNotice {
            request_id: request.request_id,
            group_id: group.gid,
            group_name: group.name,
            handler_uid: handler.uid,
            handler_name: handler.name,
            handler_role: role.clone(),
            action: action.as_str().to_string(),
            message: message.to_string(),
        });
        self.notify(&request.user_id, &notice).await;

        let roles: &[&str] = if role == ROLE_OWNER {
            &[ROLE_ADMIN]
        } else {
            &[ROLE_OWNER, ROLE_ADMIN]
        };
        for admin in self.graph.members_with_roles(group.gid, roles).await? {
            if admin != caller_id {
                self.notify(&admin, &notice).await;
            }
        }
        Ok(())
    }
}
