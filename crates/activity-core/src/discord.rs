//! Discord REST adapters: channel history retrieval and the role system.

use crate::config::DiscordConfig;
use crate::error::{ActivityError, Result};
use crate::normalize::parse_timestamp;
use crate::raw_log::RawLog;
use crate::reconcile::{RoleState, RoleSystem, RoleSystemError, UnresolvedMember};
use crate::retry::RetryPolicy;
use crate::types::Identity;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

const MESSAGE_PAGE: u32 = 100;
const MEMBER_PAGE: u32 = 1000;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct DiscordClient {
    http: Client,
    api_base: String,
    token: String,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig, token: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("guild-activity/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ActivityError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_base))
            .header(header::AUTHORIZATION, format!("Bot {}", self.token))
    }

    fn send(&self, req: RequestBuilder) -> std::result::Result<Response, RoleSystemError> {
        let resp = req
            .send()
            .map_err(|e| RoleSystemError::transient(format!("request failed: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let header_hint = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let body = resp.text().unwrap_or_default();
        Err(classify(status, &body, header_hint))
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, RoleSystemError> {
        let mut req = self.request(Method::GET, path);
        if !query.is_empty() {
            req = req.query(query);
        }
        let resp = self.send(req)?;
        resp.json::<T>()
            .map_err(|e| RoleSystemError::Rejected(format!("unexpected response from {path}: {e}")))
    }
}

/// Map a failed HTTP status to how the caller should react.
fn classify(status: StatusCode, body: &str, header_hint: Option<f64>) -> RoleSystemError {
    if status == StatusCode::NOT_FOUND {
        return RoleSystemError::NotFound;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let body_hint = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("retry_after").and_then(Value::as_f64));
        let retry_after = body_hint
            .or(header_hint)
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64);
        return RoleSystemError::Transient {
            message: format!("rate limited ({status})"),
            retry_after,
        };
    }
    if status.is_server_error() {
        return RoleSystemError::transient(format!("server error {status}"));
    }
    RoleSystemError::Rejected(format!("{status}: {}", body.trim()))
}

// ---------------------------------------------------------------------------
// Log retrieval
// ---------------------------------------------------------------------------

/// Pages backwards through a channel's history.
pub struct DiscordLogRetriever<'a> {
    client: &'a DiscordClient,
    channel_id: String,
    policy: RetryPolicy,
    page_size: u32,
}

impl<'a> DiscordLogRetriever<'a> {
    pub fn new(client: &'a DiscordClient, channel_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            client,
            channel_id: channel_id.into(),
            policy,
            page_size: MESSAGE_PAGE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MESSAGE_PAGE);
        self
    }

    /// Newest first, stopping after `max_messages` messages or at the first
    /// message more than `max_days + 1` days older than the newest one.
    pub fn fetch(&self, max_messages: u32, max_days: u32) -> Result<RawLog> {
        let path = format!("/channels/{}/messages", self.channel_id);
        let mut records: Vec<Value> = Vec::new();
        let mut before: Option<String> = None;
        let mut cutoff = None;

        'pages: while (records.len() as u64) < u64::from(max_messages) {
            let remaining = u64::from(max_messages) - records.len() as u64;
            let limit = remaining.min(u64::from(self.page_size));
            let mut query = vec![("limit", limit.to_string())];
            if let Some(b) = &before {
                query.push(("before", b.clone()));
            }

            let (page, _) = self
                .policy
                .run(|| self.client.get_json::<Vec<Value>>(&path, &query), RoleSystemError::retry_hint);
            let page = page.map_err(|e| match e {
                RoleSystemError::NotFound => {
                    ActivityError::Retrieval(format!("channel {} not found", self.channel_id))
                }
                other => ActivityError::Retrieval(other.to_string()),
            })?;
            let page_len = page.len() as u64;

            for message in page {
                let id = message.get("id").and_then(Value::as_str).map(str::to_string);
                let ts = message
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(parse_timestamp);
                records.push(message);

                if let Some(ts) = ts {
                    let limit_ts = *cutoff.get_or_insert_with(|| {
                        ChronoDuration::try_days(i64::from(max_days) + 1)
                            .and_then(|d| ts.checked_sub_signed(d))
                            .unwrap_or(DateTime::<Utc>::MIN_UTC)
                    });
                    if ts < limit_ts {
                        break 'pages;
                    }
                }
                before = id.or(before);
            }

            tracing::debug!(fetched = records.len(), max_messages, "fetched history page");
            if page_len < limit {
                break;
            }
        }

        tracing::info!(fetched = records.len(), "channel history fetched");
        Ok(RawLog::new(records))
    }
}

// ---------------------------------------------------------------------------
// Role system
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiRole {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    user: ApiUser,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

impl ApiMember {
    /// Handles in preference order: server nickname, display name, username.
    fn handles(&self) -> impl Iterator<Item = &str> {
        [
            self.nick.as_deref(),
            self.user.global_name.as_deref(),
            Some(self.user.username.as_str()),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|h| !h.is_empty())
    }
}

/// One role in one guild, with members matched by handle.
pub struct DiscordRoleSystem {
    client: DiscordClient,
    guild_id: String,
    role_id: String,
    policy: RetryPolicy,
    /// Identity → user id, filled by `snapshot`.
    members: RefCell<HashMap<Identity, String>>,
    collisions: RefCell<Vec<UnresolvedMember>>,
}

impl DiscordRoleSystem {
    /// Resolve `role_name` in the guild. A missing role is fatal.
    pub fn connect(
        client: DiscordClient,
        guild_id: impl Into<String>,
        role_name: &str,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let guild_id = guild_id.into();
        let path = format!("/guilds/{guild_id}/roles");
        let (roles, _) = policy.run(|| client.get_json::<Vec<ApiRole>>(&path, &[]), RoleSystemError::retry_hint);
        let roles = roles.map_err(|e| ActivityError::Snapshot(format!("listing roles: {e}")))?;
        let role_id = roles
            .into_iter()
            .find(|r| r.name == role_name)
            .map(|r| r.id)
            .ok_or_else(|| ActivityError::RoleNotFound(role_name.to_string()))?;
        tracing::debug!(%guild_id, %role_id, role_name, "resolved role");
        Ok(Self {
            client,
            guild_id,
            role_id,
            policy,
            members: RefCell::new(HashMap::new()),
            collisions: RefCell::new(Vec::new()),
        })
    }

    fn list_members(&self) -> std::result::Result<Vec<ApiMember>, RoleSystemError> {
        let path = format!("/guilds/{}/members", self.guild_id);
        let mut all = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut query = vec![("limit", MEMBER_PAGE.to_string())];
            if let Some(a) = &after {
                query.push(("after", a.clone()));
            }
            let (page, _) = self
                .policy
                .run(|| self.client.get_json::<Vec<ApiMember>>(&path, &query), RoleSystemError::retry_hint);
            let page = page?;
            let full = page.len() as u32 >= MEMBER_PAGE;
            after = page.last().map(|m| m.user.id.clone());
            all.extend(page);
            if !full || after.is_none() {
                return Ok(all);
            }
        }
    }

    fn member_path(&self, identity: &Identity) -> std::result::Result<String, RoleSystemError> {
        let members = self.members.borrow();
        let user_id = members.get(identity).ok_or(RoleSystemError::NotFound)?;
        Ok(format!(
            "/guilds/{}/members/{user_id}/roles/{}",
            self.guild_id, self.role_id
        ))
    }

    fn mutate(&self, method: Method, identity: &Identity) -> std::result::Result<(), RoleSystemError> {
        let path = self.member_path(identity)?;
        self.client
            .send(self.client.request(method, &path).header(header::CONTENT_LENGTH, "0"))?;
        Ok(())
    }
}

/// Key each member by the first of its handles that matches `hint`
/// case-insensitively, or by its preferred handle.
fn member_key(member: &ApiMember, hint: &HashMap<String, &Identity>) -> Option<Identity> {
    member
        .handles()
        .find_map(|h| hint.get(&h.to_lowercase()).map(|i| (*i).clone()))
        .or_else(|| member.handles().next().and_then(|h| Identity::new(h).ok()))
}

impl RoleSystem for DiscordRoleSystem {
    fn snapshot(&self, hint: &BTreeSet<Identity>) -> std::result::Result<RoleState, RoleSystemError> {
        let lowered: HashMap<String, &Identity> = hint
            .iter()
            .map(|i| (i.as_str().to_lowercase(), i))
            .collect();
        let mut state = BTreeMap::new();
        let mut members = HashMap::new();
        let mut collisions = Vec::new();

        for member in self.list_members()? {
            let Some(key) = member_key(&member, &lowered) else {
                continue;
            };
            let has_role = member.roles.contains(&self.role_id);
            if members.contains_key(&key) {
                tracing::warn!(identity = %key, user_id = %member.user.id, "duplicate handle, keeping first member");
                collisions.push(UnresolvedMember {
                    handle: key,
                    member_id: member.user.id,
                    has_role,
                });
                continue;
            }
            state.insert(key.clone(), has_role);
            members.insert(key, member.user.id);
        }

        tracing::debug!(members = members.len(), collisions = collisions.len(), "fetched role snapshot");
        *self.members.borrow_mut() = members;
        *self.collisions.borrow_mut() = collisions;
        Ok(state)
    }

    fn unresolved(&self) -> Vec<UnresolvedMember> {
        self.collisions.borrow().clone()
    }

    fn grant(&self, identity: &Identity) -> std::result::Result<(), RoleSystemError> {
        self.mutate(Method::PUT, identity)
    }

    fn revoke(&self, identity: &Identity) -> std::result::Result<(), RoleSystemError> {
        self.mutate(Method::DELETE, identity)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{execute, fetch_snapshot, plan, SkipReason};
    use crate::types::ActiveSet;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn config(server: &ServerGuard) -> DiscordConfig {
        DiscordConfig {
            guild_id: "g1".to_string(),
            channel_id: "c1".to_string(),
            role_name: "active coolio".to_string(),
            api_base: server.url(),
            timeout_secs: 5,
            bot_token: None,
        }
    }

    fn client(server: &ServerGuard) -> DiscordClient {
        DiscordClient::new(&config(server), "tok".to_string()).unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn classify_statuses() {
        assert_eq!(classify(StatusCode::NOT_FOUND, "", None), RoleSystemError::NotFound);
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, r#"{"retry_after": 1.5}"#, None),
            RoleSystemError::Transient {
                message: "rate limited (429 Too Many Requests)".to_string(),
                retry_after: Some(Duration::from_millis(1500)),
            }
        );
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, "", None),
            RoleSystemError::Transient { retry_after: None, .. }
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, "Missing Permissions", None),
            RoleSystemError::Rejected(m) if m.contains("Missing Permissions")
        ));
    }

    #[test]
    fn fetch_pages_until_short_page() {
        let mut server = Server::new();
        let page1 = server
            .mock("GET", "/channels/c1/messages")
            .match_query(Matcher::Exact("limit=2".to_string()))
            .match_header("authorization", "Bot tok")
            .with_status(200)
            .with_body(
                json!([
                    {"id": "m3", "channel_id": "c1", "timestamp": "2026-05-03T10:00:00+00:00", "embeds": []},
                    {"id": "m2", "channel_id": "c1", "timestamp": "2026-05-02T10:00:00+00:00", "embeds": []}
                ])
                .to_string(),
            )
            .create();
        let page2 = server
            .mock("GET", "/channels/c1/messages")
            .match_query(Matcher::Exact("limit=2&before=m2".to_string()))
            .with_status(200)
            .with_body(
                json!([
                    {"id": "m1", "channel_id": "c1", "timestamp": "2026-05-01T10:00:00+00:00", "embeds": []}
                ])
                .to_string(),
            )
            .create();

        let c = client(&server);
        let log = DiscordLogRetriever::new(&c, "c1", RetryPolicy::immediate(1))
            .with_page_size(2)
            .fetch(100, 60)
            .unwrap();
        page1.assert();
        page2.assert();
        assert_eq!(log.records.len(), 3);
        assert_eq!(log.unparseable, 0);
    }

    #[test]
    fn fetch_stops_at_day_cutoff() {
        let mut server = Server::new();
        server
            .mock("GET", "/channels/c1/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!([
                    {"id": "m3", "channel_id": "c1", "timestamp": "2026-05-10T10:00:00+00:00"},
                    {"id": "m2", "channel_id": "c1", "timestamp": "2026-05-01T10:00:00+00:00"},
                    {"id": "m1", "channel_id": "c1", "timestamp": "2026-04-01T10:00:00+00:00"}
                ])
                .to_string(),
            )
            .create();
        let c = client(&server);
        let log = DiscordLogRetriever::new(&c, "c1", RetryPolicy::immediate(1))
            .fetch(100, 3)
            .unwrap();
        // The first message past the cutoff is kept, nothing after it.
        assert_eq!(log.records.len(), 2);
    }

    #[test]
    fn huge_day_limit_keeps_everything() {
        let mut server = Server::new();
        server
            .mock("GET", "/channels/c1/messages")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!([
                    {"id": "m2", "channel_id": "c1", "timestamp": "2026-05-10T10:00:00+00:00"},
                    {"id": "m1", "channel_id": "c1", "timestamp": "1990-04-01T10:00:00+00:00"}
                ])
                .to_string(),
            )
            .create();
        let c = client(&server);
        let log = DiscordLogRetriever::new(&c, "c1", RetryPolicy::immediate(1))
            .fetch(100, u32::MAX)
            .unwrap();
        assert_eq!(log.records.len(), 2);
    }

    #[test]
    fn fetch_failure_is_not_an_empty_log() {
        let mut server = Server::new();
        server
            .mock("GET", "/channels/c1/messages")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"message": "Missing Access"}"#)
            .create();
        let c = client(&server);
        let err = DiscordLogRetriever::new(&c, "c1", RetryPolicy::immediate(2))
            .fetch(100, 60)
            .unwrap_err();
        assert!(matches!(err, ActivityError::Retrieval(m) if m.contains("Missing Access")));
    }

    #[test]
    fn missing_role_is_fatal() {
        let mut server = Server::new();
        server
            .mock("GET", "/guilds/g1/roles")
            .with_status(200)
            .with_body(json!([{"id": "r9", "name": "other"}]).to_string())
            .create();
        let err = DiscordRoleSystem::connect(client(&server), "g1", "active coolio", RetryPolicy::immediate(1))
            .err()
            .unwrap();
        assert!(matches!(err, ActivityError::RoleNotFound(_)));
    }

    #[test]
    fn reconcile_against_discord() {
        let mut server = Server::new();
        server
            .mock("GET", "/guilds/g1/roles")
            .with_status(200)
            .with_body(json!([{"id": "r1", "name": "active coolio"}]).to_string())
            .create();
        server
            .mock("GET", "/guilds/g1/members")
            .match_query(Matcher::Exact("limit=1000".to_string()))
            .with_status(200)
            .with_body(
                json!([
                    {"user": {"id": "u1", "username": "alice_real", "global_name": null}, "nick": "ALICE", "roles": ["r1"]},
                    {"user": {"id": "u2", "username": "bob", "global_name": "Bobby"}, "nick": null, "roles": []},
                    {"user": {"id": "u3", "username": "carol", "global_name": null}, "nick": null, "roles": ["r1", "r2"]}
                ])
                .to_string(),
            )
            .create();
        let grant_bob = server
            .mock("PUT", "/guilds/g1/members/u2/roles/r1")
            .match_header("authorization", "Bot tok")
            .with_status(204)
            .create();
        let revoke_carol = server
            .mock("DELETE", "/guilds/g1/members/u3/roles/r1")
            .with_status(204)
            .create();

        let roles = DiscordRoleSystem::connect(client(&server), "g1", "active coolio", RetryPolicy::immediate(2))
            .unwrap();
        let active: ActiveSet = ["alice", "bob", "dave"].into_iter().map(id).collect();
        let policy = RetryPolicy::immediate(2);
        let snapshot = fetch_snapshot(&roles, active.as_set(), &policy).unwrap();
        assert_eq!(snapshot.get(&id("alice")), Some(&true));
        assert_eq!(snapshot.get(&id("bob")), Some(&false));
        assert_eq!(snapshot.get(&id("carol")), Some(&true));

        let report = execute(&plan(&active, &snapshot), &roles, &policy);
        grant_bob.assert();
        revoke_carol.assert();
        assert_eq!(report.granted, vec![id("bob")]);
        assert_eq!(report.revoked, vec![id("carol")]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, SkipReason::IdentityNotFound);
    }

    #[test]
    fn colliding_handles_are_reported() {
        let mut server = Server::new();
        server
            .mock("GET", "/guilds/g1/roles")
            .with_status(200)
            .with_body(json!([{"id": "r1", "name": "active coolio"}]).to_string())
            .create();
        server
            .mock("GET", "/guilds/g1/members")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!([
                    {"user": {"id": "u1", "username": "gus"}, "roles": []},
                    {"user": {"id": "u2", "username": "gus_alt"}, "nick": "Gus", "roles": ["r1"]}
                ])
                .to_string(),
            )
            .create();

        let roles = DiscordRoleSystem::connect(client(&server), "g1", "active coolio", RetryPolicy::immediate(1))
            .unwrap();
        let active: ActiveSet = ["gus"].into_iter().map(id).collect();
        let policy = RetryPolicy::immediate(1);
        let snapshot = fetch_snapshot(&roles, active.as_set(), &policy).unwrap();
        assert_eq!(snapshot.get(&id("gus")), Some(&false));

        let report = execute(&plan(&ActiveSet::new(), &snapshot), &roles, &policy);
        assert!(report.revoked.is_empty());
        assert_eq!(
            report.unresolved,
            vec![UnresolvedMember {
                handle: id("gus"),
                member_id: "u2".to_string(),
                has_role: true,
            }]
        );
        assert!(!report.is_clean());
    }

    #[test]
    fn member_left_between_snapshot_and_mutation() {
        let mut server = Server::new();
        server
            .mock("GET", "/guilds/g1/roles")
            .with_status(200)
            .with_body(json!([{"id": "r1", "name": "active coolio"}]).to_string())
            .create();
        server
            .mock("GET", "/guilds/g1/members")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!([{"user": {"id": "u4", "username": "erin"}, "roles": []}]).to_string(),
            )
            .create();
        server
            .mock("PUT", "/guilds/g1/members/u4/roles/r1")
            .with_status(404)
            .with_body(r#"{"message": "Unknown Member", "code": 10007}"#)
            .create();

        let roles = DiscordRoleSystem::connect(client(&server), "g1", "active coolio", RetryPolicy::immediate(3))
            .unwrap();
        roles.snapshot(&BTreeSet::new()).unwrap();
        assert_eq!(roles.grant(&id("erin")), Err(RoleSystemError::NotFound));
    }

    #[test]
    fn member_key_prefers_hint_spelling() {
        let member: ApiMember = serde_json::from_value(json!({
            "user": {"id": "u1", "username": "shelly_mc", "global_name": "Shelly"},
            "nick": "Boss",
            "roles": []
        }))
        .unwrap();
        let shelly = id("shelly");
        let hint: HashMap<String, &Identity> = [("shelly".to_string(), &shelly)].into_iter().collect();
        assert_eq!(member_key(&member, &hint), Some(id("shelly")));
        assert_eq!(member_key(&member, &HashMap::new()), Some(id("Boss")));
    }
}
