//! Permission engine
//!
//! Policy is an ordered [`Ruleset`] of `(permission, pattern, action)` rules
//! evaluated last-match-wins, so later rulesets override earlier ones. When
//! policy says `ask`, a [`PermissionRequest`] is parked until a human replies
//! through [`PermissionEngine::reply`]. Replies cascade within a session:
//! `always` releases every other request the new approvals now cover, and
//! `reject` fails every other request of the session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::id::{self, prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub permission: String,
    pub pattern: String,
    pub action: Action,
}

impl Rule {
    pub fn new(permission: impl Into<String>, pattern: impl Into<String>, action: Action) -> Self {
        Self {
            permission: permission.into(),
            pattern: pattern.into(),
            action,
        }
    }
}

/// Wildcard match: `*` matches anything, `foo*` is a prefix match and
/// `*foo` a suffix match. Anything else must match exactly.
pub fn wildcard(value: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return value.ends_with(suffix);
    }
    false
}

/// Ordered list of rules. Order is significant: evaluation scans from the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ruleset(Vec<Rule>);

impl Ruleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, permission: &str, pattern: &str, action: Action) -> Self {
        self.push(Rule::new(permission, pattern, action));
        self
    }

    pub fn push(&mut self, rule: Rule) {
        self.0.push(rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flatten rulesets in order
    pub fn merge(rulesets: &[&Ruleset]) -> Ruleset {
        Ruleset(rulesets.iter().flat_map(|r| r.0.iter().cloned()).collect())
    }

    /// Build rules from configuration. A bare action applies to pattern
    /// `*`; a table maps patterns to actions. `~/` expands to the home
    /// directory.
    pub fn from_config(config: &PermissionConfig) -> Ruleset {
        let mut rules = Vec::new();
        for (permission, value) in &config.0 {
            match value {
                PermissionValue::Action(action) => {
                    rules.push(Rule::new(permission, "*", *action));
                }
                PermissionValue::Patterns(patterns) => {
                    for (pattern, action) in patterns {
                        rules.push(Rule::new(permission, expand_home(pattern), *action));
                    }
                }
            }
        }
        Ruleset(rules)
    }

    /// Rules whose permission matches `permission`
    pub fn matching(&self, permission: &str) -> Vec<Rule> {
        self.0
            .iter()
            .filter(|r| wildcard(permission, &r.permission))
            .cloned()
            .collect()
    }
}

fn expand_home(pattern: &str) -> String {
    let home = || dirs::home_dir().map(|h| h.to_string_lossy().into_owned());
    if pattern == "~" {
        return home().unwrap_or_default();
    }
    if let Some(rest) = pattern.strip_prefix("~/") {
        if let Some(home) = home() {
            return format!("{home}/{rest}");
        }
    }
    pattern.to_string()
}

/// Find the last rule across `rulesets` (in order) matching both
/// `permission` and `pattern`. Defaults to `ask`.
pub fn evaluate(permission: &str, pattern: &str, rulesets: &[&Ruleset]) -> Rule {
    rulesets
        .iter()
        .flat_map(|r| r.0.iter())
        .rev()
        .find(|rule| wildcard(permission, &rule.permission) && wildcard(pattern, &rule.pattern))
        .cloned()
        .unwrap_or_else(|| Rule::new(permission, "*", Action::Ask))
}

const EDIT_TOOLS: &[&str] = &["edit", "write", "apply_patch"];

/// Tools that policy denies outright: the last rule matching the tool's
/// permission has pattern `*` and action `deny`. File-editing tools share the
/// `edit` permission.
pub fn disabled<'a>(tools: impl IntoIterator<Item = &'a str>, ruleset: &Ruleset) -> HashSet<String> {
    tools
        .into_iter()
        .filter(|tool| {
            let permission = if EDIT_TOOLS.contains(tool) { "edit" } else { *tool };
            ruleset
                .0
                .iter()
                .rev()
                .find(|r| wildcard(permission, &r.permission))
                .is_some_and(|r| r.pattern == "*" && r.action == Action::Deny)
        })
        .map(str::to_string)
        .collect()
}

/// One permission entry in configuration: either a bare action or a table of
/// pattern -> action, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionValue {
    Action(Action),
    Patterns(Vec<(String, Action)>),
}

/// The `[permission]` table of a configuration file, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionConfig(pub Vec<(String, PermissionValue)>);

impl PermissionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, permission: &str, action: Action) -> Self {
        self.0
            .push((permission.to_string(), PermissionValue::Action(action)));
        self
    }

    pub fn patterns(mut self, permission: &str, patterns: &[(&str, Action)]) -> Self {
        let patterns = patterns
            .iter()
            .map(|(p, a)| (p.to_string(), *a))
            .collect();
        self.0
            .push((permission.to_string(), PermissionValue::Patterns(patterns)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries of `other` appended after ours
    pub fn extend(&mut self, other: &PermissionConfig) {
        self.0.extend(other.0.iter().cloned());
    }
}

impl<'de> Deserialize<'de> for PermissionValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = PermissionValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an action or a table of pattern = action")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Action::deserialize(de::value::StrDeserializer::new(v)).map(PermissionValue::Action)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut patterns = Vec::new();
                while let Some((pattern, action)) = map.next_entry::<String, Action>()? {
                    patterns.push((pattern, action));
                }
                Ok(PermissionValue::Patterns(patterns))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl<'de> Deserialize<'de> for PermissionConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ConfigVisitor;

        impl<'de> Visitor<'de> for ConfigVisitor {
            type Value = PermissionConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of permission entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, PermissionValue>()? {
                    entries.push(entry);
                }
                Ok(PermissionConfig(entries))
            }
        }

        deserializer.deserialize_map(ConfigVisitor)
    }
}

/// Why a permission check did not pass
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PermissionError {
    /// A rule forbids the action
    #[error(
        "The user has specified a rule which prevents you from using this specific tool call. Relevant rules: {}",
        format_rules(rules)
    )]
    Denied { rules: Vec<Rule> },

    #[error("The user rejected permission to use this specific tool call.")]
    Rejected,

    /// Rejected with feedback the model should act on
    #[error("The user rejected permission to use this specific tool call with the following feedback: {feedback}")]
    Corrected { feedback: String },

    #[error("Permission request was cancelled")]
    Cancelled,
}

fn format_rules(rules: &[Rule]) -> String {
    serde_json::to_string(rules).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    /// Allow this request only
    Once,
    /// Allow this request and remember its `always` patterns for the session
    Always,
    /// Refuse, failing every outstanding request of the session
    Reject,
}

/// The tool call a request was raised from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRef {
    pub message_id: String,
    pub call_id: String,
}

/// An outstanding request for a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub permission: String,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Patterns to remember if the reply is `always`
    pub always: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
}

/// Arguments to [`PermissionEngine::ask`]
#[derive(Debug, Clone)]
pub struct AskInput {
    pub session_id: String,
    pub permission: String,
    pub patterns: Vec<String>,
    pub metadata: serde_json::Value,
    pub always: Vec<String>,
    /// Policy for the calling agent
    pub ruleset: Ruleset,
    pub tool: Option<ToolRef>,
}

type Decision = std::result::Result<(), PermissionError>;

struct Pending {
    request: PermissionRequest,
    respond: oneshot::Sender<Decision>,
}

#[derive(Default)]
struct State {
    /// Keyed by request id, which ascends with creation
    pending: BTreeMap<String, Pending>,
    /// Session-scoped rules granted through `always`
    approved: HashMap<String, Ruleset>,
}

impl State {
    fn take_session(&mut self, session_id: &str, except: &str) -> Vec<Pending> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(id, p)| p.request.session_id == session_id && id.as_str() != except)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| self.pending.remove(id)).collect()
    }
}

#[derive(Clone)]
pub struct PermissionEngine {
    state: Arc<Mutex<State>>,
    bus: Bus,
}

fn replied(request: &PermissionRequest, reply: PermissionReply) -> Event {
    Event::PermissionReplied {
        session_id: request.session_id.clone(),
        request_id: request.id.clone(),
        reply,
    }
}

impl PermissionEngine {
    pub fn new(bus: Bus) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            bus,
        }
    }

    /// Check `input.patterns` against the caller's ruleset plus the
    /// session's approvals. The first pattern that is not allowed decides:
    /// `deny` fails at once, `ask` parks a request covering every pattern
    /// until it is answered or `cancel` fires.
    pub async fn ask(&self, input: AskInput, cancel: &CancellationToken) -> Decision {
        let (request, rx) = {
            let mut state = self.state.lock();
            let approved = state
                .approved
                .get(&input.session_id)
                .cloned()
                .unwrap_or_default();
            let mut needs_ask = false;
            for pattern in &input.patterns {
                let rule = evaluate(&input.permission, pattern, &[&input.ruleset, &approved]);
                match rule.action {
                    Action::Allow => {}
                    Action::Deny => {
                        debug!(permission = %input.permission, pattern, "permission denied by rule");
                        return Err(PermissionError::Denied {
                            rules: input.ruleset.matching(&input.permission),
                        });
                    }
                    Action::Ask => {
                        needs_ask = true;
                        break;
                    }
                }
            }
            if !needs_ask {
                return Ok(());
            }

            let request = PermissionRequest {
                id: id::ascending(prefix::PERMISSION),
                session_id: input.session_id,
                permission: input.permission,
                patterns: input.patterns,
                metadata: input.metadata,
                always: input.always,
                tool: input.tool,
            };
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                request.id.clone(),
                Pending {
                    request: request.clone(),
                    respond: tx,
                },
            );
            (request, rx)
        };

        info!(id = %request.id, permission = %request.permission, "asking for permission");
        let request_id = request.id.clone();
        self.bus.publish(Event::PermissionAsked { request });

        tokio::select! {
            decision = rx => decision.unwrap_or(Err(PermissionError::Cancelled)),
            _ = cancel.cancelled() => {
                let dropped = self.state.lock().pending.remove(&request_id);
                if let Some(pending) = dropped {
                    self.bus.publish(replied(&pending.request, PermissionReply::Reject));
                }
                Err(PermissionError::Cancelled)
            }
        }
    }

    /// Answer an outstanding request
    pub fn reply(
        &self,
        request_id: &str,
        reply: PermissionReply,
        message: Option<String>,
    ) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let pending = state
                .pending
                .remove(request_id)
                .ok_or_else(|| Error::not_found("Permission request", request_id))?;
            let session_id = pending.request.session_id.clone();
            events.push(replied(&pending.request, reply));
            info!(id = request_id, ?reply, "permission replied");

            match reply {
                PermissionReply::Once => {
                    let _ = pending.respond.send(Ok(()));
                }
                PermissionReply::Reject => {
                    let error = match message {
                        Some(feedback) => PermissionError::Corrected { feedback },
                        None => PermissionError::Rejected,
                    };
                    let _ = pending.respond.send(Err(error));
                    for other in state.take_session(&session_id, request_id) {
                        events.push(replied(&other.request, PermissionReply::Reject));
                        let _ = other.respond.send(Err(PermissionError::Rejected));
                    }
                }
                PermissionReply::Always => {
                    let approved = state.approved.entry(session_id.clone()).or_default();
                    for pattern in &pending.request.always {
                        approved.push(Rule::new(
                            &pending.request.permission,
                            pattern,
                            Action::Allow,
                        ));
                    }
                    let approved = approved.clone();
                    let _ = pending.respond.send(Ok(()));

                    let covered: Vec<String> = state
                        .pending
                        .values()
                        .filter(|p| p.request.session_id == session_id)
                        .filter(|p| {
                            p.request.patterns.iter().all(|pattern| {
                                evaluate(&p.request.permission, pattern, &[&approved]).action
                                    == Action::Allow
                            })
                        })
                        .map(|p| p.request.id.clone())
                        .collect();
                    for id in covered {
                        if let Some(other) = state.pending.remove(&id) {
                            debug!(id = %id, "approved by cascade");
                            events.push(replied(&other.request, PermissionReply::Always));
                            let _ = other.respond.send(Ok(()));
                        }
                    }
                }
            }
        }
        for event in events {
            self.bus.publish(event);
        }
        Ok(())
    }

    /// Outstanding requests, oldest first
    pub fn list(&self) -> Vec<PermissionRequest> {
        self.state
            .lock()
            .pending
            .values()
            .map(|p| p.request.clone())
            .collect()
    }

    /// Fail every outstanding request of a session with `Cancelled`
    pub fn cancel_session(&self, session_id: &str) {
        let dropped = self.state.lock().take_session(session_id, "");
        for pending in dropped {
            self.bus
                .publish(replied(&pending.request, PermissionReply::Reject));
            let _ = pending.respond.send(Err(PermissionError::Cancelled));
        }
    }

    /// Drop everything held for a session: its outstanding requests are
    /// cancelled and its `always` approvals forgotten
    pub fn forget_session(&self, session_id: &str) {
        self.cancel_session(session_id);
        self.state.lock().approved.remove(session_id);
    }

    /// Rules granted through `always` for a session
    pub fn approved(&self, session_id: &str) -> Ruleset {
        self.state
            .lock()
            .approved
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::time::Duration;

    #[test]
    fn test_wildcard() {
        assert!(wildcard("anything", "*"));
        assert!(wildcard("bash", "bash"));
        assert!(wildcard("ls -la", "ls *"));
        assert!(wildcard("notes.md", "*.md"));
        assert!(!wildcard("notes.txt", "*.md"));
        assert!(!wildcard("bash", "bas"));
    }

    #[test]
    fn test_later_ruleset_wins() {
        let agent = Ruleset::new().with("edit", "*", Action::Deny);
        let user = Ruleset::new().with("edit", "*.md", Action::Allow);
        assert_eq!(evaluate("edit", "notes.md", &[&agent, &user]).action, Action::Allow);
        assert_eq!(evaluate("edit", "app.ts", &[&agent, &user]).action, Action::Deny);
    }

    #[test]
    fn test_evaluate_defaults_to_ask() {
        let rule = evaluate("bash", "ls", &[]);
        assert_eq!(rule, Rule::new("bash", "*", Action::Ask));
    }

    #[test]
    fn test_permission_wildcard_in_rule() {
        let rules = Ruleset::new()
            .with("*", "*", Action::Allow)
            .with("read", "*.env", Action::Ask);
        assert_eq!(evaluate("bash", "rm -rf /", &[&rules]).action, Action::Allow);
        assert_eq!(evaluate("read", "prod.env", &[&rules]).action, Action::Ask);
    }

    #[test]
    fn test_disabled_tools() {
        let rules = Ruleset::new()
            .with("*", "*", Action::Allow)
            .with("edit", "*", Action::Deny)
            .with("bash", "*", Action::Deny)
            .with("bash", "ls *", Action::Allow);
        let disabled = disabled(["edit", "write", "apply_patch", "bash", "read"], &rules);
        assert!(disabled.contains("edit"));
        assert!(disabled.contains("write"));
        assert!(disabled.contains("apply_patch"));
        assert!(!disabled.contains("bash"));
        assert!(!disabled.contains("read"));
    }

    #[test]
    fn test_from_config_preserves_order() {
        let config: PermissionConfig = toml::from_str(
            r#"
            edit = "deny"
            [bash]
            "*" = "ask"
            "git *" = "allow"
            "#,
        )
        .unwrap();
        let rules = Ruleset::from_config(&config);
        assert_eq!(
            rules.rules(),
            &[
                Rule::new("edit", "*", Action::Deny),
                Rule::new("bash", "*", Action::Ask),
                Rule::new("bash", "git *", Action::Allow),
            ]
        );
    }

    #[test]
    fn test_home_expansion() {
        let config = PermissionConfig::new().patterns("read", &[("~/secrets/*", Action::Deny)]);
        let rules = Ruleset::from_config(&config);
        if let Some(home) = dirs::home_dir() {
            assert!(rules.rules()[0].pattern.starts_with(&*home.to_string_lossy()));
        }
    }

    fn ask_input(session: &str, patterns: &[&str], always: &[&str]) -> AskInput {
        AskInput {
            session_id: session.into(),
            permission: "bash".into(),
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            metadata: serde_json::Value::Null,
            always: always.iter().map(|s| s.to_string()).collect(),
            ruleset: Ruleset::new().with("*", "*", Action::Ask),
            tool: None,
        }
    }

    async fn wait_for_pending(engine: &PermissionEngine, n: usize) -> Vec<PermissionRequest> {
        for _ in 0..100 {
            let list = engine.list();
            if list.len() >= n {
                return list;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} pending requests");
    }

    #[tokio::test]
    async fn test_allow_returns_immediately_without_event() {
        let bus = Bus::new(16);
        let mut sub = bus.subscribe();
        let engine = PermissionEngine::new(bus);
        let mut input = ask_input("ses_1", &["ls"], &[]);
        input.ruleset = Ruleset::new().with("bash", "*", Action::Allow);
        assert_eq!(engine.ask(input, &CancellationToken::new()).await, Ok(()));
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn test_deny_fails_without_request() {
        let engine = PermissionEngine::new(Bus::default());
        let mut input = ask_input("ses_1", &["ls", "rm -rf /"], &[]);
        input.ruleset = Ruleset::new()
            .with("bash", "*", Action::Allow)
            .with("bash", "rm *", Action::Deny);
        let result = engine.ask(input, &CancellationToken::new()).await;
        assert!(matches!(result, Err(PermissionError::Denied { ref rules }) if rules.len() == 2));
        assert!(engine.list().is_empty());
    }

    #[tokio::test]
    async fn test_once_resolves_only_the_caller() {
        let bus = Bus::new(16);
        let mut asked = bus.subscribe_kind(EventKind::PermissionAsked);
        let engine = PermissionEngine::new(bus);
        let e = engine.clone();
        let task = tokio::spawn(async move {
            e.ask(ask_input("ses_1", &["ls"], &["ls *"]), &CancellationToken::new())
                .await
        });
        let pending = wait_for_pending(&engine, 1).await;
        assert_eq!(asked.drain().len(), 1);

        engine.reply(&pending[0].id, PermissionReply::Once, None).unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert!(engine.approved("ses_1").is_empty());
        assert!(engine.list().is_empty());
    }

    #[tokio::test]
    async fn test_always_cascades_only_to_covered_requests() {
        let engine = PermissionEngine::new(Bus::default());
        let e1 = engine.clone();
        let first = tokio::spawn(async move {
            e1.ask(ask_input("ses_1", &["ls -la"], &["ls -la"]), &CancellationToken::new())
                .await
        });
        wait_for_pending(&engine, 1).await;
        let e2 = engine.clone();
        let second = tokio::spawn(async move {
            e2.ask(ask_input("ses_1", &["ls -la; rm x"], &[]), &CancellationToken::new())
                .await
        });
        let pending = wait_for_pending(&engine, 2).await;

        engine
            .reply(&pending[0].id, PermissionReply::Always, None)
            .unwrap();
        assert_eq!(first.await.unwrap(), Ok(()));

        let remaining = engine.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].patterns, vec!["ls -la; rm x".to_string()]);
        assert!(!second.is_finished());

        engine
            .reply(&remaining[0].id, PermissionReply::Once, None)
            .unwrap();
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_always_releases_requests_the_new_rule_covers() {
        let engine = PermissionEngine::new(Bus::default());
        let mut tasks = Vec::new();
        for pattern in ["git status", "git diff"] {
            let e = engine.clone();
            tasks.push(tokio::spawn(async move {
                e.ask(ask_input("ses_1", &[pattern], &["git *"]), &CancellationToken::new())
                    .await
            }));
            wait_for_pending(&engine, tasks.len()).await;
        }
        let pending = engine.list();
        engine
            .reply(&pending[0].id, PermissionReply::Always, None)
            .unwrap();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(()));
        }
        assert!(engine.list().is_empty());

        // Later asks are covered by the session approval
        let later = engine
            .ask(ask_input("ses_1", &["git log"], &[]), &CancellationToken::new())
            .await;
        assert_eq!(later, Ok(()));
    }

    #[tokio::test]
    async fn test_reject_cascades_across_the_session() {
        let bus = Bus::new(32);
        let mut replied = bus.subscribe_kind(EventKind::PermissionReplied);
        let engine = PermissionEngine::new(bus);
        let mut tasks = Vec::new();
        for pattern in ["a", "b", "c"] {
            let e = engine.clone();
            tasks.push(tokio::spawn(async move {
                e.ask(ask_input("ses_1", &[pattern], &[]), &CancellationToken::new())
                    .await
            }));
            wait_for_pending(&engine, tasks.len()).await;
        }
        let e = engine.clone();
        let other_session = tokio::spawn(async move {
            e.ask(ask_input("ses_2", &["a"], &[]), &CancellationToken::new())
                .await
        });
        wait_for_pending(&engine, 4).await;

        let target = engine
            .list()
            .into_iter()
            .find(|r| r.session_id == "ses_1" && r.patterns == ["b"])
            .unwrap();
        engine
            .reply(&target.id, PermissionReply::Reject, Some("use git instead".into()))
            .unwrap();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        assert_eq!(results[0], Err(PermissionError::Rejected));
        assert_eq!(
            results[1],
            Err(PermissionError::Corrected {
                feedback: "use git instead".into()
            })
        );
        assert_eq!(results[2], Err(PermissionError::Rejected));
        assert_eq!(replied.drain().len(), 3);

        let remaining = engine.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, "ses_2");
        engine.cancel_session("ses_2");
        assert_eq!(other_session.await.unwrap(), Err(PermissionError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_token_withdraws_request() {
        let engine = PermissionEngine::new(Bus::default());
        let cancel = CancellationToken::new();
        let e = engine.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { e.ask(ask_input("ses_1", &["ls"], &[]), &token).await });
        wait_for_pending(&engine, 1).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), Err(PermissionError::Cancelled));
        assert!(engine.list().is_empty());
    }

    #[tokio::test]
    async fn test_forget_session_drops_approvals_and_requests() {
        let engine = PermissionEngine::new(Bus::default());
        let e = engine.clone();
        let granted = tokio::spawn(async move {
            e.ask(ask_input("ses_1", &["ls"], &["ls *"]), &CancellationToken::new())
                .await
        });
        let pending = wait_for_pending(&engine, 1).await;
        engine
            .reply(&pending[0].id, PermissionReply::Always, None)
            .unwrap();
        assert_eq!(granted.await.unwrap(), Ok(()));
        assert!(!engine.approved("ses_1").is_empty());

        let e = engine.clone();
        let waiting = tokio::spawn(async move {
            e.ask(ask_input("ses_1", &["rm x"], &[]), &CancellationToken::new())
                .await
        });
        wait_for_pending(&engine, 1).await;

        engine.forget_session("ses_1");
        assert_eq!(waiting.await.unwrap(), Err(PermissionError::Cancelled));
        assert!(engine.approved("ses_1").is_empty());
        assert!(engine.list().is_empty());
    }

    #[test]
    fn test_reply_to_unknown_request() {
        let engine = PermissionEngine::new(Bus::default());
        assert!(engine.reply("per_missing", PermissionReply::Once, None).is_err());
    }
}
