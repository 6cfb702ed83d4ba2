//! Request orchestrator: resolve account, check the action allowlist,
//! ensure the label map, rewrite params, run the upstream, redact the
//! response. Every terminal path logs one structured decision record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use warden_contracts::{ErrorCode, ErrorInfo, Request, Response};
use warden_gog::RunnerProvider;
use warden_policy::{Policy, PolicySet, ResolveError};

pub struct Broker {
    policies: Arc<PolicySet>,
    runner_provider: Arc<dyn RunnerProvider>,
    default_account: String,
    verbose: bool,
    label_maps: Mutex<HashMap<String, Arc<Mutex<LabelMapState>>>>,
}

/// Per-account label-map latch. `Built` and `Failed` are terminal for the
/// process lifetime; a failed build keeps failing on purpose so a retry
/// storm cannot weaken label filtering.
enum LabelMapState {
    Pending,
    Built,
    Failed(String),
}

impl Broker {
    pub fn new(
        policies: Arc<PolicySet>,
        runner_provider: Arc<dyn RunnerProvider>,
        default_account: impl Into<String>,
        verbose: bool,
    ) -> Self {
        Self {
            policies,
            runner_provider,
            default_account: default_account.into(),
            verbose,
            label_maps: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, req: &Request) -> Response {
        let start = Instant::now();

        if self.verbose {
            tracing::info!(
                id = %req.id,
                action = %req.action,
                account = %req.account,
                param_keys = ?param_keys(req.params.as_ref()),
                "request_received"
            );
        }

        if req.id.is_empty() {
            log_error("missing_id", req, None, start);
            return Response::failure(
                "",
                ErrorInfo::new(ErrorCode::BadRequest, "id is required"),
            );
        }
        if req.action.is_empty() {
            log_error("missing_action", req, None, start);
            return Response::failure(
                &req.id,
                ErrorInfo::new(ErrorCode::BadRequest, "action is required"),
            );
        }

        let (policy, account) = match self.policies.resolve(&req.account, &self.default_account) {
            Ok(resolved) => resolved,
            Err(err) => {
                let code = match err {
                    ResolveError::AccountRequired => ErrorCode::BadRequest,
                    ResolveError::AccountNotAllowed => ErrorCode::Forbidden,
                };
                log_denied("account_denied", req, None, start);
                return Response::failure(&req.id, ErrorInfo::new(code, err.to_string()));
            }
        };

        if !policy.is_action_allowed(&req.action) {
            log_denied("action_denied", req, Some(&account), start);
            return Response::failure(
                &req.id,
                ErrorInfo::new(ErrorCode::Forbidden, "action not allowed"),
            );
        }

        if matches!(req.action.as_str(), "gmail.search" | "gmail.thread.list") {
            let needs_map = policy
                .gmail
                .as_ref()
                .map(|gmail| gmail.has_label_allowlist())
                .unwrap_or(false);
            if needs_map {
                if let Err(err) = self.ensure_label_map(&account, &policy).await {
                    tracing::warn!(account = %account, error = %err, "label_map_build_failed");
                    log_error("label_map_error", req, Some(&account), start);
                    return Response::failure(
                        &req.id,
                        ErrorInfo::new(ErrorCode::UpstreamError, "failed to resolve label ids"),
                    );
                }
            }
        }

        let params = req.params.clone().unwrap_or_default();
        let (params, mut warnings) = match policy
            .validate_and_rewrite(Utc::now(), &req.action, params)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                log_denied("policy_denied", req, Some(&account), start);
                return Response::failure(
                    &req.id,
                    ErrorInfo::new(ErrorCode::Forbidden, err.to_string()),
                );
            }
        };

        let mut run_action = req.action.as_str();
        if req.action == "gmail.send" && policy.draft_send_required(&params) {
            run_action = "gmail.drafts.create";
            warnings.push("action_rewritten:gmail.drafts.create".to_string());
            if self.verbose {
                tracing::info!(from = %req.action, to = %run_action, "action_rewritten");
            }
        }

        if req.action == "policy.actions" {
            let mut actions = policy.allowed_actions.clone();
            actions.sort();
            let data = json!({"account": account, "actions": actions});
            log_allowed("request_ok", req, Some(&account), start);
            return Response::success(&req.id, data, warnings);
        }

        // Catch unmapped params here so nothing bogus ever reaches a
        // subprocess argument list.
        if let Some(spec) = warden_gog::action_spec(run_action) {
            if let Err(err) = warden_gog::build_args(&spec, &params) {
                log_denied("params_denied", req, Some(&account), start);
                return Response::failure(
                    &req.id,
                    ErrorInfo::new(ErrorCode::BadRequest, err.to_string()),
                );
            }
        }

        let runner = self.runner_provider.runner_for(&account);
        let data = match runner.run(run_action, &params).await {
            Ok(data) => data,
            Err(err) => {
                log_error("gog_error", req, Some(&account), start);
                return Response::failure(
                    &req.id,
                    ErrorInfo::new(ErrorCode::UpstreamError, err.to_string()),
                );
            }
        };

        // Redaction routes by the outward action identity, not the
        // substituted one.
        let (clean, redaction_warnings) = match warden_redact::redact(&req.action, data, &policy) {
            Ok(result) => result,
            Err(err) => {
                log_error("redact_error", req, Some(&account), start);
                return Response::failure(
                    &req.id,
                    ErrorInfo::new(ErrorCode::RedactionError, err.to_string()),
                );
            }
        };
        warnings.extend(redaction_warnings);

        log_allowed("request_ok", req, Some(&account), start);
        Response::success(&req.id, clean, warnings)
    }

    /// Builds the per-account label map at most once per process lifetime.
    /// Concurrent callers wait on the per-account latch and observe either
    /// the built map or the latched build error.
    async fn ensure_label_map(
        &self,
        account: &str,
        policy: &Arc<Policy>,
    ) -> Result<(), String> {
        let cell = {
            let mut maps = self.label_maps.lock().await;
            Arc::clone(
                maps.entry(account.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(LabelMapState::Pending))),
            )
        };

        let mut state = cell.lock().await;
        match &*state {
            LabelMapState::Built => Ok(()),
            LabelMapState::Failed(message) => Err(message.clone()),
            LabelMapState::Pending => {
                let result = self.build_label_map(account, policy).await;
                *state = match &result {
                    Ok(()) => LabelMapState::Built,
                    Err(message) => LabelMapState::Failed(message.clone()),
                };
                result
            }
        }
    }

    async fn build_label_map(&self, account: &str, policy: &Arc<Policy>) -> Result<(), String> {
        let runner = self.runner_provider.runner_for(account);
        let data = runner
            .run("gmail.labels.list", &Map::new())
            .await
            .map_err(|err| err.to_string())?;

        let Value::Object(root) = data else {
            return Err("invalid labels response".to_string());
        };
        let Some(raw_labels) = root.get("labels") else {
            return Err("labels missing".to_string());
        };
        let Value::Array(items) = raw_labels else {
            return Err("labels invalid".to_string());
        };

        let mut id_to_name = HashMap::new();
        for item in items {
            let Value::Object(entry) = item else {
                continue;
            };
            let id = entry.get("id").and_then(Value::as_str).unwrap_or("");
            let name = entry.get("name").and_then(Value::as_str).unwrap_or("");
            if !id.is_empty() && !name.is_empty() {
                id_to_name.insert(id.to_string(), name.to_string());
            }
        }
        if id_to_name.is_empty() {
            return Err("labels empty".to_string());
        }
        policy.set_label_map(id_to_name);
        Ok(())
    }
}

fn param_keys(params: Option<&Map<String, Value>>) -> Vec<String> {
    let Some(params) = params else {
        return Vec::new();
    };
    let mut keys: Vec<String> = params.keys().cloned().collect();
    keys.sort();
    keys
}

fn log_allowed(msg: &str, req: &Request, account: Option<&str>, start: Instant) {
    tracing::info!(
        id = %req.id,
        action = %req.action,
        account = account.unwrap_or(""),
        decision = "allow",
        duration_ms = start.elapsed().as_millis() as u64,
        "{msg}"
    );
}

fn log_denied(msg: &str, req: &Request, account: Option<&str>, start: Instant) {
    tracing::info!(
        id = %req.id,
        action = %req.action,
        account = account.unwrap_or(""),
        decision = "deny",
        duration_ms = start.elapsed().as_millis() as u64,
        "{msg}"
    );
}

fn log_error(msg: &str, req: &Request, account: Option<&str>, start: Instant) {
    tracing::error!(
        id = %req.id,
        action = %req.action,
        account = account.unwrap_or(""),
        decision = "error",
        duration_ms = start.elapsed().as_millis() as u64,
        "{msg}"
    );
}
