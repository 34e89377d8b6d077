// ── Command authorization pipeline ──
//
// Ordered admission policy for guest service calls. The order is load-
// bearing: rate limiting first bounds attacker cost cheaply; structural
// validation precedes the ownership lookup so malformed input never
// costs a store round-trip; ownership precedes the allowlist checks so
// callers cannot probe which services exist for entities they don't
// own. First failing check wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::directory::{AuditRecord, AuditSink, ServiceCaller, TokenDirectory};
use crate::error::{CommandDenied, GatewayError};
use crate::model::{CallerInfo, CommandRequest, entity_domain};
use crate::rate_limit::RateLimiter;

/// The authorization pipeline: everything a guest command passes
/// through before it may reach the upstream system.
pub struct CommandPipeline {
    limiter: Arc<RateLimiter>,
    directory: Arc<dyn TokenDirectory>,
    caller: Arc<dyn ServiceCaller>,
    audit: Arc<dyn AuditSink>,
    allowed_services: HashMap<String, HashSet<String>>,
    forbidden_data_keys: HashSet<String>,
    command_rpm: usize,
}

impl CommandPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limiter: Arc<RateLimiter>,
        directory: Arc<dyn TokenDirectory>,
        caller: Arc<dyn ServiceCaller>,
        audit: Arc<dyn AuditSink>,
        allowed_services: HashMap<String, HashSet<String>>,
        forbidden_data_keys: HashSet<String>,
        command_rpm: usize,
    ) -> Self {
        Self {
            limiter,
            directory,
            caller,
            audit,
            allowed_services,
            forbidden_data_keys,
            command_rpm,
        }
    }

    /// Admit or deny `request` for `token_id`, forwarding on success.
    ///
    /// The token itself must already be validated (non-revoked,
    /// unexpired, IP-checked) by the caller.
    pub async fn execute(
        &self,
        token_id: &str,
        request: &CommandRequest,
        caller_info: &CallerInfo,
    ) -> Result<Value, GatewayError> {
        // 1. Rate check.
        if !self.limiter.check(token_id, self.command_rpm).await {
            debug!(token_id, "command rate limited");
            return Err(CommandDenied::RateLimited.into());
        }

        // 2. Structural validation.
        if !is_valid_service_format(&request.service) {
            return Err(CommandDenied::MalformedService.into());
        }

        // 3. Ownership against the live entity list. Never the fan-out
        //    cache: staleness there must not grant access.
        let owned = self.directory.get_entity_ids(token_id).await?;
        if !owned.contains(&request.entity_id) {
            return Err(CommandDenied::EntityNotAllowed.into());
        }

        // 4. Domain derivation; a qualified service must match.
        let domain = entity_domain(&request.entity_id);
        let service = match request.service.split_once('.') {
            Some((service_domain, name)) => {
                if service_domain != domain {
                    return Err(CommandDenied::DomainMismatch {
                        service_domain: service_domain.to_owned(),
                        entity_domain: domain.to_owned(),
                    }
                    .into());
                }
                name
            }
            None => request.service.as_str(),
        };

        // 5. Allowlist membership.
        let permitted = self
            .allowed_services
            .get(domain)
            .is_some_and(|services| services.contains(service));
        if !permitted {
            return Err(CommandDenied::ServiceNotAllowed {
                service: service.to_owned(),
                domain: domain.to_owned(),
            }
            .into());
        }

        // 6. Scrub, then pin the entity id to the validated target.
        let payload = scrub_payload(
            &request.data,
            &self.forbidden_data_keys,
            &request.entity_id,
        );

        // 7. Forward; upstream failure is a gateway fault, not a denial.
        let result = self
            .caller
            .call(domain, service, &payload)
            .await
            .map_err(GatewayError::from)?;

        self.audit
            .record(AuditRecord {
                token_id: token_id.to_owned(),
                entity_id: request.entity_id.clone(),
                service: request.service.clone(),
                ip: caller_info.ip.clone(),
                user_agent: caller_info.user_agent.clone(),
            })
            .await;

        info!(
            token_id,
            entity_id = %request.entity_id,
            service = %request.service,
            "command forwarded"
        );
        Ok(result)
    }
}

/// `domain.service` or bare `service`, lowercase letters and
/// underscores only, no empty parts.
fn is_valid_service_format(service: &str) -> bool {
    fn valid_part(part: &str) -> bool {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '_')
    }

    match service.split_once('.') {
        Some((domain, name)) => valid_part(domain) && valid_part(name),
        None => valid_part(service),
    }
}

/// Remove keys that could redirect the command, then force the entity
/// id to the validated target. Whatever the caller supplied, the
/// forwarded payload can only ever address the authorized entity.
fn scrub_payload(
    data: &serde_json::Map<String, Value>,
    forbidden: &HashSet<String>,
    entity_id: &str,
) -> Value {
    let mut clean: serde_json::Map<String, Value> = data
        .iter()
        .filter(|(key, _)| !forbidden.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    clean.insert("entity_id".to_owned(), Value::String(entity_id.to_owned()));
    Value::Object(clean)
}
