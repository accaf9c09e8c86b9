//! The batch processor: resolve each unprocessed MQTT message's sender,
//! pick a route, run its parser, classify the result into points, and
//! dispatch them to the route's deposits.
//!
//! One deliberate design choice worth calling out (see DESIGN.md): a
//! parser failure still persists an `Extraction` row with
//! `success = false` and `error_text` set — it does not silently drop the
//! message. `ParserCodeNotFound`, `LanguageNotHandled`, `BadParserConfig`,
//! parser runtime errors, and an empty/unresolvable parse result all land
//! here. Only routing-category failures (`TopicNotFound`, `DisabledTopic`,
//! `DeviceNotFound`, `ClientNotFound`, `NoRouteFound`) leave no
//! `Extraction` behind at all.

pub mod select;
#[cfg(test)]
mod tests;

use crate::crypto::{self, keys::KeyRing};
use crate::db::Repository;
use crate::dispatch::{self, DispatchPoint};
use crate::error::{RelayError, Result};
use crate::model::{
    Client, Device, DeviceType, Dispatch, DispatchStatus, Extraction, MqttMessage, MqttTopic, ParsedPoint,
    RouteDeposit, RoutingRule,
};
use crate::parser::ParserRegistry;
use crate::value::PointValue;
use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What one message's processing produced, for the caller to persist and
/// act on. [`MessageOutcome::Skipped`] carries a routing-category error
/// that leaves the message untouched and no `Extraction` created;
/// [`MessageOutcome::Extracted`] always carries a persistable `Extraction`,
/// successful or not.
pub enum MessageOutcome {
    Skipped(RelayError),
    Extracted { extraction: Extraction, points: Vec<ParsedPoint>, route: RoutingRule },
}

/// Resolve `(topic, device, device_type, client)` for a message, raising
/// the most specific routing error for whichever lookup fails first.
async fn resolve_sender(
    repo: &dyn Repository,
    message: &MqttMessage,
) -> Result<(MqttTopic, Device, DeviceType, Client)> {
    let topic = repo
        .topic_by_name(&message.topic, false)
        .await?
        .ok_or_else(|| RelayError::TopicNotFound(message.topic.clone()))?;

    if !topic.active {
        return Err(RelayError::DisabledTopic(message.topic.clone()));
    }

    let device_id = topic.device_id.ok_or_else(|| RelayError::DeviceNotFound(message.topic.clone()))?;
    let device = repo.device(device_id).await?.ok_or_else(|| RelayError::DeviceNotFound(message.topic.clone()))?;

    let device_type = repo
        .device_type(device.device_type_id)
        .await?
        .ok_or(RelayError::DeviceTypeNotFound(device.device_type_id))?;

    let client_id = device
        .client_id
        .or(topic.client_id)
        .ok_or_else(|| RelayError::ClientNotFound(message.topic.clone()))?;
    let client = repo.client(client_id).await?.ok_or_else(|| RelayError::ClientNotFound(message.topic.clone()))?;

    Ok((topic, device, device_type, client))
}

/// The evaluation context routing-rule conditions are matched against:
/// `{device, device_type, topic, message}`, with `message.payload`
/// decoded to JSON when it parses as such.
fn routing_context(message: &MqttMessage, payload: &Value, device: &Device, device_type: &DeviceType, topic: &MqttTopic) -> Value {
    serde_json::json!({
        "device": device,
        "device_type": device_type,
        "topic": topic,
        "message": {
            "id": message.id,
            "client": message.client,
            "topic": message.topic,
            "payload": payload,
            "qos": message.qos,
            "at": message.at,
        },
    })
}

async fn process_message(
    repo: &dyn Repository,
    parsers: &ParserRegistry,
    message: &MqttMessage,
) -> Result<MessageOutcome> {
    let (topic, device, device_type, client) = match resolve_sender(repo, message).await {
        Ok(v) => v,
        Err(e) if e.is_per_message() => return Ok(MessageOutcome::Skipped(e)),
        Err(e) => return Err(e),
    };

    let payload: Value = serde_json::from_str(&message.payload).unwrap_or(Value::Null);
    let ctx = routing_context(message, &payload, &device, &device_type, &topic);

    let candidates = repo.candidate_routes(client.id, topic.id, device.id).await?;
    let route = match select::select_route(candidates, &ctx, message.id) {
        Ok(r) => r,
        Err(e) if e.is_per_message() => return Ok(MessageOutcome::Skipped(e)),
        Err(e) => return Err(e),
    };

    // Past this point every failure is parsing-category: an Extraction is
    // always persisted, success = false on error, no dispatch attempted.
    let mut extraction = Extraction {
        id: Uuid::new_v4(),
        message_id: message.id,
        parser_id: route.parser_id,
        parser_config: route.parser_config.clone(),
        parsed_at: Utc::now(),
        success: true,
        error_text: None,
        extracted_count: 0,
    };

    macro_rules! fail_extraction {
        ($err:expr) => {{
            extraction.success = false;
            extraction.error_text = Some($err.to_string());
            return Ok(MessageOutcome::Extracted { extraction, points: Vec::new(), route });
        }};
    }

    let config = match select::parse_parser_config(&route) {
        Ok(c) => c,
        Err(e) => fail_extraction!(e),
    };

    let parser = match repo.parser(route.parser_id).await? {
        Some(p) => p,
        None => fail_extraction!(RelayError::ParserNotFound(route.parser_id)),
    };

    let output = match parsers.run(&parser, &payload, &config).await {
        Ok(o) => o,
        Err(e) => fail_extraction!(e),
    };

    if output.is_empty() {
        fail_extraction!(format!("parser {} v{} returned no usable result", parser.name, parser.version));
    }

    let (metrics, meta) = crate::parser::split_metrics_and_meta(output);
    let ts = meta
        .get("at")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(message.at);
    let meta_json = serde_json::to_string(&Value::Object(meta)).unwrap_or_else(|_| "{}".to_string());

    extraction.extracted_count = metrics.len() as i32;

    let mut points = Vec::with_capacity(metrics.len());
    for (metric_id, raw_value) in metrics {
        let metric = match repo.metric(metric_id).await? {
            Some(m) => m,
            None => fail_extraction!(RelayError::MetricNotFound(metric_id)),
        };
        let Some(value) = PointValue::classify(&raw_value) else {
            continue; // parser returned null for this metric: drop the point silently
        };
        points.push(ParsedPoint {
            id: 0,
            extraction_id: extraction.id,
            device_id: device.id,
            metric_id,
            ts,
            value,
            unit: metric.default_unit,
            quality: "good".to_string(),
            meta_json: meta_json.clone(),
        });
    }

    Ok(MessageOutcome::Extracted { extraction, points, route })
}

/// Decode `destination.password_enc` under the ring's key for
/// `destination.encryption_version`, if it has a secret at all.
/// `encryption_version` is the compound `"<key_id>.<version>"` string; only
/// the bare `key_id` half is passed into the cipher (it feeds the
/// CBC-HMAC subkey derivation), the full string picks the ring entry.
async fn resolve_decoded_password(
    destination: &crate::model::ClientDestination,
    ring: &KeyRing,
) -> Result<Option<String>> {
    let (Some(password_enc), Some(encryption_version)) = (&destination.password_enc, &destination.encryption_version) else {
        return Ok(None);
    };
    let token = String::from_utf8_lossy(password_enc).to_string();
    let (key_id, version) = crate::crypto::keys::parse_encryption_version(encryption_version)?;
    let key = ring.get(&key_id, version)?;
    let plaintext = crypto::decrypt(&token, key, &key_id)?;
    Ok(Some(String::from_utf8(plaintext).map_err(|e| RelayError::InvalidToken(e.to_string()))?))
}

/// Create the `Dispatch` row, hand points to the resolved backend, and
/// persist the retry-state-machine transition. Any failure here is
/// reflected in the `Dispatch` row's status, not propagated.
async fn dispatch_to_deposit(
    repo: &dyn Repository,
    ring: &KeyRing,
    deposit: &RouteDeposit,
    extraction: &Extraction,
    points: &[ParsedPoint],
) -> Result<bool> {
    let destination = repo
        .destination(deposit.destination_id)
        .await?
        .ok_or(RelayError::DestinationNotFound(deposit.destination_id))?;

    let mut dispatch = Dispatch {
        id: Uuid::new_v4(),
        extraction_id: extraction.id,
        destination_id: destination.id,
        rule_id: deposit.rule_id,
        status: DispatchStatus::Queued.as_str().to_string(),
        http_status: None,
        response_snippet: None,
        attempts: 1,
        next_retry_at: None,
        sent_at: None,
        created_at: Utc::now(),
        updated_at: None,
    };
    repo.create_dispatch(&dispatch).await?;

    let decoded_password = match resolve_decoded_password(&destination, ring).await {
        Ok(p) => p,
        Err(e) => {
            warn!(destination_id = destination.id, error = %e, "failed to decrypt destination secret");
            dispatch.status = DispatchStatus::Failed.as_str().to_string();
            dispatch.response_snippet = Some(e.to_string());
            dispatch.updated_at = Some(Utc::now());
            repo.update_dispatch(&dispatch).await?;
            return Ok(false);
        }
    };

    let dispatcher = match dispatch::build(&destination, decoded_password) {
        Ok(d) => d,
        Err(e) => {
            dispatch.status = DispatchStatus::Failed.as_str().to_string();
            dispatch.response_snippet = Some(e.to_string());
            dispatch.updated_at = Some(Utc::now());
            repo.update_dispatch(&dispatch).await?;
            return Ok(false);
        }
    };

    let mut dispatch_points = Vec::with_capacity(points.len());
    for point in points {
        let key_name = repo.metric(point.metric_id).await?.map(|m| m.key_name).unwrap_or_default();
        dispatch_points.push(DispatchPoint { point: point.clone(), key_name });
    }

    let outcome = match dispatcher.dispatch(&dispatch_points).await {
        Ok(o) => o,
        Err(e) => crate::dispatch::DispatchOutcome::failed(e.to_string()),
    };

    dispatch.status = if outcome.sent {
        DispatchStatus::Sent.as_str().to_string()
    } else if dispatch.attempts >= dispatch::MAX_ATTEMPTS {
        DispatchStatus::Dead.as_str().to_string()
    } else {
        DispatchStatus::Retrying.as_str().to_string()
    };
    dispatch.http_status = outcome.http_status;
    dispatch.response_snippet = Some(outcome.response_snippet);
    dispatch.next_retry_at = if outcome.sent { None } else { Some(dispatch::next_retry_at(dispatch.attempts, Utc::now())) };
    dispatch.sent_at = if outcome.sent { Some(Utc::now()) } else { None };
    dispatch.updated_at = Some(Utc::now());
    repo.update_dispatch(&dispatch).await?;

    Ok(outcome.sent)
}

/// Fan the extraction's points out to every deposit configured for its
/// route, succeeding only if all of them do.
async fn send_parsed_data(
    repo: &dyn Repository,
    ring: &KeyRing,
    route: &RoutingRule,
    extraction: &Extraction,
    points: &[ParsedPoint],
) -> Result<bool> {
    let deposits = repo.deposits_for_rule(route.id).await?;
    if deposits.is_empty() {
        return Err(RelayError::DepositNotFound(route.id));
    }

    let mut all_sent = true;
    for deposit in &deposits {
        let sent = match dispatch_to_deposit(repo, ring, deposit, extraction, points).await {
            Ok(sent) => sent,
            Err(e) => {
                error!(destination_id = deposit.destination_id, error = %e, "dispatch to deposit failed");
                false
            }
        };
        if !sent {
            all_sent = false;
        }
    }
    Ok(all_sent)
}

/// Run one batch pass over every unprocessed message. Returns `true` if
/// every message was fully processed
/// and dispatched; `false` if any per-message failure occurred (the exit
/// code 2 case), while still completing the pass. Infrastructure errors
/// (database, etc.) abort the whole pass and propagate.
pub async fn process(repo: &dyn Repository, parsers: &ParserRegistry, ring: &KeyRing) -> Result<bool> {
    let messages = repo.unprocessed_messages().await?;
    info!(count = messages.len(), "processing unprocessed mqtt messages");

    let mut all_treated = true;

    for message in &messages {
        match process_message(repo, parsers, message).await {
            Ok(MessageOutcome::Skipped(e)) => {
                warn!(message_id = message.id, error = %e, "message skipped");
                all_treated = false;
            }
            Ok(MessageOutcome::Extracted { extraction, points, route }) => {
                repo.create_extraction(&extraction).await?;
                for point in &points {
                    repo.create_parsed_point(point).await?;
                }

                if !extraction.success {
                    all_treated = false;
                    continue;
                }

                let sent = match send_parsed_data(repo, ring, &route, &extraction, &points).await {
                    Ok(sent) => sent,
                    Err(e) => {
                        warn!(message_id = message.id, error = %e, "send_parsed_data failed");
                        false
                    }
                };
                repo.mark_message_processed(message.id, extraction.id, sent).await?;
                if !sent {
                    all_treated = false;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Ok(all_treated)
}
