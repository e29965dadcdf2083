//! Service configuration and its environment-variable surface.
//!
//! Every recognized option has a default, so a bare environment yields a
//! working single-process configuration (publishing disabled, default
//! table names). Parsing is deliberately lenient: an invalid retry count
//! falls back to the default rather than failing startup.

use std::collections::HashMap;
use std::env;

use crate::event::StreamType;
use crate::snapshot::SnapshotPolicy;

/// Document-store table names for the query side and the gate.
#[derive(Debug, Clone)]
pub struct ProjectionTables {
    pub users: String,
    pub resources: String,
    pub reservations: String,
    pub idempotency: String,
    pub projection_lag: String,
}

impl Default for ProjectionTables {
    fn default() -> Self {
        Self {
            users: "users_projection".to_string(),
            resources: "resources_projection".to_string(),
            reservations: "reservations_projection".to_string(),
            idempotency: "idempotency_table".to_string(),
            projection_lag: "projection_lag".to_string(),
        }
    }
}

/// The full set of recognized options.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Consumed by the transport for bearer verification; opaque here.
    pub jwt_secret: String,
    /// Shared secret gating `BootstrapAdmin`.
    pub admin_bootstrap_key: String,
    pub aws_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_bucket_events: String,
    /// `None` (unset or empty) disables event publishing.
    pub sqs_queue_url: Option<String>,
    pub sqs_endpoint: Option<String>,
    pub dynamo_endpoint: Option<String>,
    pub tables: ProjectionTables,
    pub page_limit_default: usize,
    pub snapshots: SnapshotPolicy,
    /// Extra command attempts after a version conflict. Non-negative and
    /// finite; anything else falls back to the default of 1.
    pub version_conflict_max_retries: u32,
    /// Append a `ConcurrencyConflictUnresolved` telemetry event when the
    /// retries run out.
    pub emit_concurrency_conflict_unresolved_event: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            jwt_secret: String::new(),
            admin_bootstrap_key: "bootstrap-local-key".to_string(),
            aws_region: "us-east-1".to_string(),
            s3_endpoint: None,
            s3_bucket_events: "reserva-events".to_string(),
            sqs_queue_url: None,
            sqs_endpoint: None,
            dynamo_endpoint: None,
            tables: ProjectionTables::default(),
            page_limit_default: 20,
            snapshots: SnapshotPolicy::default(),
            version_conflict_max_retries: 1,
            emit_concurrency_conflict_unresolved_event: false,
        }
    }
}

impl Config {
    /// Read the full environment-variable surface.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let snapshots = SnapshotPolicy {
            default_every: env_opt("SNAPSHOT_EVERY_DEFAULT")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.snapshots.default_every),
            by_stream_type: parse_threshold_map(env_opt("SNAPSHOT_BY_STREAM_TYPE"))
                .unwrap_or(defaults.snapshots.by_stream_type),
        };
        Self {
            port: env_opt("PORT")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.port),
            jwt_secret: env_opt("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            admin_bootstrap_key: env_opt("ADMIN_BOOTSTRAP_KEY")
                .unwrap_or(defaults.admin_bootstrap_key),
            aws_region: env_opt("AWS_REGION").unwrap_or(defaults.aws_region),
            s3_endpoint: env_opt("S3_ENDPOINT"),
            s3_bucket_events: env_opt("S3_BUCKET_EVENTS").unwrap_or(defaults.s3_bucket_events),
            sqs_queue_url: env_opt("SQS_QUEUE_URL"),
            sqs_endpoint: env_opt("SQS_ENDPOINT"),
            dynamo_endpoint: env_opt("DYNAMO_ENDPOINT"),
            tables: ProjectionTables {
                users: env_opt("USERS_PROJECTION_TABLE").unwrap_or(defaults.tables.users),
                resources: env_opt("RESOURCES_PROJECTION_TABLE")
                    .unwrap_or(defaults.tables.resources),
                reservations: env_opt("RESERVATIONS_PROJECTION_TABLE")
                    .unwrap_or(defaults.tables.reservations),
                idempotency: env_opt("IDEMPOTENCY_TABLE").unwrap_or(defaults.tables.idempotency),
                projection_lag: env_opt("PROJECTION_LAG_TABLE")
                    .unwrap_or(defaults.tables.projection_lag),
            },
            page_limit_default: env_opt("PAGE_LIMIT_DEFAULT")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.page_limit_default),
            snapshots,
            version_conflict_max_retries: parse_retries(env_opt("VERSION_CONFLICT_MAX_RETRIES")),
            emit_concurrency_conflict_unresolved_event: parse_flag(env_opt(
                "EMIT_CONCURRENCY_CONFLICT_UNRESOLVED_EVENT",
            )),
        }
    }

    /// Whether event publishing is enabled (a queue URL is configured).
    pub fn publishing_enabled(&self) -> bool {
        self.sqs_queue_url.is_some()
    }
}

/// Read an environment variable, treating unset and empty alike.
fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

/// Retry-count parsing: non-negative, finite integers only; everything
/// else (unset, garbage, negative) falls back to the default of 1.
fn parse_retries(raw: Option<String>) -> u32 {
    raw.and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|n| *n >= 0)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(1)
}

/// Parse the `SNAPSHOT_BY_STREAM_TYPE` JSON map, e.g. `{"resource": 500,
/// "user": 0}`. Unknown stream type names are ignored; a malformed value
/// returns `None` so the caller keeps the default map.
fn parse_threshold_map(raw: Option<String>) -> Option<HashMap<StreamType, u64>> {
    let raw = raw?;
    let parsed: HashMap<String, u64> = serde_json::from_str(&raw).ok()?;
    Some(
        parsed
            .into_iter()
            .filter_map(|(name, every)| name.parse::<StreamType>().ok().map(|ty| (ty, every)))
            .collect(),
    )
}

fn parse_flag(raw: Option<String>) -> bool {
    matches!(
        raw.as_deref().map(str::trim),
        Some("1") | Some("true") | Some("TRUE") | Some("True")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_working_local_setup() {
        let config = Config::default();
        assert_eq!(config.page_limit_default, 20);
        assert_eq!(config.version_conflict_max_retries, 1);
        assert!(!config.emit_concurrency_conflict_unresolved_event);
        assert!(!config.publishing_enabled());
        assert_eq!(config.snapshots.default_every, 500);
        assert_eq!(config.snapshots.threshold(StreamType::Resource), 500);
        assert_eq!(config.snapshots.threshold(StreamType::User), 0);
    }

    #[test]
    fn retries_fall_back_on_invalid_input() {
        assert_eq!(parse_retries(None), 1);
        assert_eq!(parse_retries(Some("0".into())), 0);
        assert_eq!(parse_retries(Some("3".into())), 3);
        assert_eq!(parse_retries(Some("-2".into())), 1, "negative falls back");
        assert_eq!(parse_retries(Some("lots".into())), 1, "garbage falls back");
        assert_eq!(
            parse_retries(Some("99999999999999999999".into())),
            1,
            "non-finite input falls back"
        );
    }

    #[test]
    fn threshold_map_parses_and_skips_unknown_types() {
        let map = parse_threshold_map(Some(r#"{"resource": 2, "user": 7, "widget": 9}"#.into()))
            .expect("well-formed map should parse");
        assert_eq!(map.get(&StreamType::Resource), Some(&2));
        assert_eq!(map.get(&StreamType::User), Some(&7));
        assert_eq!(map.len(), 2, "unknown stream types are ignored");
    }

    #[test]
    fn malformed_threshold_map_keeps_default() {
        assert!(parse_threshold_map(Some("not json".into())).is_none());
        assert!(parse_threshold_map(None).is_none());
    }

    #[test]
    fn flag_parsing_accepts_common_truthy_forms() {
        assert!(parse_flag(Some("true".into())));
        assert!(parse_flag(Some("1".into())));
        assert!(!parse_flag(Some("false".into())));
        assert!(!parse_flag(Some("yes".into())));
        assert!(!parse_flag(None));
    }
}
