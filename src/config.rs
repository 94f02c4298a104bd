use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::{ArgAction, Parser};
use eyre::{Result, eyre};
use humantime::parse_duration;

use crate::consts::{
    ALLOW_EVICTION_LABEL_KEY, EXPIRES_ON_LABEL_KEY, PARKED_BY_LABEL_KEY, PARKED_BY_VALUE,
    PARKING_REASON_LABEL_KEY, RESTARTED_AT_ANNOTATION_KEY, TO_BE_DELETED_TAINT_KEY,
    UPGRADE_STATUS_LABEL_KEY,
};

#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct Config {
    /// Period of the eviction loop.
    #[arg(long, env = "EVICTION_LOOP_INTERVAL", default_value = "60s", value_parser = parse_interval)]
    pub eviction_loop_interval: Duration,

    /// Cron expression marking when the loop may start acting.
    /// Must be set together with --eviction-loop-duration.
    #[arg(long, env = "EVICTION_LOOP_SCHEDULE")]
    pub eviction_loop_schedule: Option<String>,

    /// Length of the active window opened by --eviction-loop-schedule,
    /// as a compound of hours and minutes (e.g. "2h", "30m", "10h5m").
    #[arg(long, env = "EVICTION_LOOP_DURATION")]
    pub eviction_loop_duration: Option<String>,

    /// Time from parking a node until its pods may be force deleted.
    #[arg(long, env = "PARKED_NODE_TTL", default_value = "1h", value_parser = parse_interval)]
    pub parked_node_ttl: Duration,

    /// Fraction of the TTL that must pass before the planner prefers
    /// rollout restarts over soft eviction.
    #[arg(long, env = "ROLLING_RESTART_THRESHOLD", default_value_t = 0.5, value_parser = parse_threshold)]
    pub rolling_restart_threshold: f64,

    #[arg(long, env = "UPGRADE_STATUS_LABEL", default_value = UPGRADE_STATUS_LABEL_KEY)]
    pub upgrade_status_label: String,

    #[arg(long, env = "EXPIRES_ON_LABEL", default_value = EXPIRES_ON_LABEL_KEY)]
    pub expires_on_label: String,

    #[arg(long, env = "PARKED_BY_LABEL", default_value = PARKED_BY_LABEL_KEY)]
    pub parked_by_label: String,

    #[arg(long, env = "PARKED_BY_VALUE", default_value = PARKED_BY_VALUE)]
    pub parked_by_value: String,

    #[arg(long, env = "PARKING_REASON_LABEL", default_value = PARKING_REASON_LABEL_KEY)]
    pub parking_reason_label: String,

    #[arg(long, env = "ALLOW_EVICTION_LABEL", default_value = ALLOW_EVICTION_LABEL_KEY)]
    pub allow_eviction_label: String,

    #[arg(long, env = "RESTARTED_AT_ANNOTATION", default_value = RESTARTED_AT_ANNOTATION_KEY)]
    pub restarted_at_annotation: String,

    /// Pods in namespaces with this prefix skip the soft-eviction phase.
    /// Empty disables the skip.
    #[arg(long, env = "NAMESPACE_PREFIX_SKIP_INITIAL_EVICTION", default_value = "")]
    pub namespace_prefix_skip_initial_eviction: String,

    /// Key of the taint marking nodes an external autoscaler already owns.
    #[arg(long, env = "TO_BE_DELETED_TAINT", default_value = TO_BE_DELETED_TAINT_KEY)]
    pub to_be_deleted_taint: String,

    /// Taint applied to parked nodes, as "key=value:effect".
    #[arg(
        long,
        env = "PARKED_NODE_TAINT",
        default_value = "shredder.ethos.adobe.net/upgrade-status=parked:NoSchedule"
    )]
    pub parked_node_taint: ParkingTaint,

    #[arg(long, env = "ARGO_ROLLOUTS_API_VERSION", default_value = "v1alpha1")]
    pub argo_rollouts_api_version: String,

    #[arg(long, env = "ENABLE_KARPENTER_DRIFT_DETECTION", default_value_t = false, action = ArgAction::Set)]
    pub enable_karpenter_drift_detection: bool,

    #[arg(long, env = "ENABLE_KARPENTER_DISRUPTION_DETECTION", default_value_t = false, action = ArgAction::Set)]
    pub enable_karpenter_disruption_detection: bool,

    #[arg(long, env = "ENABLE_NODE_LABEL_DETECTION", default_value_t = false, action = ArgAction::Set)]
    pub enable_node_label_detection: bool,

    /// Node label selectors, each "key" or "key=value". A node parked by the
    /// label source matches any one of them.
    #[arg(long, env = "NODE_LABELS_TO_DETECT", value_delimiter = ',', value_parser = parse_label_selector)]
    pub node_labels_to_detect: Vec<String>,

    /// Ceiling on simultaneously parked nodes: an integer, a percentage of
    /// the cluster ("20%"), or "0" for no limit.
    #[arg(long, env = "MAX_PARKED_NODES", default_value = "0")]
    pub max_parked_nodes: String,

    /// Additional labels applied while parking, each "key=value".
    #[arg(long, env = "EXTRA_PARKING_LABELS", value_delimiter = ',', value_parser = parse_key_value)]
    pub extra_parking_labels: Vec<KeyValue>,

    /// Require every evictable pod on a node to carry the parking labels
    /// before force deletion proceeds.
    #[arg(long, env = "EVICTION_SAFETY_CHECK", default_value_t = true, action = ArgAction::Set)]
    pub eviction_safety_check: bool,

    /// Annotate every mutating API call with server-side dry-run.
    #[arg(long, env = "DRY_RUN", default_value_t = false, action = ArgAction::Set)]
    pub dry_run: bool,
}

impl Config {
    pub fn extra_parking_labels_map(&self) -> BTreeMap<String, String> {
        self.extra_parking_labels
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    }
}

fn parse_interval(input: &str) -> Result<Duration> {
    let duration = parse_duration(input)?;
    if duration.is_zero() {
        return Err(eyre!("duration must be positive"));
    }

    Ok(duration)
}

fn parse_threshold(input: &str) -> Result<f64> {
    let value: f64 = input.parse()?;
    if !(0.0..=1.0).contains(&value) {
        return Err(eyre!("rolling restart threshold must be within [0, 1]"));
    }

    Ok(value)
}

fn parse_label_selector(input: &str) -> Result<String> {
    let (key, _) = match input.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (input, None),
    };
    if key.is_empty() {
        return Err(eyre!("label selector must have a non-empty key: {input:?}"));
    }

    Ok(String::from(input))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

fn parse_key_value(input: &str) -> Result<KeyValue> {
    let Some((key, value)) = input.split_once('=') else {
        return Err(eyre!("expected \"key=value\", got {input:?}"));
    };
    if key.is_empty() {
        return Err(eyre!("expected a non-empty key in {input:?}"));
    }

    Ok(KeyValue {
        key: String::from(key),
        value: String::from(value),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl FromStr for TaintEffect {
    type Err = eyre::Report;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            other => Err(eyre!("unknown taint effect: {other:?}")),
        }
    }
}

/// The parking taint, configured as a single "key=value:effect" string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParkingTaint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl FromStr for ParkingTaint {
    type Err = eyre::Report;

    fn from_str(input: &str) -> Result<Self> {
        let Some((pair, effect)) = input.rsplit_once(':') else {
            return Err(eyre!("expected \"key=value:effect\", got {input:?}"));
        };
        let Some((key, value)) = pair.split_once('=') else {
            return Err(eyre!("expected \"key=value:effect\", got {input:?}"));
        };
        if key.is_empty() {
            return Err(eyre!("expected a non-empty taint key in {input:?}"));
        }

        Ok(ParkingTaint {
            key: String::from(key),
            value: String::from(value),
            effect: effect.parse()?,
        })
    }
}

impl fmt::Display for ParkingTaint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.key, self.value, self.effect.as_str())
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config::parse_from([crate::consts::CONTROLLER_NAME])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_defaults() {
        let config = test_config();

        assert_eq!(config.eviction_loop_interval, Duration::from_secs(60));
        assert_eq!(config.parked_node_ttl, Duration::from_secs(3600));
        assert_eq!(config.rolling_restart_threshold, 0.5);
        assert_eq!(config.max_parked_nodes, "0");
        assert!(config.eviction_safety_check);
        assert!(!config.dry_run);
        assert_eq!(config.parked_node_taint.key, UPGRADE_STATUS_LABEL_KEY);
        assert_eq!(config.parked_node_taint.effect, TaintEffect::NoSchedule);
    }

    #[test]
    fn should_parse_taint_string() {
        let taint: ParkingTaint = "dedicated=infra:NoExecute".parse().unwrap();
        assert_eq!(taint.key, "dedicated");
        assert_eq!(taint.value, "infra");
        assert_eq!(taint.effect, TaintEffect::NoExecute);
        assert_eq!(taint.to_string(), "dedicated=infra:NoExecute");
    }

    #[test]
    fn should_reject_malformed_taint_strings() {
        assert!("dedicated=infra".parse::<ParkingTaint>().is_err());
        assert!("dedicated:NoSchedule".parse::<ParkingTaint>().is_err());
        assert!("=infra:NoSchedule".parse::<ParkingTaint>().is_err());
        assert!("dedicated=infra:Sometimes".parse::<ParkingTaint>().is_err());
    }

    #[test]
    fn should_reject_threshold_outside_unit_interval() {
        assert!(parse_threshold("0").is_ok());
        assert!(parse_threshold("1").is_ok());
        assert!(parse_threshold("0.3").is_ok());
        assert!(parse_threshold("-0.1").is_err());
        assert!(parse_threshold("1.5").is_err());
    }

    #[test]
    fn should_parse_key_value_pairs() {
        assert_eq!(
            parse_key_value("team=storage").unwrap(),
            KeyValue {
                key: String::from("team"),
                value: String::from("storage"),
            }
        );
        assert!(parse_key_value("team").is_err());
        assert!(parse_key_value("=storage").is_err());
    }

    #[test]
    fn should_validate_label_selectors() {
        assert!(parse_label_selector("upgrade-me").is_ok());
        assert!(parse_label_selector("upgrade-me=true").is_ok());
        assert!(parse_label_selector("=true").is_err());
    }
}
