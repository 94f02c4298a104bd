use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use cron::Schedule;
use eyre::{Result, eyre};

/// How far back to scan for the previous trigger of a non-macro expression.
const CRON_LOOKBACK_DAYS: i64 = 7;

/// Gates the eviction loop on a cron-defined activation window.
///
/// With neither a schedule nor a duration configured the gate is always open.
/// Configuring exactly one of the two is rejected.
#[derive(Clone, Debug)]
pub struct ScheduleGate {
    window: Option<Window>,
}

#[derive(Clone, Debug)]
struct Window {
    trigger: Trigger,
    active_for: Duration,
}

#[derive(Clone, Debug)]
enum Trigger {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Cron(Schedule),
}

impl ScheduleGate {
    pub fn try_new(schedule: Option<&str>, duration: Option<&str>) -> Result<ScheduleGate> {
        let window = match (schedule, duration) {
            (None, None) => None,
            (Some(schedule), Some(duration)) => Some(Window {
                trigger: parse_trigger(schedule)?,
                active_for: parse_window_duration(duration)?,
            }),
            (Some(_), None) => {
                return Err(eyre!(
                    "eviction loop schedule is set but the window duration is not"
                ));
            }
            (None, Some(_)) => {
                return Err(eyre!(
                    "eviction loop window duration is set but the schedule is not"
                ));
            }
        };

        Ok(ScheduleGate { window })
    }

    /// Whether the loop may act at `now`. Deterministic in its inputs.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let Some(window) = &self.window else {
            return true;
        };

        match window.trigger.last_trigger(now) {
            Some(last) => {
                let elapsed = now - last;
                elapsed >= Duration::zero() && elapsed <= window.active_for
            }
            None => false,
        }
    }
}

impl Trigger {
    fn last_trigger(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();

        match self {
            Trigger::Hourly => Some(midnight + Duration::hours(now.hour() as i64)),
            Trigger::Daily => Some(midnight),
            Trigger::Weekly => {
                Some(midnight - Duration::days(now.weekday().num_days_from_sunday() as i64))
            }
            Trigger::Monthly => Some(midnight - Duration::days(now.day0() as i64)),
            Trigger::Yearly => Some(midnight - Duration::days(now.ordinal0() as i64)),
            Trigger::Cron(schedule) => {
                let lookback = now - Duration::days(CRON_LOOKBACK_DAYS);
                schedule
                    .after(&lookback)
                    .take_while(|trigger| *trigger <= now)
                    .last()
            }
        }
    }
}

fn parse_trigger(input: &str) -> Result<Trigger> {
    match input.trim() {
        "@hourly" => Ok(Trigger::Hourly),
        "@daily" | "@midnight" => Ok(Trigger::Daily),
        "@weekly" => Ok(Trigger::Weekly),
        "@monthly" => Ok(Trigger::Monthly),
        "@yearly" | "@annually" => Ok(Trigger::Yearly),
        expr => {
            if expr.split_whitespace().count() != 5 {
                return Err(eyre!("expected a 5-field cron expression, got {expr:?}"));
            }

            // The cron crate wants a seconds field.
            let schedule = Schedule::from_str(&format!("0 {expr}"))
                .map_err(|err| eyre!("invalid cron expression {expr:?}: {err}"))?;
            Ok(Trigger::Cron(schedule))
        }
    }
}

/// Parses the activation window length: a compound of hours and minutes only,
/// e.g. "2h", "30m", "10h5m", "160h". Zero-length windows are rejected.
fn parse_window_duration(input: &str) -> Result<Duration> {
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut any_component = false;

    for ch in input.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let value: i64 = digits
            .parse()
            .map_err(|_| eyre!("expected a number before {ch:?} in {input:?}"))?;
        digits.clear();
        any_component = true;

        match ch {
            'h' => total = total + Duration::hours(value),
            'm' => total = total + Duration::minutes(value),
            other => {
                return Err(eyre!(
                    "unsupported unit {other:?} in {input:?}, only hours and minutes are accepted"
                ));
            }
        }
    }

    if !digits.is_empty() {
        return Err(eyre!("missing unit after {digits:?} in {input:?}"));
    }
    if !any_component {
        return Err(eyre!("empty window duration"));
    }
    if total <= Duration::zero() {
        return Err(eyre!("window duration must be positive"));
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn unconfigured_gate_is_always_open() {
        let gate = ScheduleGate::try_new(None, None).unwrap();
        assert!(gate.is_active(at("2025-03-12T05:00:00Z")));
    }

    #[test]
    fn half_configured_gate_is_rejected() {
        assert!(ScheduleGate::try_new(Some("@daily"), None).is_err());
        assert!(ScheduleGate::try_new(None, Some("2h")).is_err());
    }

    #[test]
    fn daily_window_closes_after_the_duration() {
        let gate = ScheduleGate::try_new(Some("@daily"), Some("2h")).unwrap();

        assert!(gate.is_active(at("2025-03-12T00:00:00Z")));
        assert!(gate.is_active(at("2025-03-12T01:59:59Z")));
        assert!(gate.is_active(at("2025-03-12T02:00:00Z")));
        assert!(!gate.is_active(at("2025-03-12T05:00:00Z")));
        assert!(!gate.is_active(at("2025-03-12T23:59:59Z")));
    }

    #[test]
    fn hourly_window() {
        let gate = ScheduleGate::try_new(Some("@hourly"), Some("30m")).unwrap();

        assert!(gate.is_active(at("2025-03-12T14:10:00Z")));
        assert!(gate.is_active(at("2025-03-12T14:30:00Z")));
        assert!(!gate.is_active(at("2025-03-12T14:31:00Z")));
    }

    #[test]
    fn weekly_window_anchors_on_sunday() {
        let gate = ScheduleGate::try_new(Some("@weekly"), Some("24h")).unwrap();

        // 2025-03-09 is a Sunday
        assert!(gate.is_active(at("2025-03-09T12:00:00Z")));
        assert!(!gate.is_active(at("2025-03-11T12:00:00Z")));
    }

    #[test]
    fn monthly_and_yearly_windows() {
        let gate = ScheduleGate::try_new(Some("@monthly"), Some("48h")).unwrap();
        assert!(gate.is_active(at("2025-03-02T12:00:00Z")));
        assert!(!gate.is_active(at("2025-03-15T12:00:00Z")));

        let gate = ScheduleGate::try_new(Some("@yearly"), Some("24h")).unwrap();
        assert!(gate.is_active(at("2025-01-01T12:00:00Z")));
        assert!(!gate.is_active(at("2025-03-01T12:00:00Z")));

        let gate = ScheduleGate::try_new(Some("@annually"), Some("24h")).unwrap();
        assert!(gate.is_active(at("2025-01-01T12:00:00Z")));
    }

    #[test]
    fn five_field_expression_scans_for_the_previous_trigger() {
        let gate = ScheduleGate::try_new(Some("30 9 * * *"), Some("1h")).unwrap();

        assert!(gate.is_active(at("2025-03-12T09:45:00Z")));
        assert!(gate.is_active(at("2025-03-12T10:30:00Z")));
        assert!(!gate.is_active(at("2025-03-12T10:31:00Z")));
        assert!(!gate.is_active(at("2025-03-12T09:29:00Z")));
    }

    #[test]
    fn trigger_outside_the_lookback_window_means_inactive() {
        // fires once a year; a 7 day scan in June finds nothing
        let gate = ScheduleGate::try_new(Some("0 0 1 1 *"), Some("1h")).unwrap();
        assert!(!gate.is_active(at("2025-06-15T12:00:00Z")));
        assert!(gate.is_active(at("2025-01-01T00:30:00Z")));
    }

    #[test]
    fn is_active_is_deterministic() {
        let gate = ScheduleGate::try_new(Some("*/5 * * * *"), Some("2m")).unwrap();
        let now = at("2025-03-12T09:06:00Z");
        assert_eq!(gate.is_active(now), gate.is_active(now));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(ScheduleGate::try_new(Some("* * *"), Some("1h")).is_err());
        assert!(ScheduleGate::try_new(Some("61 * * * *"), Some("1h")).is_err());
    }

    #[test]
    fn parses_compound_window_durations() {
        assert_eq!(parse_window_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_window_duration("30m").unwrap(), Duration::minutes(30));
        assert_eq!(
            parse_window_duration("10h5m").unwrap(),
            Duration::minutes(605)
        );
        assert_eq!(parse_window_duration("160h").unwrap(), Duration::hours(160));
    }

    #[test]
    fn rejects_malformed_window_durations() {
        assert!(parse_window_duration("").is_err());
        assert!(parse_window_duration("10").is_err());
        assert!(parse_window_duration("10s").is_err());
        assert!(parse_window_duration("h").is_err());
        assert!(parse_window_duration("0m").is_err());
        assert!(parse_window_duration("1.5h").is_err());
    }
}
