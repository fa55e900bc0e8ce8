//! Threshold policy
//!
//! Upsize when either available metric is at or above its upsize threshold.
//! Downsize only when every available metric is at or below its downsize
//! threshold. A missing memory reading drops that half of each comparison;
//! it never counts as 0 or 100. Upsize wins when both conditions hold.

use crate::error::EvaluationError;
use crate::models::{InstanceProfile, MetricSample, SizingDecision};
use tracing::debug;

/// Evaluate one sample against one profile
pub fn evaluate(
    profile: &InstanceProfile,
    sample: &MetricSample,
) -> Result<SizingDecision, EvaluationError> {
    validate_sample(profile, sample)?;

    let current = profile.current_size_class.as_str();
    if !profile.ladder.contains(current) {
        return Err(EvaluationError::UnknownSizeClass {
            instance_id: profile.instance_id.clone(),
            size_class: current.to_string(),
        });
    }

    let t = &profile.thresholds;
    let readings = [
        (sample.cpu_pct, t.cpu_upsize, t.cpu_downsize),
        (sample.mem_pct, t.mem_upsize, t.mem_downsize),
    ];
    let available: Vec<(f64, f64, f64)> = readings
        .iter()
        .filter_map(|(value, up, down)| value.map(|v| (v, *up, *down)))
        .collect();

    let wants_upsize = available.iter().any(|(v, up, _)| v >= up);
    let wants_downsize = available.iter().all(|(v, _, down)| v <= down);

    let decision = if wants_upsize {
        match profile.ladder.next_larger(current) {
            Some(target) => SizingDecision::Upsize {
                target: target.to_string(),
            },
            None => SizingDecision::NoAction,
        }
    } else if wants_downsize {
        match profile.ladder.next_smaller(current) {
            Some(target) => SizingDecision::Downsize {
                target: target.to_string(),
            },
            None => SizingDecision::NoAction,
        }
    } else {
        SizingDecision::NoAction
    };

    debug!(
        instance_id = %profile.instance_id,
        current = %current,
        cpu_pct = ?sample.cpu_pct,
        mem_pct = ?sample.mem_pct,
        wants_upsize,
        wants_downsize,
        decision = decision.label(),
        "Evaluated utilization"
    );

    Ok(decision)
}

fn validate_sample(profile: &InstanceProfile, sample: &MetricSample) -> Result<(), EvaluationError> {
    if sample.cpu_pct.is_none() && sample.mem_pct.is_none() {
        return Err(EvaluationError::MetricUnavailable {
            instance_id: profile.instance_id.clone(),
            reason: "neither cpu nor memory reported".to_string(),
        });
    }

    for (name, value) in [("cpu", sample.cpu_pct), ("memory", sample.mem_pct)] {
        if let Some(v) = value {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                return Err(EvaluationError::InvalidSample(format!(
                    "{} utilization {} is outside 0..=100",
                    name, v
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ladder::SizeLadder;
    use crate::models::Thresholds;
    use chrono::Utc;

    const LADDER: [&str; 4] = ["m5.large", "m5.xlarge", "m5.2xlarge", "m5.4xlarge"];

    fn thresholds() -> Thresholds {
        Thresholds {
            cpu_upsize: 85.0,
            cpu_downsize: 20.0,
            mem_upsize: 85.0,
            mem_downsize: 20.0,
        }
    }

    fn profile(current: &str, floor: Option<&str>) -> InstanceProfile {
        InstanceProfile {
            instance_id: "i-0abc".to_string(),
            current_size_class: current.to_string(),
            thresholds: thresholds(),
            ladder: SizeLadder::new(LADDER, floor.map(str::to_string)).unwrap(),
            notification_channel: "ops".to_string(),
        }
    }

    fn sample(cpu: Option<f64>, mem: Option<f64>) -> MetricSample {
        MetricSample {
            cpu_pct: cpu,
            mem_pct: mem,
            window_secs: 3600,
            timestamp: Utc::now(),
        }
    }

    fn upsize(target: &str) -> SizingDecision {
        SizingDecision::Upsize {
            target: target.to_string(),
        }
    }

    fn downsize(target: &str) -> SizingDecision {
        SizingDecision::Downsize {
            target: target.to_string(),
        }
    }

    #[test]
    fn test_high_cpu_upsizes_to_next_class() {
        let decision = evaluate(&profile("m5.large", None), &sample(Some(90.0), Some(40.0)));
        assert_eq!(decision.unwrap(), upsize("m5.xlarge"));
    }

    #[test]
    fn test_high_memory_alone_upsizes() {
        let decision = evaluate(&profile("m5.xlarge", None), &sample(Some(30.0), Some(85.0)));
        assert_eq!(decision.unwrap(), upsize("m5.2xlarge"));
    }

    #[test]
    fn test_threshold_boundaries_are_inclusive() {
        let p = profile("m5.xlarge", None);
        assert_eq!(
            evaluate(&p, &sample(Some(85.0), Some(50.0))).unwrap(),
            upsize("m5.2xlarge")
        );
        assert_eq!(
            evaluate(&p, &sample(Some(20.0), Some(20.0))).unwrap(),
            downsize("m5.large")
        );
    }

    #[test]
    fn test_both_low_downsizes_to_next_smaller() {
        let decision = evaluate(&profile("m5.2xlarge", None), &sample(Some(10.0), Some(10.0)));
        assert_eq!(decision.unwrap(), downsize("m5.xlarge"));
    }

    #[test]
    fn test_downsize_needs_both_metrics_low() {
        let decision = evaluate(&profile("m5.2xlarge", None), &sample(Some(10.0), Some(50.0)));
        assert_eq!(decision.unwrap(), SizingDecision::NoAction);
    }

    #[test]
    fn test_at_floor_returns_no_action() {
        let decision = evaluate(
            &profile("m5.xlarge", Some("m5.xlarge")),
            &sample(Some(10.0), Some(10.0)),
        );
        assert_eq!(decision.unwrap(), SizingDecision::NoAction);
    }

    #[test]
    fn test_at_top_returns_no_action() {
        let decision = evaluate(&profile("m5.4xlarge", None), &sample(Some(99.0), None));
        assert_eq!(decision.unwrap(), SizingDecision::NoAction);
    }

    #[test]
    fn test_missing_memory_uses_cpu_only() {
        let p = profile("m5.2xlarge", None);
        assert_eq!(
            evaluate(&p, &sample(Some(10.0), None)).unwrap(),
            downsize("m5.xlarge")
        );
        assert_eq!(
            evaluate(&p, &sample(Some(90.0), None)).unwrap(),
            upsize("m5.4xlarge")
        );
        assert_eq!(
            evaluate(&p, &sample(Some(50.0), None)).unwrap(),
            SizingDecision::NoAction
        );
    }

    #[test]
    fn test_missing_cpu_uses_memory_only() {
        let p = profile("m5.2xlarge", None);
        assert_eq!(
            evaluate(&p, &sample(None, Some(5.0))).unwrap(),
            downsize("m5.xlarge")
        );
    }

    #[test]
    fn test_upsize_wins_over_downsize() {
        // Overlapping thresholds make both conditions true for cpu=50
        let mut p = profile("m5.xlarge", None);
        p.thresholds = Thresholds {
            cpu_upsize: 40.0,
            cpu_downsize: 60.0,
            mem_upsize: 40.0,
            mem_downsize: 60.0,
        };
        let decision = evaluate(&p, &sample(Some(50.0), Some(50.0)));
        assert_eq!(decision.unwrap(), upsize("m5.2xlarge"));
    }

    #[test]
    fn test_no_metrics_is_an_error_not_no_action() {
        let err = evaluate(&profile("m5.large", None), &sample(None, None)).unwrap_err();
        assert!(matches!(err, EvaluationError::MetricUnavailable { .. }));
    }

    #[test]
    fn test_out_of_range_sample_rejected() {
        let err = evaluate(&profile("m5.large", None), &sample(Some(140.0), None)).unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidSample(_)));

        let err = evaluate(&profile("m5.large", None), &sample(Some(f64::NAN), None)).unwrap_err();
        assert!(matches!(err, EvaluationError::InvalidSample(_)));
    }

    #[test]
    fn test_unknown_current_class_rejected() {
        let err = evaluate(&profile("t3.micro", None), &sample(Some(90.0), None)).unwrap_err();
        assert!(matches!(err, EvaluationError::UnknownSizeClass { .. }));
    }
}
