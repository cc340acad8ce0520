//! Step progression: where an enrollment goes after a successful step.

use chrono::{DateTime, Utc};
use leadflow_core::types::{Enrollment, EnrollmentStatus, PathTarget, Step};

/// Result of resolving the next step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Continue at this step index (already bounds-checked).
    Step(usize),
    /// The campaign is over for this lead.
    Complete,
}

/// Resolve the step after `current_index`.
///
/// A chosen decision path wins when it exists on the step: a terminal label,
/// a null target or an explicit end completes the enrollment, otherwise the
/// path's target is used. A chosen id the step does not know is unresolved
/// and falls back to linear order, as does no choice at all.
pub fn next_step(
    step: &Step,
    current_index: usize,
    chosen_path: Option<&str>,
    terminal_label: &str,
    step_count: usize,
) -> Advance {
    let candidate = match chosen_path {
        Some(path_id) => match step.config.paths.iter().find(|p| p.id == path_id) {
            Some(path) if path.label.trim().eq_ignore_ascii_case(terminal_label.trim()) => {
                return Advance::Complete;
            }
            Some(path) => match path.target {
                None | Some(PathTarget::End) => return Advance::Complete,
                Some(PathTarget::Step(index)) => index,
            },
            None => {
                tracing::debug!(
                    "Decision path '{path_id}' not on step {}, advancing linearly",
                    step.id
                );
                current_index + 1
            }
        },
        None => current_index + 1,
    };

    if candidate < step_count {
        Advance::Step(candidate)
    } else {
        Advance::Complete
    }
}

/// Record a successful step on the enrollment.
pub fn apply_success(enrollment: &mut Enrollment, step: &Step, advance: &Advance, now: DateTime<Utc>) {
    match advance {
        Advance::Step(index) => {
            enrollment.current_step_index = *index;
            enrollment.status = EnrollmentStatus::InProgress;
            enrollment.next_due_at = Some(step.config.wait.after(now));
        }
        Advance::Complete => {
            enrollment.status = EnrollmentStatus::Completed;
            enrollment.next_due_at = None;
        }
    }
    enrollment.decision_path_id = None;
    enrollment.last_error = None;
    enrollment.updated_at = now;
}

/// Record a failed step. Index and due time are left untouched.
pub fn apply_failure(enrollment: &mut Enrollment, error: &str, now: DateTime<Utc>) {
    enrollment.status = EnrollmentStatus::Failed;
    enrollment.last_error = Some(error.to_string());
    enrollment.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use leadflow_core::types::{DecisionPath, StepConfig, StepType, WaitTime, WaitUnit};

    fn step_with_paths() -> Step {
        let path = |id: &str, label: &str, target| DecisionPath {
            id: id.into(),
            label: label.into(),
            target,
        };
        Step {
            id: "s0".into(),
            campaign_id: "c1".into(),
            step_type: StepType::Email,
            order_index: 0,
            config: StepConfig {
                wait: WaitTime::new(3, WaitUnit::Hours),
                paths: vec![
                    path("replied", "Replied", Some(PathTarget::Step(3))),
                    path("stop", "End Sequence", Some(PathTarget::Step(1))),
                    path("null", "No Reply", None),
                    path("end", "Bounced", Some(PathTarget::End)),
                    path("far", "Far", Some(PathTarget::Step(99))),
                ],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_linear_advance() {
        let step = step_with_paths();
        assert_eq!(next_step(&step, 0, None, "End Sequence", 4), Advance::Step(1));
        assert_eq!(next_step(&step, 3, None, "End Sequence", 4), Advance::Complete);
    }

    #[test]
    fn test_path_target_is_followed() {
        let step = step_with_paths();
        assert_eq!(
            next_step(&step, 0, Some("replied"), "End Sequence", 4),
            Advance::Step(3)
        );
    }

    #[test]
    fn test_terminal_paths_complete() {
        let step = step_with_paths();
        for id in ["stop", "null", "end", "far"] {
            assert_eq!(
                next_step(&step, 0, Some(id), "End Sequence", 4),
                Advance::Complete,
                "path {id}"
            );
        }
    }

    #[test]
    fn test_terminal_label_is_configurable() {
        let step = step_with_paths();
        assert_eq!(
            next_step(&step, 0, Some("stop"), "Stop Now", 4),
            Advance::Step(1)
        );
        assert_eq!(
            next_step(&step, 0, Some("replied"), "replied", 4),
            Advance::Complete
        );
    }

    #[test]
    fn test_unknown_path_falls_back_to_linear() {
        let step = step_with_paths();
        assert_eq!(
            next_step(&step, 0, Some("gone"), "End Sequence", 4),
            Advance::Step(1)
        );
    }

    #[test]
    fn test_apply_success_and_failure() {
        let now = Utc::now();
        let step = step_with_paths();
        let mut e = Enrollment::new("l1", "c1", now);
        e.decision_path_id = Some("replied".into());
        e.last_error = Some("old".into());

        apply_success(&mut e, &step, &Advance::Step(3), now);
        assert_eq!(e.current_step_index, 3);
        assert_eq!(e.status, EnrollmentStatus::InProgress);
        assert_eq!(e.next_due_at, Some(now + Duration::hours(3)));
        assert_eq!(e.decision_path_id, None);
        assert_eq!(e.last_error, None);

        let due = e.next_due_at;
        apply_failure(&mut e, "smtp down", now);
        assert_eq!(e.status, EnrollmentStatus::Failed);
        assert_eq!(e.current_step_index, 3);
        assert_eq!(e.next_due_at, due);

        apply_success(&mut e, &step, &Advance::Complete, now);
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(e.next_due_at, None);
    }
}
