//! Tests for step ordinals and action numbers.

use hostprep_shared::{HostprepError, Step};

#[test]
fn test_action_number_round_trips_for_every_pending_step() {
    for step in Step::ALL {
        match step.action_number() {
            Some(action) => assert_eq!(Step::from_action_number(action), Some(step)),
            None => assert!(step.is_complete()),
        }
    }
}

#[test]
fn test_from_ordinal_out_of_range() {
    assert_eq!(Step::from_ordinal(3), Some(Step::Complete));
    assert_eq!(Step::from_ordinal(4), None);
}

#[test]
fn test_step_serializes_snake_case() {
    let json = serde_json::to_string(&Step::NeedSubsystem).unwrap();
    assert_eq!(json, "\"need_subsystem\"");
}

#[test]
fn test_invalid_step_error() {
    let err = HostprepError::InvalidStep(7);
    assert!(err.to_string().contains('7'));
    assert_eq!(err.code(), -32602);
}
