// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action planning.
//!
//! Pure functions from (observed, desired) to an ordered list of verbs.
//!
//! ```text
//!  observed \ desired | Running        | Stopped | Absent
//! --------------------+----------------+---------+---------------
//!  Absent             | create, start  | -       | -
//!  Created            | start          | -       | remove
//!  Running            | -              | stop    | stop, remove
//!  Stopped            | start          | -       | remove
//!  Unknown            | refuse         | refuse  | refuse
//! ```
//!
//! Every plan that ends in `remove` stops first when the container is running.

use crate::runtime::{ActionVerb, ObservedStatus};
use crate::service::DesiredState;

/// What to do for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Already in the desired state.
    NoOp,
    /// Apply these verbs in order.
    Apply(Vec<ActionVerb>),
    /// Do not touch the service.
    Refuse(String),
}

/// Whether `observed` satisfies `desired`.
pub fn is_converged(observed: ObservedStatus, desired: DesiredState) -> bool {
    use ObservedStatus as O;
    match desired {
        DesiredState::Running => observed == O::Running,
        DesiredState::Stopped => matches!(observed, O::Stopped | O::Created | O::Absent),
        DesiredState::Absent => observed == O::Absent,
    }
}

/// First-attempt plan.
pub fn plan(observed: ObservedStatus, desired: DesiredState) -> Plan {
    use ActionVerb::*;
    use ObservedStatus as O;

    match (observed, desired) {
        (O::Unknown, _) => Plan::Refuse("runtime state unknown".to_string()),

        (O::Absent, DesiredState::Running) => Plan::Apply(vec![Create, Start]),
        (O::Created | O::Stopped, DesiredState::Running) => Plan::Apply(vec![Start]),
        (O::Running, DesiredState::Running) => Plan::NoOp,

        (O::Running, DesiredState::Stopped) => Plan::Apply(vec![Stop]),
        (O::Absent | O::Created | O::Stopped, DesiredState::Stopped) => Plan::NoOp,

        (O::Absent, DesiredState::Absent) => Plan::NoOp,
        (O::Created | O::Stopped, DesiredState::Absent) => Plan::Apply(vec![Remove]),
        (O::Running, DesiredState::Absent) => Plan::Apply(vec![Stop, Remove]),
    }
}

/// Plan for the single retry after a first attempt did not converge.
///
/// Running containers are stopped and then killed before anything else. A
/// service that should run but will not is recreated from scratch.
pub fn recovery_plan(observed: ObservedStatus, desired: DesiredState) -> Plan {
    use ActionVerb::*;
    use ObservedStatus as O;

    if observed == O::Unknown {
        return Plan::Refuse("runtime state unknown".to_string());
    }
    if is_converged(observed, desired) {
        return Plan::NoOp;
    }

    let mut verbs = Vec::new();
    if observed == O::Running {
        verbs.extend([Stop, Kill]);
    }
    match desired {
        DesiredState::Running => {
            if observed != O::Absent {
                verbs.push(Remove);
            }
            verbs.extend([Create, Start]);
        }
        DesiredState::Stopped => {}
        DesiredState::Absent => verbs.push(Remove),
    }
    Plan::Apply(verbs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActionVerb::*;

    const OBSERVED: [ObservedStatus; 4] = [
        ObservedStatus::Absent,
        ObservedStatus::Created,
        ObservedStatus::Running,
        ObservedStatus::Stopped,
    ];
    const DESIRED: [DesiredState; 3] = [
        DesiredState::Running,
        DesiredState::Stopped,
        DesiredState::Absent,
    ];

    #[test]
    fn test_transition_table() {
        use DesiredState as D;
        use ObservedStatus as O;

        let expected = [
            (O::Absent, D::Running, Plan::Apply(vec![Create, Start])),
            (O::Absent, D::Stopped, Plan::NoOp),
            (O::Absent, D::Absent, Plan::NoOp),
            (O::Created, D::Running, Plan::Apply(vec![Start])),
            (O::Created, D::Stopped, Plan::NoOp),
            (O::Created, D::Absent, Plan::Apply(vec![Remove])),
            (O::Running, D::Running, Plan::NoOp),
            (O::Running, D::Stopped, Plan::Apply(vec![Stop])),
            (O::Running, D::Absent, Plan::Apply(vec![Stop, Remove])),
            (O::Stopped, D::Running, Plan::Apply(vec![Start])),
            (O::Stopped, D::Stopped, Plan::NoOp),
            (O::Stopped, D::Absent, Plan::Apply(vec![Remove])),
        ];
        for (observed, desired, want) in expected {
            assert_eq!(plan(observed, desired), want, "{observed} -> {desired}");
        }
    }

    #[test]
    fn test_unknown_is_refused() {
        for desired in DESIRED {
            assert!(matches!(
                plan(ObservedStatus::Unknown, desired),
                Plan::Refuse(_)
            ));
            assert!(matches!(
                recovery_plan(ObservedStatus::Unknown, desired),
                Plan::Refuse(_)
            ));
        }
    }

    #[test]
    fn test_noop_exactly_when_converged() {
        for observed in OBSERVED {
            for desired in DESIRED {
                assert_eq!(
                    plan(observed, desired) == Plan::NoOp,
                    is_converged(observed, desired),
                    "{observed} -> {desired}"
                );
            }
        }
    }

    #[test]
    fn test_stop_precedes_remove_everywhere() {
        for observed in OBSERVED {
            for desired in DESIRED {
                for p in [plan(observed, desired), recovery_plan(observed, desired)] {
                    let Plan::Apply(verbs) = p else { continue };
                    if observed == ObservedStatus::Running
                        && let Some(remove) = verbs.iter().position(|v| *v == Remove)
                    {
                        let stop = verbs.iter().position(|v| *v == Stop);
                        assert!(
                            stop.is_some_and(|s| s < remove),
                            "{observed} -> {desired}: {verbs:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_recovery_plans() {
        use DesiredState as D;
        use ObservedStatus as O;

        assert_eq!(
            recovery_plan(O::Stopped, D::Running),
            Plan::Apply(vec![Remove, Create, Start])
        );
        assert_eq!(
            recovery_plan(O::Absent, D::Running),
            Plan::Apply(vec![Create, Start])
        );
        assert_eq!(
            recovery_plan(O::Running, D::Stopped),
            Plan::Apply(vec![Stop, Kill])
        );
        assert_eq!(
            recovery_plan(O::Running, D::Absent),
            Plan::Apply(vec![Stop, Kill, Remove])
        );
        assert_eq!(recovery_plan(O::Created, D::Absent), Plan::Apply(vec![Remove]));
        assert_eq!(recovery_plan(O::Running, D::Running), Plan::NoOp);
    }
}
