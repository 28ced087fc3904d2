//! Store change events → controller queue keys.

use fleet_state::{ObjectKey, ObjectKind, StoreEvent};

/// Where a change has to be reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Re-run the scheduling cycle of one placement.
    Placement(ObjectKey),
    /// A fleet membership change can move any placement.
    AllPlacements,
    UpdateRun(ObjectKey),
}

pub fn route_event(event: &StoreEvent) -> Option<Route> {
    match event.kind {
        ObjectKind::Placement => Some(Route::Placement(event.key.clone())),
        ObjectKind::PolicySnapshot | ObjectKind::Binding => {
            event.placement.clone().map(Route::Placement)
        }
        ObjectKind::MemberCluster => Some(Route::AllPlacements),
        ObjectKind::UpdateRun => Some(Route::UpdateRun(event.key.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ObjectKind, key: ObjectKey, placement: Option<ObjectKey>) -> StoreEvent {
        StoreEvent {
            kind,
            key,
            placement,
            deleted: false,
        }
    }

    #[test]
    fn owned_objects_route_to_their_placement() {
        let crp = ObjectKey::cluster_scoped("crp");
        let snap = event(
            ObjectKind::PolicySnapshot,
            ObjectKey::cluster_scoped("crp-0"),
            Some(crp.clone()),
        );
        assert_eq!(route_event(&snap), Some(Route::Placement(crp.clone())));

        let binding = event(ObjectKind::Binding, ObjectKey::cluster_scoped("crp-c1"), Some(crp.clone()));
        assert_eq!(route_event(&binding), Some(Route::Placement(crp)));

        let orphan = event(ObjectKind::Binding, ObjectKey::cluster_scoped("x"), None);
        assert_eq!(route_event(&orphan), None);
    }

    #[test]
    fn cluster_changes_fan_out() {
        let e = event(ObjectKind::MemberCluster, ObjectKey::cluster_scoped("c1"), None);
        assert_eq!(route_event(&e), Some(Route::AllPlacements));

        let run = ObjectKey::namespaced("team-a", "run-1");
        let e = event(ObjectKind::UpdateRun, run.clone(), None);
        assert_eq!(route_event(&e), Some(Route::UpdateRun(run)));
    }
}
