// ── Booking flow ──
//
// Multi-step state machine for creating a group of reservations:
// SelectingVehicles → DetailsEntry → Submitting → Committed | Failed.
// Each transition validates the step's inputs and stays put on failure,
// carrying diagnostics; a commit-time conflict drops the flow back to
// vehicle selection with the conflicting reservations attached.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use fleetdeck_api::{CommitRequest, Persistence, VehicleStatusUpdate};

use crate::availability::{AvailabilityEngine, ConflictInfo};
use crate::config::{FeeTable, RateTable, TransportFlags};
use crate::error::CoreError;
use crate::model::{
    EntityId, PaymentStatus, Reservation, ReservationStatus, RiderRecord, UnitType, VehicleClass,
    VehicleStatus,
};
use crate::pricing;

/// Where the flow currently stands.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BookingState {
    SelectingVehicles,
    DetailsEntry,
    Submitting,
    Committed { reservation_ids: Vec<String> },
    Failed { message: String },
}

/// What the customer asked for, fixed for the duration of one attempt.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub customer_ref: String,
    pub vehicle_class: VehicleClass,
    pub quantity: u32,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub unit_type: UnitType,
    pub vip: bool,
    pub transport: TransportFlags,
    pub deposit_amount: f64,
}

/// Per-vehicle rider details collected in the details step.
#[derive(Debug, Clone)]
pub struct VehicleDetails {
    pub vehicle_id: EntityId,
    pub lead_rider: RiderRecord,
    pub passenger: Option<RiderRecord>,
}

/// One booking attempt. Terminal states stick; start a fresh flow for a
/// new attempt.
pub struct BookingFlow {
    request: BookingRequest,
    availability: Arc<AvailabilityEngine>,
    persistence: Arc<dyn Persistence>,
    rates: RateTable,
    fees: FeeTable,
    state: BookingState,
    selected: Vec<EntityId>,
    details: Vec<VehicleDetails>,
    last_conflicts: Vec<ConflictInfo>,
}

impl BookingFlow {
    pub fn new(
        request: BookingRequest,
        availability: Arc<AvailabilityEngine>,
        persistence: Arc<dyn Persistence>,
        rates: RateTable,
        fees: FeeTable,
    ) -> Self {
        Self {
            request,
            availability,
            persistence,
            rates,
            fees,
            state: BookingState::SelectingVehicles,
            selected: Vec::new(),
            details: Vec::new(),
            last_conflicts: Vec::new(),
        }
    }

    pub fn state(&self) -> &BookingState {
        &self.state
    }

    /// Conflicts from the most recent rejected selection or commit.
    pub fn conflicts(&self) -> &[ConflictInfo] {
        &self.last_conflicts
    }

    /// Pick the vehicles for this booking. Requires exactly
    /// `request.quantity` distinct ids, all free for the window.
    /// On failure the flow stays in `SelectingVehicles`.
    pub fn select_vehicles(&mut self, vehicle_ids: Vec<EntityId>) -> Result<(), CoreError> {
        if self.state != BookingState::SelectingVehicles {
            return Err(CoreError::validation(format!(
                "cannot select vehicles in state '{}'",
                self.state
            )));
        }

        if self.request.quantity == 0 {
            return Err(CoreError::validation("booking quantity must be at least 1"));
        }
        let wanted = self.request.quantity as usize;
        let distinct: HashSet<&EntityId> = vehicle_ids.iter().collect();
        if vehicle_ids.len() != wanted || distinct.len() != wanted {
            return Err(CoreError::validation(format!(
                "expected {wanted} distinct vehicle(s), got {}",
                vehicle_ids.len()
            )));
        }

        let availability = self.availability.check_range(
            self.request.vehicle_class,
            self.request.start_at,
            self.request.end_at,
            None,
        )?;

        let free: HashSet<&EntityId> = availability.available.iter().map(|v| &v.id).collect();
        let unavailable: Vec<&EntityId> =
            vehicle_ids.iter().filter(|id| !free.contains(id)).collect();
        if !unavailable.is_empty() {
            self.last_conflicts = availability
                .conflicts
                .into_iter()
                .filter(|c| unavailable.contains(&&c.vehicle_id))
                .collect();
            return Err(CoreError::Conflict {
                conflicts: self.last_conflicts.clone(),
            });
        }

        self.selected = vehicle_ids;
        self.last_conflicts.clear();
        self.state = BookingState::DetailsEntry;
        Ok(())
    }

    /// Record rider details for every selected vehicle. Each needs a
    /// complete lead-rider record; a passenger, when present, needs one
    /// too. On failure the flow stays in `DetailsEntry`.
    pub fn enter_details(&mut self, details: Vec<VehicleDetails>) -> Result<(), CoreError> {
        if self.state != BookingState::DetailsEntry {
            return Err(CoreError::validation(format!(
                "cannot enter details in state '{}'",
                self.state
            )));
        }

        // Details must cover exactly the selected set: a row for a vehicle
        // that was never selected would be priced and committed without an
        // availability check.
        let selected: HashSet<&EntityId> = self.selected.iter().collect();
        for detail in &details {
            if !selected.contains(&detail.vehicle_id) {
                return Err(CoreError::validation(format!(
                    "rider details given for unselected vehicle {}",
                    detail.vehicle_id
                )));
            }
        }
        let covered: HashSet<&EntityId> = details.iter().map(|d| &d.vehicle_id).collect();
        if covered.len() != details.len() {
            return Err(CoreError::validation(
                "duplicate rider details for a vehicle",
            ));
        }
        for id in &self.selected {
            if !covered.contains(id) {
                return Err(CoreError::validation(format!(
                    "missing rider details for vehicle {id}"
                )));
            }
        }
        for detail in &details {
            if !detail.lead_rider.is_complete() {
                return Err(CoreError::validation(format!(
                    "lead rider for vehicle {} needs a name and contact",
                    detail.vehicle_id
                )));
            }
            if let Some(passenger) = &detail.passenger {
                if !passenger.is_complete() {
                    return Err(CoreError::validation(format!(
                        "passenger for vehicle {} needs a name and contact",
                        detail.vehicle_id
                    )));
                }
            }
        }

        self.details = details;
        self.state = BookingState::Submitting;
        Ok(())
    }

    /// Price and commit the whole group as one atomic unit.
    ///
    /// A conflict reported by persistence sends the flow back to
    /// `SelectingVehicles` with diagnostics refreshed from live
    /// availability; a validation rejection sends it back to
    /// `DetailsEntry`; any other persistence failure is terminal.
    pub async fn submit(&mut self) -> Result<Vec<String>, CoreError> {
        if self.state != BookingState::Submitting {
            return Err(CoreError::validation(format!(
                "cannot submit in state '{}'",
                self.state
            )));
        }

        let commit = self.build_commit()?;
        match self.persistence.commit_reservations(commit).await {
            Ok(outcome) => {
                info!(
                    customer = %self.request.customer_ref,
                    count = outcome.reservation_ids.len(),
                    "booking committed"
                );
                self.state = BookingState::Committed {
                    reservation_ids: outcome.reservation_ids.clone(),
                };
                Ok(outcome.reservation_ids)
            }
            Err(err) => {
                let core_err: CoreError = err.into();
                match core_err {
                    CoreError::Conflict { .. } => {
                        // Someone else won the race; re-derive diagnostics
                        // from the live view so the caller can re-select.
                        let conflicts = self.live_conflicts();
                        warn!(
                            customer = %self.request.customer_ref,
                            conflicts = conflicts.len(),
                            "commit rejected with a conflict, back to selection"
                        );
                        self.last_conflicts.clone_from(&conflicts);
                        self.selected.clear();
                        self.details.clear();
                        self.state = BookingState::SelectingVehicles;
                        Err(CoreError::Conflict { conflicts })
                    }
                    CoreError::Validation { .. } => {
                        self.state = BookingState::DetailsEntry;
                        Err(core_err)
                    }
                    other => {
                        warn!(customer = %self.request.customer_ref, error = %other, "booking failed");
                        self.state = BookingState::Failed {
                            message: other.to_string(),
                        };
                        Err(other)
                    }
                }
            }
        }
    }

    fn build_commit(&self) -> Result<CommitRequest, CoreError> {
        let rate = self
            .rates
            .rate(
                self.request.vehicle_class,
                self.request.unit_type,
                self.request.vip,
            )
            .ok_or_else(|| {
                CoreError::validation(format!(
                    "no rate configured for {} / {}",
                    self.request.vehicle_class, self.request.unit_type
                ))
            })?;

        let mut reservations = Vec::with_capacity(self.details.len());
        let mut vehicle_updates = Vec::with_capacity(self.details.len());
        // The deposit covers the group; each row carries its share.
        let share = self.request.deposit_amount / self.details.len() as f64;

        for detail in &self.details {
            let extra_passengers = u32::from(detail.passenger.is_some());
            let breakdown = pricing::compute_price(
                self.request.unit_type,
                self.request.start_at,
                self.request.end_at,
                rate,
                self.request.transport,
                extra_passengers,
                &self.fees,
            )?;

            let mut reservation = Reservation {
                id: EntityId::generate(),
                vehicle_id: detail.vehicle_id.clone(),
                start_at: self.request.start_at,
                end_at: self.request.end_at,
                status: ReservationStatus::Scheduled,
                customer_ref: self.request.customer_ref.clone(),
                unit_type: self.request.unit_type,
                quantity: breakdown.quantity,
                unit_price: rate,
                fees: breakdown.fees,
                total_amount: breakdown.total,
                deposit_amount: share,
                payment_status: PaymentStatus::Unpaid,
                lead_rider: Some(detail.lead_rider.clone()),
                passenger: detail.passenger.clone(),
            };
            reservation.payment_status =
                pricing::derive_payment_status(share, breakdown.total, reservation.status);

            reservations.push(serde_json::to_value(&reservation).map_err(|e| {
                CoreError::Internal(format!("failed to encode reservation: {e}"))
            })?);
            vehicle_updates.push(VehicleStatusUpdate {
                vehicle_id: detail.vehicle_id.to_string(),
                status: VehicleStatus::Reserved.to_string(),
            });
        }

        Ok(CommitRequest {
            reservations,
            vehicle_updates,
        })
    }

    fn live_conflicts(&self) -> Vec<ConflictInfo> {
        let selected: HashSet<&EntityId> = self.selected.iter().collect();
        self.availability
            .check_range(
                self.request.vehicle_class,
                self.request.start_at,
                self.request.end_at,
                None,
            )
            .map(|a| {
                a.conflicts
                    .into_iter()
                    .filter(|c| selected.contains(&c.vehicle_id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Vehicle, VehicleClass};
    use crate::store::LiveStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use fleetdeck_api::{CommitOutcome, Error as ApiError};
    use serde_json::Value;
    use std::sync::Mutex;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, 0, 0).unwrap()
    }

    fn vehicle(id: &str, name: &str) -> Vehicle {
        Vehicle {
            id: EntityId::from(id),
            name: name.into(),
            class: VehicleClass::Standard,
            status: VehicleStatus::Available,
            location: None,
        }
    }

    fn blocking_reservation(id: &str, vehicle_id: &str) -> Reservation {
        Reservation {
            id: EntityId::from(id),
            vehicle_id: EntityId::from(vehicle_id),
            start_at: at(9),
            end_at: at(11),
            status: ReservationStatus::Confirmed,
            customer_ref: "other".into(),
            unit_type: UnitType::Hourly,
            quantity: 2,
            unit_price: 20.0,
            fees: 0.0,
            total_amount: 40.0,
            deposit_amount: 0.0,
            payment_status: PaymentStatus::Unpaid,
            lead_rider: None,
            passenger: None,
        }
    }

    enum CommitScript {
        Accept,
        Reject(ApiError),
    }

    struct MockStore {
        script: Mutex<CommitScript>,
        commits: Mutex<Vec<CommitRequest>>,
    }

    impl MockStore {
        fn accepting() -> Self {
            Self {
                script: Mutex::new(CommitScript::Accept),
                commits: Mutex::new(Vec::new()),
            }
        }

        fn rejecting(err: ApiError) -> Self {
            Self {
                script: Mutex::new(CommitScript::Reject(err)),
                commits: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Persistence for MockStore {
        async fn select(&self, _: &str, _: Option<&str>) -> Result<Vec<Value>, ApiError> {
            Ok(Vec::new())
        }

        async fn upsert(&self, _: &str, row: Value) -> Result<Value, ApiError> {
            Ok(row)
        }

        async fn delete(&self, _: &str, _: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn commit_reservations(
            &self,
            commit: CommitRequest,
        ) -> Result<CommitOutcome, ApiError> {
            let ids = (0..commit.reservations.len())
                .map(|i| format!("committed-{i}"))
                .collect();
            self.commits.lock().unwrap().push(commit);
            match &*self.script.lock().unwrap() {
                CommitScript::Accept => Ok(CommitOutcome {
                    reservation_ids: ids,
                }),
                CommitScript::Reject(err) => Err(match err {
                    ApiError::Service { message, status } => ApiError::Service {
                        message: message.clone(),
                        status: *status,
                    },
                    other => ApiError::Deserialization {
                        message: other.to_string(),
                    },
                }),
            }
        }

        async fn probe(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn flow_with(
        store_rows: (Vec<Vehicle>, Vec<Reservation>),
        persistence: Arc<MockStore>,
        quantity: u32,
    ) -> BookingFlow {
        let store = Arc::new(LiveStore::new());
        store.apply_snapshot(store_rows.0, store_rows.1);
        let availability = Arc::new(AvailabilityEngine::new(store));
        let rates = RateTable::default().with_standard(
            VehicleClass::Standard,
            UnitType::Hourly,
            20.0,
        );

        BookingFlow::new(
            BookingRequest {
                customer_ref: "cust-1".into(),
                vehicle_class: VehicleClass::Standard,
                quantity,
                start_at: at(10),
                end_at: at(12),
                unit_type: UnitType::Hourly,
                vip: false,
                transport: TransportFlags::default(),
                deposit_amount: 0.0,
            },
            availability,
            persistence,
            rates,
            FeeTable::default(),
        )
    }

    fn details_for(ids: &[&str]) -> Vec<VehicleDetails> {
        ids.iter()
            .map(|id| VehicleDetails {
                vehicle_id: EntityId::from(*id),
                lead_rider: RiderRecord::new("Dana", "dana@example.com"),
                passenger: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn happy_path_commits_the_group() {
        let persistence = Arc::new(MockStore::accepting());
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha"), vehicle("veh-2", "Bravo")], vec![]),
            Arc::clone(&persistence),
            2,
        );

        flow.select_vehicles(vec![EntityId::from("veh-1"), EntityId::from("veh-2")])
            .unwrap();
        assert_eq!(*flow.state(), BookingState::DetailsEntry);

        flow.enter_details(details_for(&["veh-1", "veh-2"])).unwrap();
        assert_eq!(*flow.state(), BookingState::Submitting);

        let ids = flow.submit().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(matches!(flow.state(), BookingState::Committed { .. }));

        // One atomic commit carrying both reservations and both vehicle
        // status updates.
        let commits = persistence.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].reservations.len(), 2);
        assert_eq!(commits[0].vehicle_updates.len(), 2);
        assert_eq!(commits[0].vehicle_updates[0].status, "reserved");
    }

    #[tokio::test]
    async fn wrong_selection_count_is_rejected() {
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            Arc::new(MockStore::accepting()),
            2,
        );

        let err = flow
            .select_vehicles(vec![EntityId::from("veh-1")])
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(*flow.state(), BookingState::SelectingVehicles);
    }

    #[tokio::test]
    async fn selecting_a_blocked_vehicle_reports_conflicts() {
        let mut flow = flow_with(
            (
                vec![vehicle("veh-1", "Alpha")],
                vec![blocking_reservation("res-other", "veh-1")],
            ),
            Arc::new(MockStore::accepting()),
            1,
        );

        let err = flow
            .select_vehicles(vec![EntityId::from("veh-1")])
            .unwrap_err();
        match err {
            CoreError::Conflict { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].next_free, Some(at(11)));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(*flow.state(), BookingState::SelectingVehicles);
    }

    #[tokio::test]
    async fn incomplete_rider_record_stays_in_details_entry() {
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            Arc::new(MockStore::accepting()),
            1,
        );
        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();

        let err = flow
            .enter_details(vec![VehicleDetails {
                vehicle_id: EntityId::from("veh-1"),
                lead_rider: RiderRecord::new("Dana", ""),
                passenger: None,
            }])
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(*flow.state(), BookingState::DetailsEntry);
    }

    #[tokio::test]
    async fn details_for_unselected_vehicle_are_rejected() {
        let persistence = Arc::new(MockStore::accepting());
        let mut flow = flow_with(
            (
                vec![vehicle("veh-1", "Alpha"), vehicle("veh-99", "Zulu")],
                vec![],
            ),
            Arc::clone(&persistence),
            1,
        );
        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();

        // veh-99 was never selected (and never availability-gated).
        let err = flow
            .enter_details(details_for(&["veh-1", "veh-99"]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(*flow.state(), BookingState::DetailsEntry);

        // With the correct details exactly one reservation is committed.
        flow.enter_details(details_for(&["veh-1"])).unwrap();
        let ids = flow.submit().await.unwrap();
        assert_eq!(ids.len(), 1);
        let commits = persistence.commits.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].reservations.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_details_rows_are_rejected() {
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            Arc::new(MockStore::accepting()),
            1,
        );
        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();

        let err = flow
            .enter_details(details_for(&["veh-1", "veh-1"]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(*flow.state(), BookingState::DetailsEntry);
    }

    #[tokio::test]
    async fn incomplete_passenger_record_is_rejected() {
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            Arc::new(MockStore::accepting()),
            1,
        );
        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();

        let err = flow
            .enter_details(vec![VehicleDetails {
                vehicle_id: EntityId::from("veh-1"),
                lead_rider: RiderRecord::new("Dana", "dana@example.com"),
                passenger: Some(RiderRecord::new("", "")),
            }])
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn commit_conflict_returns_to_selection() {
        let persistence = Arc::new(MockStore::rejecting(ApiError::Service {
            message: "window overlap".into(),
            status: 409,
        }));
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            persistence,
            1,
        );

        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();
        flow.enter_details(details_for(&["veh-1"])).unwrap();

        let err = flow.submit().await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
        assert_eq!(*flow.state(), BookingState::SelectingVehicles);
    }

    #[tokio::test]
    async fn commit_validation_error_returns_to_details() {
        let persistence = Arc::new(MockStore::rejecting(ApiError::Service {
            message: "rider name required".into(),
            status: 422,
        }));
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            persistence,
            1,
        );

        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();
        flow.enter_details(details_for(&["veh-1"])).unwrap();

        let err = flow.submit().await.unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        assert_eq!(*flow.state(), BookingState::DetailsEntry);
    }

    #[tokio::test]
    async fn other_persistence_failure_is_terminal() {
        let persistence = Arc::new(MockStore::rejecting(ApiError::Service {
            message: "internal".into(),
            status: 500,
        }));
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            persistence,
            1,
        );

        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();
        flow.enter_details(details_for(&["veh-1"])).unwrap();

        assert!(flow.submit().await.is_err());
        assert!(matches!(flow.state(), BookingState::Failed { .. }));

        // Terminal: no step accepts input any more.
        assert!(flow
            .select_vehicles(vec![EntityId::from("veh-1")])
            .is_err());
    }

    #[tokio::test]
    async fn committed_rows_carry_pricing_and_riders() {
        let persistence = Arc::new(MockStore::accepting());
        let mut flow = flow_with(
            (vec![vehicle("veh-1", "Alpha")], vec![]),
            Arc::clone(&persistence),
            1,
        );

        flow.select_vehicles(vec![EntityId::from("veh-1")]).unwrap();
        flow.enter_details(details_for(&["veh-1"])).unwrap();
        flow.submit().await.unwrap();

        let commits = persistence.commits.lock().unwrap();
        let row: Reservation =
            serde_json::from_value(commits[0].reservations[0].clone()).unwrap();
        assert_eq!(row.quantity, 2);
        assert_eq!(row.unit_price, 20.0);
        assert_eq!(row.total_amount, 40.0);
        assert_eq!(row.payment_status, PaymentStatus::Unpaid);
        assert_eq!(row.lead_rider.unwrap().name, "Dana");
    }
}
