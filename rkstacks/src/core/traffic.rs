//! Traffic reconciliation with prescaling.
//!
//! Weights are percentages in `[0, 100]`. Two maps live on the shared
//! ingress: the *actual* weights currently serving and the *desired*
//! weights the user wants. This module normalizes the desired side,
//! prescales stacks about to gain traffic, and advances the actual
//! side once it is safe to do so.

use chrono::{DateTime, Utc};

use crate::core::types::StackSetContainer;
use crate::core::ReconcileError;

impl StackSetContainer {
    /// Reconcile desired and actual traffic weights.
    ///
    /// Stages, in order:
    ///
    /// 1. Desired weights are renormalized to sum to 100 across stacks
    ///    that are not pending removal and have an ingress. If the sum
    ///    is 0 the most recently created such stack becomes the
    ///    fallback and receives 100; with no candidate at all this
    ///    fails with [`ReconcileError::NoStacksForTraffic`].
    /// 2. A stack whose desired weight rises above its actual weight is
    ///    prescaled: its replica floor is raised to the ready replicas
    ///    currently serving traffic, so it can absorb the shared load
    ///    before any requests arrive.
    /// 3. Actual weights advance to desired all-or-nothing: while any
    ///    gaining stack is still below its prescaling target, nothing
    ///    moves. This keeps the sum of actual weights intact across
    ///    the switch.
    /// 4. `no_traffic_since` is stamped on stacks with neither actual
    ///    nor desired traffic and cleared the moment either returns.
    pub fn manage_traffic(&mut self, now: DateTime<Utc>) -> Result<(), ReconcileError> {
        // Without an ingress nothing serves traffic.
        if self.stackset.spec.ingress.is_none() {
            for sc in &mut self.stack_containers {
                sc.actual_traffic_weight = 0.0;
                sc.desired_traffic_weight = 0.0;
                sc.prescaling_active = false;
            }
            self.update_no_traffic_since(now);
            return Ok(());
        }

        self.normalize_desired_weights()?;
        self.reconcile_prescaling(now);

        // All-or-nothing advancement: hold every weight in place while
        // any stack gaining traffic is not yet able to take it.
        let blocked = self.stack_containers.iter().any(|sc| {
            sc.desired_traffic_weight > sc.actual_traffic_weight
                && sc.prescaling_active
                && sc.ready_replicas < sc.prescaling_replicas
        });
        if !blocked {
            for sc in &mut self.stack_containers {
                sc.actual_traffic_weight = sc.desired_traffic_weight;
            }
        }

        self.update_no_traffic_since(now);
        Ok(())
    }

    /// Renormalize desired weights to sum to 100 across eligible
    /// stacks; ineligible stacks are zeroed first.
    fn normalize_desired_weights(&mut self) -> Result<(), ReconcileError> {
        for sc in &mut self.stack_containers {
            if sc.pending_removal || sc.ingress_spec.is_none() {
                sc.desired_traffic_weight = 0.0;
            }
        }

        let sum: f64 = self
            .stack_containers
            .iter()
            .filter(|sc| !sc.pending_removal && sc.ingress_spec.is_some())
            .map(|sc| sc.desired_traffic_weight)
            .sum();

        if sum > 0.0 {
            for sc in &mut self.stack_containers {
                sc.desired_traffic_weight = sc.desired_traffic_weight * 100.0 / sum;
            }
            return Ok(());
        }

        // Nothing is requested: fall back to the most recently created
        // eligible stack.
        let fallback = self
            .stack_containers
            .iter_mut()
            .filter(|sc| !sc.pending_removal && sc.ingress_spec.is_some())
            .max_by_key(|sc| sc.stack.metadata.creation_timestamp);
        match fallback {
            Some(sc) => {
                sc.desired_traffic_weight = 100.0;
                Ok(())
            }
            None => Err(ReconcileError::NoStacksForTraffic),
        }
    }

    /// Keep the per-stack prescaling state machines in step with the
    /// normalized desired weights.
    fn reconcile_prescaling(&mut self, now: DateTime<Utc>) {
        // The load the gaining stacks will absorb: ready replicas of
        // everything currently serving.
        let serving_ready: i32 = self
            .stack_containers
            .iter()
            .filter(|sc| sc.actual_traffic_weight > 0.0)
            .map(|sc| sc.ready_replicas)
            .sum();

        for sc in &mut self.stack_containers {
            if sc.prescaling_active {
                if sc.desired_traffic_weight <= 0.0 {
                    // Lost its traffic again before the switch finished.
                    sc.prescaling_active = false;
                    sc.prescaling_replicas = 0;
                    continue;
                }
                if sc.desired_traffic_weight > sc.prescaling_desired_traffic_weight {
                    sc.prescaling_desired_traffic_weight = sc.desired_traffic_weight;
                    sc.prescaling_last_traffic_increase = Some(now);
                }
                // Release once the target has been held with the weight
                // stable for the scaledown TTL.
                let stable_for = sc
                    .prescaling_last_traffic_increase
                    .map(|t| now.signed_duration_since(t))
                    .unwrap_or_else(chrono::Duration::zero);
                if sc.ready_replicas >= sc.prescaling_replicas && stable_for >= sc.scaledown_ttl {
                    sc.prescaling_active = false;
                    sc.prescaling_replicas = 0;
                }
            } else if sc.desired_traffic_weight > sc.actual_traffic_weight && serving_ready > 0 {
                sc.prescaling_active = true;
                sc.prescaling_replicas = serving_ready;
                sc.prescaling_desired_traffic_weight = sc.desired_traffic_weight;
                sc.prescaling_last_traffic_increase = Some(now);
            }
        }
    }

    fn update_no_traffic_since(&mut self, now: DateTime<Utc>) {
        for sc in &mut self.stack_containers {
            if sc.has_traffic() {
                sc.no_traffic_since = None;
            } else if sc.no_traffic_since.is_none() {
                sc.no_traffic_since = Some(now);
            }
        }
    }
}
