//! Adaptive bandwidth allocation across agricultural operation contexts
//! (spec.md §4.7).
//!
//! Policy percentages, preemption ordering, and the congestion
//! reallocation factors are ported from
//! `original_source/afs_fastapi/equipment/adaptive_bandwidth_management.py`'s
//! `BandwidthPolicy`/`BandwidthAllocator`, reusing this crate's
//! `queue::{OperationContext, PriorityClass}` instead of the Python
//! reference's separate `OperationBandwidthContext` enum and raw priority
//! strings, since both systems already distinguish the same four contexts.
use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::warn;

use crate::congestion::{CongestionLevel, CongestionMetrics};
use crate::queue::{OperationContext, PriorityClass};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyLimits {
    pub minimum_guarantee_percentage: f64,
    pub can_be_preempted: bool,
    pub priority_multiplier: f64,
    pub emergency_reserve_percentage: f64,
}

/// Allocation policy per operation context (spec.md §4.7 table).
pub fn policy_for(context: OperationContext) -> PolicyLimits {
    match context {
        OperationContext::FieldWork => PolicyLimits {
            minimum_guarantee_percentage: 60.0,
            can_be_preempted: false,
            priority_multiplier: 1.5,
            emergency_reserve_percentage: 20.0,
        },
        OperationContext::Transport => PolicyLimits {
            minimum_guarantee_percentage: 30.0,
            can_be_preempted: true,
            priority_multiplier: 1.0,
            emergency_reserve_percentage: 5.0,
        },
        OperationContext::Emergency => PolicyLimits {
            minimum_guarantee_percentage: 80.0,
            can_be_preempted: false,
            priority_multiplier: 2.0,
            emergency_reserve_percentage: 50.0,
        },
        OperationContext::Maintenance => PolicyLimits {
            minimum_guarantee_percentage: 30.0,
            can_be_preempted: true,
            priority_multiplier: 1.0,
            emergency_reserve_percentage: 5.0,
        },
        OperationContext::Idle => PolicyLimits {
            minimum_guarantee_percentage: 10.0,
            can_be_preempted: true,
            priority_multiplier: 0.5,
            emergency_reserve_percentage: 0.0,
        },
    }
}

fn guaranteed_minimum(context: OperationContext, requested_kbps: f64, total_kbps: f64) -> f64 {
    let policy_minimum = total_kbps * (policy_for(context).minimum_guarantee_percentage / 100.0);
    requested_kbps.min(policy_minimum)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub operation_id: String,
    pub operation_context: OperationContext,
    pub requested_kbps: f64,
    pub allocated_kbps: f64,
    pub guaranteed_minimum_kbps: f64,
    pub priority: PriorityClass,
    pub can_be_preempted: bool,
}

pub struct BandwidthAllocator {
    total_kbps: f64,
    active: Mutex<HashMap<String, Allocation>>,
}

impl BandwidthAllocator {
    pub fn new(total_kbps: f64) -> Self {
        Self { total_kbps, active: Mutex::new(HashMap::new()) }
    }

    fn current_allocated(active: &HashMap<String, Allocation>) -> f64 {
        active.values().map(|a| a.allocated_kbps).sum()
    }

    /// Allocate bandwidth for `operation_id`. Field/emergency requests
    /// preempt preemptable allocations (transport/maintenance) when the
    /// network has no spare capacity; everything else is best-effort.
    pub async fn allocate(
        &self,
        operation_id: &str,
        context: OperationContext,
        requested_kbps: f64,
        priority: PriorityClass,
    ) -> Allocation {
        let guaranteed = guaranteed_minimum(context, requested_kbps, self.total_kbps);
        let mut active = self.active.lock().await;

        let available = self.total_kbps - Self::current_allocated(&active);
        let priority_request = context == OperationContext::FieldWork || priority == PriorityClass::Critical;

        let allocated_kbps = if priority_request {
            if available >= requested_kbps {
                requested_kbps
            } else {
                Self::preempt_for_priority(&mut active, requested_kbps, context, available)
            }
        } else {
            requested_kbps.min(available.max(0.0))
        };

        let allocation = Allocation {
            operation_id: operation_id.to_string(),
            operation_context: context,
            requested_kbps,
            allocated_kbps,
            guaranteed_minimum_kbps: guaranteed,
            priority,
            can_be_preempted: policy_for(context).can_be_preempted,
        };
        active.insert(operation_id.to_string(), allocation.clone());
        allocation
    }

    /// Reduce preemptable allocations to free `requested_kbps`, driving
    /// field-operation requests down to half their guaranteed minimum if
    /// a plain reduction to the minimum isn't enough.
    fn preempt_for_priority(
        active: &mut HashMap<String, Allocation>,
        requested_kbps: f64,
        requesting_context: OperationContext,
        available: f64,
    ) -> f64 {
        if available >= requested_kbps {
            return requested_kbps;
        }

        let mut preemptable: Vec<&mut Allocation> =
            active.values_mut().filter(|a| a.can_be_preempted).collect();
        preemptable.sort_by(|a, b| {
            let a_key = (
                a.operation_context != OperationContext::Transport,
                a.priority != PriorityClass::Normal,
            );
            let b_key = (
                b.operation_context != OperationContext::Transport,
                b.priority != PriorityClass::Normal,
            );
            a_key.cmp(&b_key).then(b.allocated_kbps.partial_cmp(&a.allocated_kbps).unwrap())
        });

        let mut freed = available;
        for allocation in preemptable {
            if freed >= requested_kbps {
                break;
            }
            let target = if requesting_context == OperationContext::FieldWork {
                (allocation.guaranteed_minimum_kbps * 0.5).min(allocation.allocated_kbps)
            } else {
                allocation.guaranteed_minimum_kbps
            };
            if allocation.allocated_kbps > target {
                let reduction = allocation.allocated_kbps - target;
                allocation.allocated_kbps = target;
                freed += reduction;
                warn!(
                    operation_id = %allocation.operation_id,
                    reduction,
                    new_allocation = target,
                    "preempted bandwidth allocation for priority operation"
                );
            }
        }
        requested_kbps.min(freed)
    }

    pub async fn get(&self, operation_id: &str) -> Option<Allocation> {
        self.active.lock().await.get(operation_id).cloned()
    }

    /// Scale preemptable allocations down under high/critical congestion,
    /// never below their guaranteed minimum; emergency allocations and
    /// non-preemptable (field) allocations are left untouched. Returns a
    /// no-op empty map outside of `High`/`Critical`.
    pub async fn reallocate_for_congestion(
        &self,
        level: CongestionLevel,
        _metrics: CongestionMetrics,
    ) -> HashMap<String, f64> {
        let mut results = HashMap::new();
        let factor = match level {
            CongestionLevel::High => 0.6,
            CongestionLevel::Critical => 0.4,
            _ => return results,
        };

        let mut active = self.active.lock().await;
        for (operation_id, allocation) in active.iter_mut() {
            if allocation.operation_context == OperationContext::Emergency
                || allocation.priority == PriorityClass::Critical
            {
                results.insert(operation_id.clone(), allocation.allocated_kbps);
            } else if allocation.can_be_preempted {
                let new_allocation =
                    allocation.guaranteed_minimum_kbps.max(allocation.allocated_kbps * factor);
                allocation.allocated_kbps = new_allocation;
                results.insert(operation_id.clone(), new_allocation);
            } else {
                results.insert(operation_id.clone(), allocation.allocated_kbps);
            }
        }
        if !results.is_empty() {
            warn!(?level, affected = results.len(), "reallocated bandwidth due to congestion");
        }
        results
    }

    pub async fn utilization_percentage(&self) -> f64 {
        let active = self.active.lock().await;
        if self.total_kbps <= 0.0 {
            return 0.0;
        }
        Self::current_allocated(&active) / self.total_kbps * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn field_operation_gets_full_request_when_capacity_available() {
        let allocator = BandwidthAllocator::new(1000.0);
        let allocation = allocator.allocate("tractor-1", OperationContext::FieldWork, 400.0, PriorityClass::High).await;
        assert_eq!(allocation.allocated_kbps, 400.0);
    }

    #[tokio::test]
    async fn transport_operation_is_best_effort_and_capped_by_availability() {
        let allocator = BandwidthAllocator::new(100.0);
        allocator.allocate("field-1", OperationContext::FieldWork, 70.0, PriorityClass::High).await;
        let transport =
            allocator.allocate("transport-1", OperationContext::Transport, 50.0, PriorityClass::Normal).await;
        assert_eq!(transport.allocated_kbps, 30.0);
    }

    #[tokio::test]
    async fn field_operation_preempts_transport_when_saturated() {
        let allocator = BandwidthAllocator::new(100.0);
        allocator.allocate("transport-1", OperationContext::Transport, 100.0, PriorityClass::Normal).await;

        let field = allocator.allocate("field-1", OperationContext::FieldWork, 50.0, PriorityClass::High).await;
        assert!(field.allocated_kbps > 0.0);

        let transport_after = allocator.get("transport-1").await.unwrap();
        assert!(transport_after.allocated_kbps < 100.0);
    }

    #[tokio::test]
    async fn emergency_allocations_survive_congestion_reallocation() {
        let allocator = BandwidthAllocator::new(100.0);
        allocator.allocate("emergency-1", OperationContext::Emergency, 80.0, PriorityClass::Critical).await;
        allocator.allocate("transport-1", OperationContext::Transport, 20.0, PriorityClass::Normal).await;

        let result = allocator
            .reallocate_for_congestion(CongestionLevel::Critical, CongestionMetrics::default())
            .await;

        assert_eq!(result["emergency-1"], 80.0);
        assert!(result["transport-1"] <= 20.0);
    }

    #[tokio::test]
    async fn field_allocation_is_not_reduced_by_congestion_reallocation() {
        let allocator = BandwidthAllocator::new(100.0);
        let before = allocator.allocate("field-1", OperationContext::FieldWork, 60.0, PriorityClass::High).await;

        let result = allocator
            .reallocate_for_congestion(CongestionLevel::Critical, CongestionMetrics::default())
            .await;

        assert_eq!(result["field-1"], before.allocated_kbps);
    }

    #[tokio::test]
    async fn normal_congestion_leaves_allocations_untouched() {
        let allocator = BandwidthAllocator::new(100.0);
        allocator.allocate("transport-1", OperationContext::Transport, 30.0, PriorityClass::Normal).await;
        let result = allocator.reallocate_for_congestion(CongestionLevel::Normal, CongestionMetrics::default()).await;
        assert!(result.is_empty());
    }
}
