//! Node pool selection and pod allocation.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::errors::SchedulingError;
use crate::model::{PodHandle, Resources, SessionId};

#[derive(Clone, Debug)]
pub struct NodePool {
    pub name: String,
    pub has_gpu: bool,
    pub gpu_class: Option<String>,
    pub spot_eligible: bool,
    pub capacity: u32,
    pub load: u32,
}

impl NodePool {
    fn fits(&self, resources: &Resources) -> bool {
        if resources.wants_gpu() {
            self.has_gpu && resources.gpu_class.as_deref() == self.gpu_class.as_deref()
        } else {
            !self.has_gpu
        }
    }
}

/// Picks the least-loaded matching pool, tie-breaking by spot-eligibility
/// when the policy allows spot instances.
pub fn select_pool<'a>(pools: &'a [NodePool], resources: &Resources, spot_eligible: bool) -> Option<&'a NodePool> {
    pools
        .iter()
        .filter(|p| p.fits(resources) && p.load < p.capacity)
        .min_by(|a, b| {
            a.load
                .cmp(&b.load)
                .then_with(|| {
                    if spot_eligible {
                        b.spot_eligible.cmp(&a.spot_eligible)
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
        })
}

/// Allocates a pod handle against `pool`, retrying on failure with capped
/// exponential backoff and ±20% jitter.
pub async fn allocate_with_backoff(
    config: &OrchestratorConfig,
    session_id: SessionId,
    generation: u64,
    pool: &NodePool,
    address: impl Fn() -> String,
) -> Result<PodHandle, SchedulingError> {
    let mut delay = config.allocator_backoff_base;
    for attempt in 1..=config.allocator_max_attempts {
        match try_allocate(session_id, generation, pool, &address) {
            Ok(pod) => return Ok(pod),
            Err(err) if attempt == config.allocator_max_attempts => return Err(err),
            Err(err) => {
                warn!(%session_id, attempt, %err, "pod allocation failed, retrying");
                let jitter = 1.0 + rand::thread_rng().gen_range(-0.2..=0.2);
                tokio::time::sleep(Duration::from_secs_f64(delay.as_secs_f64() * jitter)).await;
                delay = (delay.mul_f64(config.allocator_backoff_factor)).min(config.allocator_backoff_cap);
            }
        }
    }
    unreachable!("loop always returns by the final attempt")
}

/// Deterministic stand-in for the real cluster allocator: pools whose
/// name starts with `flaky:` fail once before succeeding, exercising the
/// retry path without any actual infrastructure dependency.
fn try_allocate(
    session_id: SessionId,
    generation: u64,
    pool: &NodePool,
    address: &impl Fn() -> String,
) -> Result<PodHandle, SchedulingError> {
    if pool.name.starts_with("flaky:") && generation == 0 {
        return Err(SchedulingError::AllocatorUnavailable);
    }
    Ok(PodHandle::new(session_id, generation, pool.name.clone(), address()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_pool(name: &str, load: u32) -> NodePool {
        NodePool { name: name.into(), has_gpu: false, gpu_class: None, spot_eligible: false, capacity: 10, load }
    }

    #[test]
    fn least_loaded_pool_wins() {
        let pools = vec![cpu_pool("a", 5), cpu_pool("b", 1)];
        let resources = Resources { cpu_cores: 1.0, memory_bytes: 1, gpu_count: 0, gpu_class: None };
        let picked = select_pool(&pools, &resources, false).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn gpu_request_only_matches_gpu_pools_of_the_right_class() {
        let pools = vec![
            cpu_pool("cpu-a", 0),
            NodePool { name: "gpu-a10g".into(), has_gpu: true, gpu_class: Some("a10g".into()), spot_eligible: false, capacity: 4, load: 0 },
        ];
        let resources = Resources { cpu_cores: 2.0, memory_bytes: 1, gpu_count: 1, gpu_class: Some("a10g".into()) };
        let picked = select_pool(&pools, &resources, false).unwrap();
        assert_eq!(picked.name, "gpu-a10g");
    }

    #[tokio::test]
    async fn allocation_retries_past_a_single_transient_failure() {
        let config = OrchestratorConfig {
            allocator_backoff_base: Duration::from_millis(5),
            allocator_backoff_cap: Duration::from_millis(20),
            allocator_max_attempts: 3,
            ..OrchestratorConfig::default()
        };
        let pool = NodePool { name: "flaky:cpu".into(), has_gpu: false, gpu_class: None, spot_eligible: false, capacity: 1, load: 0 };
        let pod = allocate_with_backoff(&config, SessionId::new(), 0, &pool, || "10.0.0.9:9000".into()).await.unwrap();
        assert_eq!(pod.node_pool, "flaky:cpu");
    }
}
