//! Endpoint selection primitives.
//!
//! Selection is pure given the injected [`RandomSource`], which keeps the
//! weighted pick unit-testable with a seeded or scripted generator.

use crate::endpoint::{Endpoint, EndpointType};
use crate::traits::error::{Result, ServiceLinkError};
use crate::traits::random::RandomSource;
use std::sync::Arc;

/// All endpoints that are currently online
pub fn online(endpoints: &[Arc<Endpoint>]) -> Vec<Arc<Endpoint>> {
    endpoints
        .iter()
        .filter(|e| e.is_online())
        .cloned()
        .collect()
}

/// Pick exactly one endpoint for a new client to connect to.
///
/// Online primaries are preferred; with none online, online secondaries are
/// used. With no online endpoint of either type this fails with
/// [`ServiceLinkError::ServiceNotConnected`] (terminal, no retry here).
///
/// Among the candidates the pick is uniform when any endpoint lacks capacity
/// metrics (or only one candidate remains), and otherwise weighted by
/// remaining capacity: `weight = max(round(remaining_fraction * 1000), 1)`.
pub fn pick_for_negotiate(
    endpoints: &[Arc<Endpoint>],
    rng: &mut dyn RandomSource,
) -> Result<Arc<Endpoint>> {
    let candidates: Vec<Arc<Endpoint>> = {
        let primaries: Vec<Arc<Endpoint>> = endpoints
            .iter()
            .filter(|e| e.is_online() && e.endpoint_type() == EndpointType::Primary)
            .cloned()
            .collect();
        if !primaries.is_empty() {
            primaries
        } else {
            endpoints
                .iter()
                .filter(|e| e.is_online() && e.endpoint_type() == EndpointType::Secondary)
                .cloned()
                .collect()
        }
    };

    if candidates.is_empty() {
        return Err(ServiceLinkError::ServiceNotConnected);
    }
    if candidates.len() == 1 {
        return Ok(candidates.into_iter().next().unwrap());
    }

    let metrics: Vec<_> = candidates.iter().map(|e| e.capacity()).collect();
    if metrics.iter().any(|m| m.is_none()) {
        let index = rng.next_below(candidates.len() as u64) as usize;
        return Ok(candidates[index].clone());
    }

    // Cumulative-weight table; the pick is the first bucket whose cumulative
    // weight exceeds the draw, which is well defined at both table edges.
    let weights: Vec<u64> = metrics
        .iter()
        .map(|m| {
            let fraction = m.expect("checked above").remaining_fraction();
            ((fraction * 1000.0).round() as u64).max(1)
        })
        .collect();
    let mut cumulative = Vec::with_capacity(weights.len());
    let mut total = 0u64;
    for weight in &weights {
        total += weight;
        cumulative.push(total);
    }

    let draw = rng.next_below(total);
    let index = cumulative
        .iter()
        .position(|&c| draw < c)
        .expect("draw is below the cumulative total");
    Ok(candidates[index].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointCapacity;
    use crate::traits::credential::StaticCredential;
    use crate::traits::random::SeededRandom;

    /// Random source that replays a fixed script of draws
    struct ScriptedRandom(Vec<u64>);

    impl RandomSource for ScriptedRandom {
        fn next_below(&mut self, upper: u64) -> u64 {
            let value = self.0.remove(0);
            assert!(value < upper, "scripted draw out of range");
            value
        }
    }

    fn endpoint(name: &str, kind: EndpointType, online: bool) -> Arc<Endpoint> {
        let ep = Endpoint::new(
            name,
            format!("https://{}.example.com", name),
            kind,
            Arc::new(StaticCredential::new("key")),
        );
        ep.set_online(online);
        Arc::new(ep)
    }

    fn with_capacity(ep: Arc<Endpoint>, client_count: u32, max_capacity: u32) -> Arc<Endpoint> {
        ep.update_capacity(EndpointCapacity {
            client_count,
            server_count: 0,
            max_capacity,
        });
        ep
    }

    #[test]
    fn prefers_online_primary() {
        let endpoints = vec![
            endpoint("p1", EndpointType::Primary, true),
            endpoint("s1", EndpointType::Secondary, true),
        ];
        let mut rng = SeededRandom::new(1);
        let picked = pick_for_negotiate(&endpoints, &mut rng).unwrap();
        assert_eq!(picked.name(), "p1");
    }

    #[test]
    fn falls_back_to_online_secondary() {
        let endpoints = vec![
            endpoint("p1", EndpointType::Primary, false),
            endpoint("p2", EndpointType::Primary, false),
            endpoint("s1", EndpointType::Secondary, true),
            endpoint("s2", EndpointType::Secondary, true),
        ];
        let mut rng = SeededRandom::new(7);
        for _ in 0..50 {
            let picked = pick_for_negotiate(&endpoints, &mut rng).unwrap();
            assert_eq!(picked.endpoint_type(), EndpointType::Secondary);
            assert!(picked.is_online());
        }
    }

    #[test]
    fn no_online_endpoint_is_not_connected() {
        let endpoints = vec![
            endpoint("p1", EndpointType::Primary, false),
            endpoint("s1", EndpointType::Secondary, false),
        ];
        let mut rng = SeededRandom::new(1);
        let err = pick_for_negotiate(&endpoints, &mut rng).unwrap_err();
        assert!(matches!(err, ServiceLinkError::ServiceNotConnected));
    }

    #[test]
    fn uniform_when_metrics_missing() {
        let endpoints = vec![
            with_capacity(endpoint("p1", EndpointType::Primary, true), 10, 100),
            endpoint("p2", EndpointType::Primary, true), // no metrics
        ];
        // Uniform draw over the two candidates, scripted to pick index 1
        let mut rng = ScriptedRandom(vec![1]);
        let picked = pick_for_negotiate(&endpoints, &mut rng).unwrap();
        assert_eq!(picked.name(), "p2");
    }

    #[test]
    fn weighted_pick_boundary_draws() {
        // remaining fractions 0.9 and 0.1 -> weights 900 and 100, total 1000
        let endpoints = vec![
            with_capacity(endpoint("big", EndpointType::Primary, true), 10, 100),
            with_capacity(endpoint("small", EndpointType::Primary, true), 90, 100),
        ];

        // Smallest draw lands in the first bucket
        let mut rng = ScriptedRandom(vec![0]);
        assert_eq!(pick_for_negotiate(&endpoints, &mut rng).unwrap().name(), "big");

        // Last draw of the first bucket
        let mut rng = ScriptedRandom(vec![899]);
        assert_eq!(pick_for_negotiate(&endpoints, &mut rng).unwrap().name(), "big");

        // First draw of the second bucket
        let mut rng = ScriptedRandom(vec![900]);
        assert_eq!(
            pick_for_negotiate(&endpoints, &mut rng).unwrap().name(),
            "small"
        );

        // Largest possible draw lands in the last bucket
        let mut rng = ScriptedRandom(vec![999]);
        assert_eq!(
            pick_for_negotiate(&endpoints, &mut rng).unwrap().name(),
            "small"
        );
    }

    #[test]
    fn exhausted_endpoint_still_gets_minimum_weight() {
        let endpoints = vec![
            with_capacity(endpoint("free", EndpointType::Primary, true), 0, 100),
            with_capacity(endpoint("full", EndpointType::Primary, true), 100, 100),
        ];
        // weights 1000 and 1; the very last draw must select the full one
        let mut rng = ScriptedRandom(vec![1000]);
        assert_eq!(
            pick_for_negotiate(&endpoints, &mut rng).unwrap().name(),
            "full"
        );
    }

    #[test]
    fn weighted_distribution_is_roughly_proportional() {
        let endpoints = vec![
            with_capacity(endpoint("big", EndpointType::Primary, true), 10, 100),
            with_capacity(endpoint("small", EndpointType::Primary, true), 90, 100),
        ];
        let mut rng = SeededRandom::new(42);
        let samples = 20_000;
        let mut big = 0usize;
        for _ in 0..samples {
            if pick_for_negotiate(&endpoints, &mut rng).unwrap().name() == "big" {
                big += 1;
            }
        }
        let fraction = big as f64 / samples as f64;
        // Expected 0.9; allow a generous statistical tolerance
        assert!(
            (fraction - 0.9).abs() < 0.02,
            "big endpoint picked {} of {} draws",
            big,
            samples
        );
    }
}
