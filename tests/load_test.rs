//! Load testing for the forwarding proxy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dispatch_engine::config::{BackendConfig, DispatchConfig};
use dispatch_engine::engine::DispatchEngine;
use dispatch_engine::lifecycle::Shutdown;
use dispatch_engine::load_balancer::Algorithm;

mod common;

#[tokio::test]
async fn test_weighted_distribution_under_load() {
    let weights = [("b1", 3), ("b2", 1), ("b3", 1)];
    let mut config = DispatchConfig::default();
    config.health_check.enabled = false;
    config.balancing.algorithm = Algorithm::WeightedRoundRobin;
    for (name, weight) in weights {
        let addr = common::start_mock_backend(name).await;
        config.backends.push(BackendConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            weight,
        });
    }

    let engine = Arc::new(DispatchEngine::from_config(&config).unwrap());
    let shutdown = Shutdown::new();
    let proxy = common::start_proxy(engine.clone(), &shutdown).await;

    let concurrency = 10;
    let requests_per_task = 50;
    let total_requests = concurrency * requests_per_task;

    let client = reqwest::Client::new();
    let start = Instant::now();

    let mut tasks = Vec::new();
    for _ in 0..concurrency {
        let client = client.clone();
        let url = format!("http://{}/", proxy);
        tasks.push(tokio::spawn(async move {
            let mut bodies = Vec::new();
            for _ in 0..requests_per_task {
                if let Ok(res) = client.get(&url).send().await {
                    if res.status().is_success() {
                        if let Ok(body) = res.text().await {
                            bodies.push(body);
                        }
                    }
                }
            }
            bodies
        }));
    }

    let mut hits: HashMap<String, usize> = HashMap::new();
    for task in tasks {
        for body in task.await.unwrap() {
            *hits.entry(body).or_default() += 1;
        }
    }
    let elapsed = start.elapsed();
    let succeeded: usize = hits.values().sum();

    println!(
        "{} requests in {:?} ({:.0} req/s), hits: {:?}",
        succeeded,
        elapsed,
        succeeded as f64 / elapsed.as_secs_f64(),
        hits
    );

    assert_eq!(succeeded, total_requests);
    assert_eq!(hits["b1"], total_requests * 3 / 5);
    assert_eq!(hits["b2"], total_requests / 5);
    assert_eq!(hits["b3"], total_requests / 5);

    // Every lease was settled.
    assert!(
        common::wait_until(&engine, Duration::from_secs(1), |b| {
            b.iter().all(|b| b.connections == 0)
        })
        .await
    );

    shutdown.trigger();
}

#[tokio::test]
async fn test_least_connections_spreads_slow_requests() {
    let mut config = DispatchConfig::default();
    config.health_check.enabled = false;
    config.balancing.algorithm = Algorithm::LeastConnections;
    for name in ["b1", "b2"] {
        let addr = common::start_programmable_backend(move || async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            (200, name.to_string())
        })
        .await;
        config.backends.push(BackendConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            weight: 1,
        });
    }

    let engine = Arc::new(DispatchEngine::from_config(&config).unwrap());
    let shutdown = Shutdown::new();
    let proxy = common::start_proxy(engine.clone(), &shutdown).await;
    let client = common::client();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        let url = format!("http://{}/", proxy);
        tasks.push(tokio::spawn(async move {
            client.get(&url).send().await.unwrap().text().await.unwrap()
        }));
    }

    // Mid-flight the load is split evenly.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let in_flight: Vec<u64> = engine.list_backends().iter().map(|b| b.connections).collect();
    assert_eq!(in_flight.iter().sum::<u64>(), 8);
    assert_eq!(in_flight[0], in_flight[1]);

    for task in tasks {
        task.await.unwrap();
    }
    shutdown.trigger();
}
