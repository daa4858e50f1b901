// SPDX-License-Identifier: MIT OR Apache-2.0
//! Full drone lifecycle against a mock control plane: register, iterate
//! over mixed-shape profiles, report runs, heartbeat.

use chartly_drone::{ClientOptions, ControlPlaneClient, Drone, DroneConfig, shutdown_pair};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn drone_for(server: &MockServer) -> Drone {
    let config = DroneConfig::from_lookup(|name| match name {
        "CONTROL_PLANE" => Some(server.uri()),
        "DRONE_ID" => Some("drone-e2e".to_string()),
        "PROCESS_INTERVAL" => Some("1s".to_string()),
        _ => None,
    })
    .unwrap();
    let mut opts = ClientOptions::new(server.uri(), &config.user_agent);
    opts.allow_loopback_sources = true;
    Drone::with_client(config, ControlPlaneClient::new(opts).unwrap())
}

fn yaml_profile(id: &str, url: &str, mapping: &str) -> String {
    format!(
        "id: {id}\nname: {id}\nversion: \"1\"\nsource:\n  type: http_rest\n  url: {url}\n  auth: none\n{mapping}"
    )
}

#[tokio::test]
async fn two_profiles_of_different_shapes_run_in_one_iteration() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/drones/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "drone-e2e",
            "status": "registered",
            "assigned_profiles": ["crypto-ethereum-live", "census-state-pop"],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/drones/drone-e2e/work"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    // Profile 1: keyed crypto map.
    Mock::given(method("GET"))
        .and(path("/api/profiles/crypto-ethereum-live"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "crypto-ethereum-live",
            "content": yaml_profile(
                "crypto-ethereum-live",
                &format!("{}/crypto", server.uri()),
                "mapping:\n  crypto_id: dims.crypto_id\n  usd: measures.price_usd\n",
            ),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crypto"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ethereum": {"usd": 2000.25},
        })))
        .mount(&server)
        .await;

    // Profile 2: census header rows, empty mapping (passthrough).
    Mock::given(method("GET"))
        .and(path("/api/profiles/census-state-pop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "census-state-pop",
            "content": yaml_profile(
                "census-state-pop",
                &format!("{}/census", server.uri()),
                "",
            ),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/census"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            ["NAME", "POP"],
            ["CA", "39538223"],
            ["TX", "29145505"],
        ])))
        .mount(&server)
        .await;

    for endpoint in ["/api/results", "/api/runs", "/api/drones/heartbeat"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
    }

    let (_handle, shutdown) = shutdown_pair();
    let mut drone = drone_for(&server);
    drone.register(&shutdown).await.unwrap();
    drone.iterate(&shutdown).await.unwrap();

    let requests = server.received_requests().await.unwrap();

    let results: Vec<serde_json::Value> = requests
        .iter()
        .filter(|r| r.url.path() == "/api/results")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(results.len(), 2);

    let crypto = results
        .iter()
        .find(|r| r["profile_id"] == "crypto-ethereum-live")
        .unwrap();
    assert_eq!(crypto["data"][0]["dims"]["crypto_id"], "ethereum");
    assert_eq!(crypto["data"][0]["dims"]["timeframe"], "live");
    assert_eq!(crypto["data"][0]["measures"]["price_usd"], 2000.25);

    let census = results
        .iter()
        .find(|r| r["profile_id"] == "census-state-pop")
        .unwrap();
    assert_eq!(census["data"].as_array().unwrap().len(), 2);
    assert_eq!(census["data"][0]["NAME"], "CA");
    assert_eq!(census["data"][1]["POP"], "29145505");

    let runs: Vec<serde_json::Value> = requests
        .iter()
        .filter(|r| r.url.path() == "/api/runs")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(runs.len(), 2, "one run per profile per iteration");
    assert!(runs.iter().all(|r| r["status"] == "succeeded"));
    assert!(runs.iter().all(|r| r["drone_id"] == "drone-e2e"));

    // Heartbeat lands after the profile work.
    let heartbeat_index = requests
        .iter()
        .position(|r| r.url.path() == "/api/drones/heartbeat")
        .unwrap();
    let last_run_index = requests
        .iter()
        .rposition(|r| r.url.path() == "/api/runs")
        .unwrap();
    assert!(heartbeat_index > last_run_index);
}

#[tokio::test]
async fn second_iteration_skips_profiles_that_are_not_yet_due() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/drones/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "drone-e2e",
            "assigned_profiles": ["slow-profile"],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/drones/drone-e2e/work"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/profiles/slow-profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "slow-profile",
            "interval": "1h",
            "content": yaml_profile(
                "slow-profile",
                &format!("{}/slow", server.uri()),
                "",
            ),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [{"v": 1}]})))
        .mount(&server)
        .await;
    for endpoint in ["/api/results", "/api/runs", "/api/drones/heartbeat"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
    }

    let (_handle, shutdown) = shutdown_pair();
    let mut drone = drone_for(&server);
    drone.register(&shutdown).await.unwrap();

    // First iteration: no last run, so the profile executes.
    drone.iterate(&shutdown).await.unwrap();
    // Second iteration: well inside the 1h interval, so it is skipped.
    drone.iterate(&shutdown).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let executions = requests.iter().filter(|r| r.url.path() == "/slow").count();
    assert_eq!(executions, 1, "not due again within the interval");
    let heartbeats = requests
        .iter()
        .filter(|r| r.url.path() == "/api/drones/heartbeat")
        .count();
    assert_eq!(heartbeats, 2, "every iteration heartbeats");
}
