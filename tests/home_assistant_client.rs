//! Integration tests for the Home Assistant REST client against a mocked
//! server, grounded in `original_source/evse_manager/app/ha_api.py`'s
//! `get_state`/`call_service` semantics.

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use solar_evse_controller::adapter::home_assistant::HomeAssistantClient;
use solar_evse_controller::adapter::DataSource;

#[tokio::test]
async fn get_state_returns_parsed_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states/sensor.battery_soc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entity_id": "sensor.battery_soc",
            "state": "62.5",
        })))
        .mount(&server)
        .await;

    let client = HomeAssistantClient::new(server.uri(), "test-token").unwrap();
    let state = client.get_state("sensor.battery_soc").await.unwrap();
    assert_eq!(state, Some("62.5".to_string()));
}

#[tokio::test]
async fn get_state_returns_none_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states/sensor.missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = HomeAssistantClient::new(server.uri(), "test-token").unwrap();
    let state = client.get_state("sensor.missing").await.unwrap();
    assert_eq!(state, None);
}

#[tokio::test]
async fn call_service_posts_entity_and_value() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/services/number/set_value"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = HomeAssistantClient::new(server.uri(), "test-token").unwrap();
    client
        .call_service("number", "set_value", "number.ev_charger_set_current", Some(6.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn call_service_errors_on_failure_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/services/switch/turn_on"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = HomeAssistantClient::new(server.uri(), "test-token").unwrap();
    let result = client.call_service("switch", "turn_on", "switch.ev_charger", None).await;
    assert!(result.is_err());
}
