//! Feishu Bitable client against a mock open API

use assert_matches::assert_matches;
use serde_json::json;
use test_log::test;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::logging::init_test_logging;
use stock_sync::api::{ApiError, FeishuClient, RemoteTable};
use stock_sync::models::{CoercedRecord, FeishuConfig, FieldValue, RecordUpdate};

const TOKEN_PATH: &str = "/open-apis/auth/v3/tenant_access_token/internal";
const RECORDS_PATH: &str = "/open-apis/bitable/v1/apps/AppTok/tables/tbl1/records";

fn config(server: &MockServer, user_token: Option<&str>) -> FeishuConfig {
    FeishuConfig {
        app_id: "cli_test".to_string(),
        app_secret: "secret".to_string(),
        user_access_token: user_token.map(str::to_string),
        app_token: "AppTok".to_string(),
        table_id: "tbl1".to_string(),
        api_base_url: server.uri(),
        page_size: 500,
        update_batch_size: 1,
    }
}

async fn mount_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_json(json!({"app_id": "cli_test", "app_secret": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "msg": "ok",
            "tenant_access_token": "t-abc",
            "expire": 7200
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn records_body() -> serde_json::Value {
    json!({
        "code": 0,
        "msg": "success",
        "data": {
            "has_more": false,
            "total": 2,
            "items": [
                {"record_id": "rec1", "fields": {"Ticker": "600519", "Name": "贵州茅台"}},
                {"record_id": "rec2", "fields": {"Ticker": [{"type": "text", "text": "002156"}]}}
            ]
        }
    })
}

#[test(tokio::test)]
async fn test_tenant_token_is_cached_across_calls() {
    init_test_logging();
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("GET"))
        .and(path(RECORDS_PATH))
        .and(query_param("page_size", "500"))
        .and(header("authorization", "Bearer t-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(records_body()))
        .expect(2)
        .mount(&server)
        .await;

    let client = FeishuClient::new(&config(&server, None)).unwrap();
    let first = client.list_records().await.unwrap();
    let second = client.list_records().await.unwrap();

    assert_eq!(first.records.len(), 2);
    assert_eq!(first.records[1].ticker_text().as_deref(), Some("002156"));
    assert_eq!(second.total, Some(2));
}

#[test(tokio::test)]
async fn test_user_token_skips_tenant_exchange() {
    init_test_logging();
    let server = MockServer::start().await;
    mount_token(&server, 0).await;

    Mock::given(method("GET"))
        .and(path(RECORDS_PATH))
        .and(header("authorization", "Bearer u-user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(records_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = FeishuClient::new(&config(&server, Some("u-user"))).unwrap();
    assert_eq!(client.list_records().await.unwrap().records.len(), 2);
}

#[test(tokio::test)]
async fn test_non_zero_code_is_an_error() {
    init_test_logging();
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("GET"))
        .and(path(RECORDS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 91402,
            "msg": "NOTEXIST"
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&config(&server, None)).unwrap();
    let error = client.list_records().await.unwrap_err();
    assert_matches!(error, ApiError::Feishu { code: 91402, .. });
}

#[test(tokio::test)]
async fn test_rejected_credentials_are_auth_errors() {
    init_test_logging();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 10014,
            "msg": "app secret invalid"
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&config(&server, None)).unwrap();
    let error = client.list_records().await.unwrap_err();
    assert!(error.is_auth());
}

#[test(tokio::test)]
async fn test_batch_update_posts_records() {
    init_test_logging();
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("POST"))
        .and(path(format!("{}/batch_update", RECORDS_PATH)))
        .and(body_json(json!({
            "records": [
                {"record_id": "rec1", "fields": {"Current Price": 1700.0, "Ticker": "600519"}}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "msg": "success",
            "data": {"records": []}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut fields = CoercedRecord::new();
    fields.insert("Ticker".to_string(), FieldValue::Text("600519".to_string()));
    fields.insert("Current Price".to_string(), FieldValue::Float(1700.0));

    let client = FeishuClient::new(&config(&server, None)).unwrap();
    client
        .batch_update_records(&[RecordUpdate { record_id: "rec1".to_string(), fields }])
        .await
        .unwrap();

    // Nothing to send means no request at all
    client.batch_update_records(&[]).await.unwrap();
}

#[test(tokio::test)]
async fn test_list_fields() {
    init_test_logging();
    let server = MockServer::start().await;
    mount_token(&server, 1).await;

    Mock::given(method("GET"))
        .and(path("/open-apis/bitable/v1/apps/AppTok/tables/tbl1/fields"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": {"items": [
                {"field_id": "fld1", "field_name": "Ticker", "type": 1},
                {"field_id": "fld2", "field_name": "Current Price", "type": 2}
            ]}
        })))
        .mount(&server)
        .await;

    let client = FeishuClient::new(&config(&server, None)).unwrap();
    let fields = client.list_fields().await.unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[1].field_name, "Current Price");
    assert_eq!(fields[1].field_type, 2);
}

#[test(tokio::test)]
async fn test_expired_token_is_refreshed_once() {
    init_test_logging();
    let server = MockServer::start().await;
    mount_token(&server, 2).await;

    Mock::given(method("GET"))
        .and(path(RECORDS_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": 99991663,
            "msg": "Invalid access token for authorization"
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(RECORDS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(records_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = FeishuClient::new(&config(&server, None)).unwrap();
    assert_eq!(client.list_records().await.unwrap().records.len(), 2);
}
