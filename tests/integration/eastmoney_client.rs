//! EastMoney spot snapshot paging

use serde_json::json;
use test_log::test;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::logging::init_test_logging;
use stock_sync::api::{ApiError, EastMoneyClient};

const CLIST_PATH: &str = "/api/qt/clist/get";

#[test(tokio::test)]
async fn test_spot_snapshot_concatenates_pages() {
    init_test_logging();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(CLIST_PATH))
        .and(query_param("pn", "1"))
        .and(query_param("pz", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rc": 0,
            "data": {"total": 3, "diff": [
                {"f2": 11.2, "f12": "000001", "f14": "平安银行", "f20": 2.2e11},
                {"f2": "-", "f12": "000002", "f14": "万科A", "f20": "-"}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(CLIST_PATH))
        .and(query_param("pn", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rc": 0,
            "data": {"total": 3, "diff": [
                {"f2": 1700.0, "f12": "600519", "f14": "贵州茅台", "f20": 2.1e12}
            ]}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = EastMoneyClient::new(&server.uri()).unwrap().with_page_size(2);
    let rows = client.fetch_spot_snapshot().await.unwrap();

    let codes: Vec<&str> = rows.iter().map(|r| r.code.as_str()).collect();
    assert_eq!(codes, vec!["000001", "000002", "600519"]);
    assert_eq!(rows[1].latest_price, None);
    assert_eq!(rows[2].market_cap, Some(2.1e12));
}

#[test(tokio::test)]
async fn test_server_error_is_reported() {
    init_test_logging();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(CLIST_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&server)
        .await;

    let client = EastMoneyClient::new(&server.uri()).unwrap();
    let error = client.fetch_spot_snapshot().await.unwrap_err();
    assert!(matches!(error, ApiError::Status { status: 503, .. }));
}

#[test(tokio::test)]
async fn test_empty_snapshot_is_an_error() {
    init_test_logging();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(CLIST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rc": 0, "data": null})))
        .mount(&server)
        .await;

    let client = EastMoneyClient::new(&server.uri()).unwrap();
    assert!(client.fetch_spot_snapshot().await.is_err());
}
