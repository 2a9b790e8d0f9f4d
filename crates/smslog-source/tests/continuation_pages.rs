// Follows next_page_uri across pages against a mock LaML endpoint.

use std::time::Duration;

use chrono::NaiveDate;
use smslog_source::{
    BackoffPolicy, LamlClient, LamlClientConfig, MessageSource, PageRequest, ThrottleConfig,
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MESSAGES_PATH: &str = "/api/laml/2010-04-01/Accounts/PJ777/Messages.json";

#[tokio::test]
async fn continuation_token_is_followed_verbatim() {
    let server = MockServer::start().await;
    let next = format!("{MESSAGES_PATH}?PageSize=2&Page=1&PageToken=PAabc");

    Mock::given(method("GET"))
        .and(path(MESSAGES_PATH))
        .and(query_param("PageToken", "PAabc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [{"sid": "SM3"}],
            "next_page_uri": null
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(MESSAGES_PATH))
        .and(query_param("DateSent>", "2026-02-28"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [{"sid": "SM1"}, {"sid": "SM2"}],
            "next_page_uri": next
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = LamlClientConfig::new(server.uri(), "PJ777", "token");
    config.page_size = 2;
    config.backoff = BackoffPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    config.throttle = ThrottleConfig {
        every_records: 2,
        pause: Duration::ZERO,
    };
    let client = LamlClient::new(config).expect("client");

    let first = client
        .fetch_page(&PageRequest::SentAfter(
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
        ))
        .await
        .expect("first page");
    assert_eq!(first.messages.len(), 2);

    let cursor = first.next_cursor().expect("cursor").to_string();
    let second = client
        .fetch_page(&PageRequest::Continue(cursor))
        .await
        .expect("second page");
    assert_eq!(second.messages[0].sid.as_deref(), Some("SM3"));
    assert!(second.next_cursor().is_none());
}
