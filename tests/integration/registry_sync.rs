//! Ticker registry sync against mocked listing endpoints

use pretty_assertions::assert_eq;
use std::sync::Arc;
use test_log::test;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{date, test_settings, Script, ScriptedFetcher, TestDatabase};
use stock_ingest::api::FetchError;
use stock_ingest::database::TickerRegistry;
use stock_ingest::models::{Config, StateKind, Ticker};
use stock_ingest::orchestrator::{NoDelay, Orchestrator, RunMode, RunRequest};
use stock_ingest::registry::{detect_delistings, sync_tickers, TickerSync};

const NASDAQ_LISTED: &str = "Symbol|Security Name|Market Category|Test Issue|Financial Status|Round Lot Size|ETF|NextShares\n\
AAPL|Apple Inc. - Common Stock|Q|N|N|100|N|N\n\
MSFT|Microsoft Corporation - Common Stock|Q|N|N|100|N|N\n\
ACAHW|Acme Acquisition Corp - Warrant|G|N|N|100|N|N\n\
File Creation Time: 0603202418:01|||||||\n";

const OTHER_LISTED: &str = "ACT Symbol|Security Name|Exchange|CQS Symbol|ETF|Round Lot Size|Test Issue|NASDAQ Symbol\n\
IBM|International Business Machines Corporation Common Stock|N|IBM|N|100|N|IBM\n\
BRK.B|Berkshire Hathaway Inc. Class B|N|BRK.B|N|100|N|BRK.B\n\
File Creation Time: 0603202418:01|||||||\n";

fn config_for(server: &MockServer) -> Config {
    Config {
        nasdaq_listed_url: format!("{}/nasdaqlisted.txt", server.uri()),
        other_listed_url: format!("{}/otherlisted.txt", server.uri()),
        sec_tickers_url: format!("{}/company_tickers.json", server.uri()),
        ..Config::default()
    }
}

async fn active_symbols(test_db: &TestDatabase) -> Vec<String> {
    test_db
        .db
        .list_active_tickers()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.symbol)
        .collect()
}

async fn mount_nasdaq_trader(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/nasdaqlisted.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(NASDAQ_LISTED))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/otherlisted.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(OTHER_LISTED))
        .mount(server)
        .await;
}

#[test(tokio::test)]
async fn test_sync_from_nasdaq_trader() {
    let server = MockServer::start().await;
    mount_nasdaq_trader(&server).await;

    let test_db = TestDatabase::new().await;
    let stats = TickerSync::from_config(&config_for(&server))
        .unwrap()
        .sync(&test_db.db)
        .await
        .unwrap();

    assert_eq!(stats.total, 3);
    assert_eq!(stats.new, 3);
    assert_eq!(active_symbols(&test_db).await, vec!["AAPL", "IBM", "MSFT"]);

    let ibm = test_db.db.get_ticker("IBM").await.unwrap().unwrap();
    assert_eq!(ibm.exchange, "NYSE");
    // New tickers start pending
    assert_eq!(test_db.record("IBM").await.kind(), StateKind::Pending);
}

#[test(tokio::test)]
async fn test_sync_falls_back_to_sec_edgar() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nasdaqlisted.txt"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/company_tickers.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."},
            "1": {"cik_str": 789019, "ticker": "MSFT", "title": "MICROSOFT CORP"}
        })))
        .mount(&server)
        .await;

    let test_db = TestDatabase::new().await;
    let stats = TickerSync::from_config(&config_for(&server))
        .unwrap()
        .sync(&test_db.db)
        .await
        .unwrap();

    assert_eq!(stats.new, 2);
    assert_eq!(active_symbols(&test_db).await, vec!["AAPL", "MSFT"]);
}

#[test(tokio::test)]
async fn test_fallback_sync_keeps_recorded_metadata() {
    let test_db = TestDatabase::new().await;

    let primary = MockServer::start().await;
    mount_nasdaq_trader(&primary).await;
    TickerSync::from_config(&config_for(&primary))
        .unwrap()
        .sync(&test_db.db)
        .await
        .unwrap();
    let recorded = test_db.db.get_ticker("AAPL").await.unwrap().unwrap();
    assert_eq!(recorded.exchange, "NASDAQ");

    // NASDAQ Trader is down; the SEC list has no exchange and a shorter name
    let degraded = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nasdaqlisted.txt"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&degraded)
        .await;
    Mock::given(method("GET"))
        .and(path("/company_tickers.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "0": {"cik_str": 320193, "ticker": "AAPL", "title": "Apple Inc."},
            "1": {"cik_str": 789019, "ticker": "MSFT", "title": "MICROSOFT CORP"},
            "2": {"cik_str": 51143, "ticker": "IBM", "title": "INTERNATIONAL BUSINESS MACHINES CORP"}
        })))
        .mount(&degraded)
        .await;

    let stats = TickerSync::from_config(&config_for(&degraded))
        .unwrap()
        .sync(&test_db.db)
        .await
        .unwrap();
    assert_eq!(stats.new, 0);
    assert_eq!(stats.updated, 3);
    assert_eq!(stats.deactivated, 0);

    assert_eq!(test_db.db.get_ticker("AAPL").await.unwrap().unwrap(), recorded);
    let ibm = test_db.db.get_ticker("IBM").await.unwrap().unwrap();
    assert_eq!(ibm.exchange, "NYSE");
}

#[test(tokio::test)]
async fn test_delisted_ticker_is_reset_and_excluded() {
    let test_db = TestDatabase::new().await;
    let listing = vec![Ticker::new("AAPL", "NASDAQ"), Ticker::new("GONE", "NASDAQ")];
    sync_tickers(&test_db.db, &listing).await.unwrap();

    // GONE fails twice while still listed
    let fetcher = Arc::new(ScriptedFetcher::new().always(
        "GONE",
        Script::Fail(FetchError::Transient("HTTP 500".to_string())),
    ));
    let orchestrator = Orchestrator::new(
        fetcher.clone(),
        test_db.db.clone(),
        test_db.db.clone(),
        test_settings(date(2024, 1, 1)),
    )
    .with_delay_policy(Arc::new(NoDelay));
    let request = RunRequest::new(RunMode::FullBackfill, date(2024, 1, 31));
    orchestrator.run(request.clone()).await.unwrap();
    orchestrator.run(request.clone()).await.unwrap();
    assert_eq!(test_db.record("GONE").await.attempt_count, 2);

    let current = vec![Ticker::new("AAPL", "NASDAQ")];
    assert_eq!(detect_delistings(&test_db.db, &current).await.unwrap(), vec!["GONE"]);
    // Detection alone changes nothing
    assert_eq!(active_symbols(&test_db).await, vec!["AAPL", "GONE"]);

    let stats = sync_tickers(&test_db.db, &current).await.unwrap();
    assert_eq!(stats.deactivated, 1);
    assert_eq!(active_symbols(&test_db).await, vec!["AAPL"]);

    let record = test_db.record("GONE").await;
    assert_eq!(record.kind(), StateKind::Pending);
    assert_eq!(record.attempt_count, 0);

    let calls = fetcher.price_calls_for("GONE");
    let summary = orchestrator
        .run(RunRequest::new(RunMode::RetryFailed, date(2024, 1, 31)))
        .await
        .unwrap();
    assert!(summary.outcome("GONE").is_none());
    assert_eq!(fetcher.price_calls_for("GONE"), calls);

    // An empty listing never wipes the universe
    let stats = sync_tickers(&test_db.db, &[]).await.unwrap();
    assert_eq!(stats.deactivated, 0);
    assert_eq!(active_symbols(&test_db).await, vec!["AAPL"]);

    // Reappearing tickers are reactivated
    let stats = sync_tickers(&test_db.db, &listing).await.unwrap();
    assert_eq!(stats.reactivated, 1);
    assert_eq!(active_symbols(&test_db).await, vec!["AAPL", "GONE"]);
}
