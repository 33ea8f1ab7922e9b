use std::path::{Path, PathBuf};

use httptest::matchers::{all_of, contains, matches, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use tempfile::tempdir;

use court_assignment_engine::config::AppConfig;
use court_assignment_engine::controller::BotStatus;
use court_assignment_engine::metrics::{AssignmentFilter, Pagination};
use court_assignment_engine::orchestrator::RunStatus;
use court_assignment_engine::Engine;

const UPSTREAM_SCHEMA: &str = r#"
CREATE TABLE data_courts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    address TEXT,
    city TEXT,
    cuantia_type TEXT,
    status TEXT NOT NULL DEFAULT 'Activo',
    deleted_at TEXT
);
CREATE TABLE clients (
    id INTEGER PRIMARY KEY,
    identification TEXT,
    deleted_at TEXT
);
CREATE TABLE client_addresses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL,
    address TEXT,
    neighborhood TEXT,
    city TEXT,
    department TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    deleted_at TEXT
);
CREATE TABLE lawsuits (
    id INTEGER PRIMARY KEY,
    client_id INTEGER NOT NULL,
    cuantia_type TEXT,
    lawsuit_status TEXT NOT NULL DEFAULT 'Pendiente',
    deleted_at TEXT
);
"#;

fn tenant_db(dir: &Path, name: &str, courts: &[(i64, &str, &str, &str)], lawsuits: &[(i64, &str, &str)]) -> PathBuf {
    let path = dir.join(name);
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(UPSTREAM_SCHEMA).unwrap();
    for (id, court_name, address, city) in courts {
        conn.execute(
            "INSERT INTO data_courts (id, name, address, city, cuantia_type) VALUES (?1, ?2, ?3, ?4, 'Minima')",
            params![id, court_name, address, city],
        )
        .unwrap();
    }
    for (id, address, city) in lawsuits {
        conn.execute(
            "INSERT INTO clients (id, identification) VALUES (?1, ?2)",
            params![id, format!("CC-{id}")],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO client_addresses (client_id, address, city) VALUES (?1, ?2, ?3)",
            params![id, address, city],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO lawsuits (id, client_id, cuantia_type) VALUES (?1, ?1, 'Minima')",
            params![id],
        )
        .unwrap();
    }
    path
}

fn located(lat: f64, lng: f64, locality: &str) -> Value {
    json!({
        "status": "OK",
        "results": [{
            "formatted_address": format!("{locality}, Colombia"),
            "geometry": { "location": { "lat": lat, "lng": lng } },
            "address_components": [
                { "long_name": locality, "types": ["locality", "political"] },
                { "long_name": "Colombia", "types": ["country", "political"] }
            ]
        }]
    })
}

macro_rules! geocode_request {
    ($address:expr) => {
        all_of![
            request::method_path("GET", "/geocode/json"),
            request::query(url_decoded(contains(("key", "it-key")))),
            request::query(url_decoded(contains(("address", matches($address))))),
        ]
    };
}

#[tokio::test]
async fn runs_every_tenant_against_the_http_provider() {
    let server = Server::run();
    server.expect(
        Expectation::matching(geocode_request!("(?i)c[uú]cuta"))
            .times(2)
            .respond_with(json_encoded(located(7.8891, -72.4967, "Cúcuta"))),
    );
    server.expect(
        Expectation::matching(geocode_request!("(?i)bogot"))
            .times(2)
            .respond_with(json_encoded(located(4.6097, -74.0817, "Bogotá"))),
    );
    server.expect(
        Expectation::matching(geocode_request!("Vereda"))
            .times(2)
            .respond_with(json_encoded(json!({ "status": "ZERO_RESULTS", "results": [] }))),
    );

    let dir = tempdir().unwrap();
    let cartera_a = tenant_db(
        dir.path(),
        "cartera_a.db",
        &[(1, "Juzgado 1 Civil Municipal", "Avenida 5 # 10-20", "San José de Cúcuta")],
        &[(10, "Calle 12 # 3-45", "CUCUTA"), (11, "Sin dirección", "CUCUTA")],
    );
    let cartera_b = tenant_db(
        dir.path(),
        "cartera_b.db",
        &[(7, "Juzgado 7 Civil Municipal", "Carrera 7 # 20-30", "Bogotá D.C.")],
        &[(20, "Calle 80 # 15-10", "BOGOTA D.C."), (21, "Vereda El Rosal", "Pamplona")],
    );

    let document = json!({
        "qa": {
            "tenant_databases": [
                { "id": "cartera_a", "path": cartera_a },
                { "id": "cartera_b", "path": cartera_b }
            ],
            "api_limits": { "daily_max": 100, "monthly_max": 1000 },
            "geocoding_api_key": "it-key",
            "geocoding_endpoint": server.url_str("/geocode/json"),
            "city_variant_groups": [
                ["Cúcuta", "San José de Cúcuta"],
                ["Bogotá", "Bogotá D.C.", "Santafé de Bogotá"]
            ],
            "max_parallel_tenants": 2
        }
    });
    let config_path = dir.path().join("engine-config.json");
    std::fs::write(&config_path, document.to_string()).unwrap();

    let engine = Engine::new(AppConfig {
        environment: "qa".into(),
        config_path,
        state_db_path: dir.path().join("state").join("engine-state.db"),
        geocoding_http_timeout_secs: 5,
        geocoding_rate_limit_qps: 1000,
        geocoding_max_attempts: 2,
        geocoding_base_backoff_ms: 0,
        run_stale_after_minutes: 30,
    })
    .unwrap();

    let first = engine.execute_once("qa", None).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let a = &first.per_tenant["cartera_a"];
    assert_eq!(a.sync.as_ref().unwrap().geocoded, 1);
    assert_eq!(a.assign.as_ref().unwrap().assigned, 1);
    assert_eq!(a.assign.as_ref().unwrap().no_address, 1);
    let b = &first.per_tenant["cartera_b"];
    assert_eq!(b.assign.as_ref().unwrap().assigned, 1);
    assert_eq!(b.assign.as_ref().unwrap().geocode_failed, 1);
    assert_eq!(engine.get_status("qa").unwrap().status, BotStatus::Stopped);

    let second = engine.execute_once("qa", None).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.per_tenant["cartera_a"].sync.as_ref().unwrap().skipped, 1);
    assert_eq!(second.per_tenant["cartera_a"].assign.as_ref().unwrap().skipped, 2);
    assert_eq!(second.per_tenant["cartera_b"].assign.as_ref().unwrap().skipped, 1);

    let stats = engine.get_stats("qa", None).unwrap();
    assert_eq!(stats.totals.processed, 4);
    assert_eq!(stats.totals.assigned, 2);
    assert_eq!(stats.totals.errors, 1);
    assert_eq!(stats.totals.percentage_assigned, 50.0);

    let usage = engine.api_usage("qa").unwrap();
    assert_eq!(usage.daily.calls, 6);
    assert_eq!(usage.daily.remaining, 94);

    let page = engine
        .list_assignments("qa", "cartera_b", AssignmentFilter::Assigned, Pagination::default())
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.rows[0].lawsuit_id, 20);
    assert_eq!(page.rows[0].court_id, Some(7));
    assert_eq!(page.rows[0].court_name.as_deref(), Some("Juzgado 7 Civil Municipal"));
}

#[tokio::test]
async fn unreachable_tenant_does_not_block_the_others() {
    let server = Server::run();
    server.expect(
        Expectation::matching(geocode_request!("(?i)c[uú]cuta"))
            .times(2)
            .respond_with(json_encoded(located(7.8891, -72.4967, "Cúcuta"))),
    );

    let dir = tempdir().unwrap();
    let cartera_a = tenant_db(
        dir.path(),
        "cartera_a.db",
        &[(1, "Juzgado 1 Civil Municipal", "Avenida 5 # 10-20", "Cúcuta")],
        &[(10, "Calle 12 # 3-45", "Cúcuta")],
    );
    let document = json!({
        "qa": {
            "tenant_databases": [
                { "id": "cartera_a", "path": cartera_a },
                { "id": "cartera_ghost", "path": dir.path().join("missing.db") }
            ],
            "api_limits": { "daily_max": 100, "monthly_max": 1000 },
            "geocoding_api_key": "it-key",
            "geocoding_endpoint": server.url_str("/geocode/json")
        }
    });
    let config_path = dir.path().join("engine-config.json");
    std::fs::write(&config_path, document.to_string()).unwrap();

    let engine = Engine::new(AppConfig {
        environment: "qa".into(),
        config_path,
        state_db_path: dir.path().join("engine-state.db"),
        geocoding_http_timeout_secs: 5,
        geocoding_rate_limit_qps: 1000,
        geocoding_max_attempts: 1,
        geocoding_base_backoff_ms: 0,
        run_stale_after_minutes: 30,
    })
    .unwrap();

    let report = engine.start("qa").await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.per_tenant["cartera_ghost"].error.is_some());
    assert_eq!(report.per_tenant["cartera_a"].assign.as_ref().unwrap().assigned, 1);

    let checks = engine.test_connections("qa").unwrap();
    assert_eq!(checks.len(), 2);
    let stats = engine.get_stats("qa", None).unwrap();
    assert_eq!(stats.totals.assigned, 1);
    assert!(stats.tenants.iter().any(|entry| entry.tenant == "cartera_ghost" && entry.error.is_some()));
}
