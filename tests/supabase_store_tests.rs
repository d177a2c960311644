//! Hosted store writes against a local PostgREST stand-in
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use product_harvester::domain::{Gender, ProductId, ProductRecord, ProductStore, StoreError};
use product_harvester::infrastructure::SupabaseStore;
use product_harvester::infrastructure::config::DatabaseConfig;

/// Request bodies seen by the stand-in, plus the status it answers with.
#[derive(Clone, Default)]
struct Upserts {
    bodies: Arc<Mutex<Vec<Vec<Value>>>>,
    conflict_targets: Arc<Mutex<Vec<String>>>,
    reject_all: Option<StatusCode>,
}

fn column_set(row: &Value) -> Vec<String> {
    row.as_object()
        .map(|object| object.keys().cloned().collect())
        .unwrap_or_default()
}

/// Answers like PostgREST: a bulk insert whose objects differ in keys is a 400,
/// as is any row titled "bad".
async fn upsert(
    State(upserts): State<Upserts>,
    Query(params): Query<HashMap<String, String>>,
    Json(rows): Json<Vec<Value>>,
) -> StatusCode {
    let uniform = rows.windows(2).all(|pair| column_set(&pair[0]) == column_set(&pair[1]));
    let has_bad_row = rows.iter().any(|row| row["title"] == "bad");

    upserts.bodies.lock().unwrap().push(rows);
    upserts
        .conflict_targets
        .lock()
        .unwrap()
        .push(params.get("on_conflict").cloned().unwrap_or_default());

    match upserts.reject_all {
        Some(status) => status,
        None if !uniform || has_bad_row => StatusCode::BAD_REQUEST,
        None => StatusCode::CREATED,
    }
}

async fn serve(upserts: Upserts) -> SupabaseStore {
    let app = Router::new()
        .route("/rest/v1/products", post(upsert))
        .with_state(upserts);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    SupabaseStore::new(&DatabaseConfig {
        url: Some(format!("http://{addr}")),
        key: Some("anon-key".to_string()),
        ..DatabaseConfig::default()
    })
    .unwrap()
}

fn record(code: &str, title: &str) -> ProductRecord {
    let url = format!("https://shop.example.com/shop/eu/p/{code}");
    ProductRecord {
        id: ProductId::from_url("scraper", &url),
        source: "scraper".to_string(),
        product_url: url,
        image_url: Some(format!("https://cdn.example.com/{code}.jpg")),
        image_urls: vec![],
        brand: "Example".to_string(),
        title: title.to_string(),
        description: None,
        category: Some("womens".to_string()),
        gender: Gender::Woman,
        price: Some(49.9),
        currency: "EUR".to_string(),
        sizes: vec!["S".to_string(), "M".to_string()],
        second_hand: false,
        embedding: None,
        metadata: serde_json::json!({}),
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_mixed_batch_is_sent_as_uniform_requests() {
    let upserts = Upserts::default();
    let store = serve(upserts.clone()).await;

    let batch = vec![
        record("dress-1", "Linen Dress").with_embedding(vec![0.6, 0.8]),
        record("skirt-2", "Denim Skirt"),
        record("top-3", "Silk Top").with_embedding(vec![1.0, 0.0]),
    ];
    let report = store.upsert_products_batch(&batch).await.unwrap();

    assert_eq!(report.written, 3);
    assert!(report.failed.is_empty());

    // One request per column set and no row-by-row fallback
    let bodies = upserts.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    for body in bodies.iter() {
        assert!(body.windows(2).all(|pair| column_set(&pair[0]) == column_set(&pair[1])));
    }
    assert_eq!(bodies[0].len(), 2);
    assert!(bodies[1].iter().all(|row| row.get("embedding").is_none()));

    let targets = upserts.conflict_targets.lock().unwrap();
    assert!(targets.iter().all(|target| target == "source,product_url"));
}

#[tokio::test]
async fn test_rejected_row_is_isolated() {
    let upserts = Upserts::default();
    let store = serve(upserts.clone()).await;

    let batch = vec![record("dress-1", "Linen Dress"), record("odd-2", "bad"), record("top-3", "Silk Top")];
    let report = store.upsert_products_batch(&batch).await.unwrap();

    assert_eq!(report.written, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "https://shop.example.com/shop/eu/p/odd-2");
    // The batch, then each row on its own
    assert_eq!(upserts.bodies.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_unauthorized_batch_is_fatal() {
    let upserts = Upserts {
        reject_all: Some(StatusCode::UNAUTHORIZED),
        ..Upserts::default()
    };
    let store = serve(upserts.clone()).await;

    let err = store
        .upsert_products_batch(&[record("dress-1", "Linen Dress")])
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Unauthorized { status: 401, .. }));
    assert!(err.is_fatal());
    assert_eq!(upserts.bodies.lock().unwrap().len(), 1);
}
