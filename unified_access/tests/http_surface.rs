mod common;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::net::SocketAddr;
use uuid::Uuid;

use common::{local_runtime, spawn_server};
use unified_access::{PaginatedResponse, Principal, Record, StaticAuthenticator};

const TOKEN: &str = "surface-token";

async fn start() -> (SocketAddr, reqwest::Client) {
    let runtime = local_runtime().await;
    let principal = Principal::member(Uuid::new_v4(), ["*"]);
    let addr = spawn_server(
        runtime,
        StaticAuthenticator::new().with_token(TOKEN, principal),
    )
    .await;
    (addr, reqwest::Client::new())
}

#[tokio::test]
async fn requests_without_a_valid_token_are_unauthorized() {
    let (addr, client) = start().await;
    let url = format!("http://{}/products", addr);

    let anonymous = client.get(&url).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    let body: Value = anonymous.json().await.unwrap();
    assert_eq!(body["error"], json!("authentication"));

    let forged = client.get(&url).bearer_auth("forged").send().await.unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let (addr, client) = start().await;

    let response = client
        .get(format!("http://{}/widgets", addr))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn crud_round_trip_over_http() {
    let (addr, client) = start().await;
    let collection = format!("http://{}/products", addr);

    let response = client
        .post(&collection)
        .bearer_auth(TOKEN)
        .json(&json!({"name": "Lamp", "price": 20}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Record = response.json().await.unwrap();
    assert_eq!(created.lsn, 1);
    let item = format!("{}/{}", collection, created.id);

    let fetched: Record = client
        .get(&item)
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched, created);

    let response = client
        .put(&item)
        .bearer_auth(TOKEN)
        .json(&json!({"price": 25, "expected_lsn": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated: Record = response.json().await.unwrap();
    assert_eq!(updated.lsn, 2);
    assert_eq!(updated.get("expected_lsn"), None);

    let stale = client
        .put(&item)
        .bearer_auth(TOKEN)
        .json(&json!({"price": 30, "expected_lsn": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status(), StatusCode::CONFLICT);
    let body: Value = stale.json().await.unwrap();
    assert_eq!(body["error"], json!("conflict"));
    assert_eq!(body["expected_lsn"], json!(1));
    assert_eq!(body["actual_lsn"], json!(2));

    let page: PaginatedResponse = client
        .get(&collection)
        .bearer_auth(TOKEN)
        .query(&[("order_by", "-price"), ("limit", "10"), ("search", "lamp")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page.items, vec![updated]);
    assert_eq!(page.limit, 10);

    let deleted = client.delete(&item).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = client.get(&item).bearer_auth(TOKEN).send().await.unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    let body: Value = gone.json().await.unwrap();
    assert_eq!(body["error"], json!("not_found"));
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let (addr, client) = start().await;
    let collection = format!("http://{}/products", addr);

    let bad_id = client
        .get(format!("{}/not-a-uuid", collection))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);

    let invalid = client
        .post(&collection)
        .bearer_auth(TOKEN)
        .json(&json!({"name": "No price"}))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = invalid.json().await.unwrap();
    assert_eq!(body["error"], json!("validation"));

    let bad_filter = client
        .get(&collection)
        .bearer_auth(TOKEN)
        .query(&[("colour", "red")])
        .send()
        .await
        .unwrap();
    assert_eq!(bad_filter.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
