mod common;

use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::{json, Value};
use uuid::Uuid;

use common::{attrs, local_registry, local_runtime, member, open_runtime};
use unified_access::config::DatabaseConfig;
use unified_access::notify::LiveEventKind;
use unified_access::{
    Config, DataAccess, Error, ListFilter, ListQuery, OrderBy, Principal, RequestContext,
    SubscriberFilter,
};

#[rstest]
#[case(json!({"name": "A", "price": 10}))]
#[case(json!({"name": "Widget", "price": 2.5, "sku": "W-1", "active": false}))]
#[case(json!({"name": "Gadget", "price": 0, "sku": null}))]
#[tokio::test]
async fn create_then_get_returns_the_input(#[case] payload: Value) {
    let runtime = local_runtime().await;
    let tenant = Uuid::new_v4();
    let products = runtime.factory(member(tenant)).get_manager("Product").unwrap();

    let created = products.create(attrs(payload.clone())).await.unwrap();
    let fetched = products.get(created.id).await.unwrap();

    assert_eq!(fetched, created);
    assert_eq!(fetched.lsn, 1);
    assert_eq!(fetched.tenant_id, tenant);
    for (field, value) in attrs(payload) {
        assert_eq!(fetched.get(&field), Some(&value));
    }
    assert!(fetched.get("active").is_some());
}

#[tokio::test]
async fn example_scenario() {
    let runtime = local_runtime().await;
    let products = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();

    let x = products
        .create(attrs(json!({"name": "A", "price": 10})))
        .await
        .unwrap();
    assert_eq!(x.lsn, 1);

    let updated = products
        .update(x.id, attrs(json!({"price": 12})), Some(1))
        .await
        .unwrap();
    assert_eq!(updated.lsn, 2);
    assert_eq!(updated.get("price"), Some(&json!(12)));

    let stale = products
        .update(x.id, attrs(json!({"price": 15})), Some(1))
        .await
        .unwrap_err();
    assert!(matches!(
        stale,
        Error::Conflict { expected: 1, actual: 2, .. }
    ));

    products
        .create(attrs(json!({"name": "B", "price": 20})))
        .await
        .unwrap();

    let first = products.list(ListQuery::new().limit(1)).await.unwrap();
    assert_eq!(first.count, 1);
    let token = first.next_cursor.clone().expect("a second page exists");

    let second = products
        .list(ListQuery::new().limit(1).cursor(Some(token)))
        .await
        .unwrap();
    assert_eq!(second.count, 1);
    assert_ne!(second.items[0].id, first.items[0].id);
    assert_eq!(second.next_cursor, None);
}

#[tokio::test]
async fn stale_update_leaves_the_record_unchanged() {
    let runtime = local_runtime().await;
    let products = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();

    let record = products
        .create(attrs(json!({"name": "A", "price": 10})))
        .await
        .unwrap();
    let current = products
        .update(record.id, attrs(json!({"price": 11})), Some(1))
        .await
        .unwrap();

    assert!(products
        .update(record.id, attrs(json!({"name": "Z"})), Some(1))
        .await
        .is_err());
    assert_eq!(products.get(record.id).await.unwrap(), current);
}

#[tokio::test]
async fn update_without_changes_keeps_the_lsn() {
    let runtime = local_runtime().await;
    let tenant = Uuid::new_v4();
    let events = runtime.notifier().subscribe(SubscriberFilter::tenant(tenant));
    let products = runtime.factory(member(tenant)).get_manager("Product").unwrap();

    let record = products
        .create(attrs(json!({"name": "A", "price": 10})))
        .await
        .unwrap();
    let same = products
        .update(record.id, attrs(json!({"price": 10})), None)
        .await
        .unwrap();

    assert_eq!(same, record);
    assert_eq!(events.len(), 1);
}

#[rstest]
#[case(json!({"name": "A"}))]
#[case(json!({"name": "A", "price": "ten"}))]
#[case(json!({"name": "A", "price": 1, "colour": "red"}))]
#[case(json!({"name": null, "price": 1}))]
#[case(json!({"name": "x".repeat(101), "price": 1}))]
#[case(json!({"name": "A", "price": 1, "category_id": "not-a-uuid"}))]
#[tokio::test]
async fn invalid_payloads_are_rejected(#[case] payload: Value) {
    let runtime = local_runtime().await;
    let products = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();

    let err = products.create(attrs(payload)).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn unique_fields_are_unique_per_tenant() {
    let runtime = local_runtime().await;
    let first = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();
    let other_tenant = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();

    first
        .create(attrs(json!({"name": "A", "price": 1, "sku": "S-1"})))
        .await
        .unwrap();
    let err = first
        .create(attrs(json!({"name": "B", "price": 2, "sku": "S-1"})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Duplicate(ref msg) if msg.contains("sku")), "got {err:?}");

    other_tenant
        .create(attrs(json!({"name": "A", "price": 1, "sku": "S-1"})))
        .await
        .unwrap();
}

#[tokio::test]
async fn references_must_exist_in_the_same_tenant() {
    let runtime = local_runtime().await;
    let tenant = Uuid::new_v4();
    let factory = runtime.factory(member(tenant));
    let categories = factory.get_manager("Category").unwrap();
    let products = factory.get_manager("Product").unwrap();

    let category = categories
        .create(attrs(json!({"title": "Tools"})))
        .await
        .unwrap();
    products
        .create(attrs(json!({"name": "Hammer", "price": 9, "category_id": category.id})))
        .await
        .unwrap();

    let foreign = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Category")
        .unwrap()
        .create(attrs(json!({"title": "Elsewhere"})))
        .await
        .unwrap();
    let err = products
        .create(attrs(json!({"name": "Saw", "price": 9, "category_id": foreign.id})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn delete_removes_the_record() {
    let runtime = local_runtime().await;
    let products = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();
    let record = products
        .create(attrs(json!({"name": "A", "price": 1})))
        .await
        .unwrap();

    products.delete(record.id).await.unwrap();

    assert!(matches!(
        products.get(record.id).await,
        Err(Error::NotFound { id, .. }) if id == record.id
    ));
    assert!(matches!(
        products.delete(record.id).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn committed_mutations_are_published_in_lsn_order() {
    let runtime = local_runtime().await;
    let tenant = Uuid::new_v4();
    let mine = runtime.notifier().subscribe(SubscriberFilter::tenant(tenant));
    let theirs = runtime
        .notifier()
        .subscribe(SubscriberFilter::tenant(Uuid::new_v4()));
    let products = runtime.factory(member(tenant)).get_manager("Product").unwrap();

    let record = products
        .create(attrs(json!({"name": "A", "price": 1})))
        .await
        .unwrap();
    products
        .update(record.id, attrs(json!({"price": 2})), Some(1))
        .await
        .unwrap();
    products.delete(record.id).await.unwrap();
    // Failed mutations publish nothing
    let _ = products.create(attrs(json!({"name": "B"}))).await;

    let received: Vec<(LiveEventKind, Value)> = std::iter::from_fn(|| mine.try_recv())
        .map(|event| (event.event, event.payload["lsn"].clone()))
        .collect();
    assert_eq!(
        received,
        vec![
            (LiveEventKind::ModelCreated, json!(1)),
            (LiveEventKind::ModelUpdated, json!(2)),
            (LiveEventKind::ModelDeleted, json!(3)),
        ]
    );
    assert!(theirs.is_empty());
}

#[tokio::test]
async fn list_filters_and_search() {
    let runtime = local_runtime().await;
    let products = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();

    let mut ids = Vec::new();
    for (name, price, active) in [
        ("Red Hammer", 10.0, true),
        ("Blue Hammer", 12.0, false),
        ("Red Saw", 30.0, true),
        ("50%_off", 1.0, true),
    ] {
        let record = products
            .create(attrs(json!({"name": name, "price": price, "active": active})))
            .await
            .unwrap();
        ids.push(record.id);
    }

    let names = |page: unified_access::PaginatedResponse| -> Vec<String> {
        page.items
            .iter()
            .map(|r| r.get("name").and_then(Value::as_str).unwrap_or_default().to_string())
            .collect()
    };

    let hammers = products
        .list(ListQuery::new().filter(ListFilter::default().search("HAMMER")))
        .await
        .unwrap();
    assert_eq!(names(hammers), vec!["Red Hammer", "Blue Hammer"]);

    let active_red = products
        .list(
            ListQuery::new()
                .order(OrderBy::desc("price"))
                .filter(ListFilter::default().eq("active", json!(true)).search("red")),
        )
        .await
        .unwrap();
    assert_eq!(names(active_red), vec!["Red Saw", "Red Hammer"]);

    let literal = products
        .list(ListQuery::new().filter(ListFilter::default().search("%_")))
        .await
        .unwrap();
    assert_eq!(names(literal), vec!["50%_off"]);

    let mut by_id = ListFilter::default();
    by_id.id_in = Some(vec![ids[1], ids[3]]);
    let selected = products
        .list(ListQuery::new().order(OrderBy::asc("price")).filter(by_id))
        .await
        .unwrap();
    assert_eq!(names(selected), vec!["50%_off", "Blue Hammer"]);
}

#[tokio::test]
async fn list_rejects_bad_limits_orders_and_cursors() {
    let runtime = local_runtime().await;
    let products = runtime
        .factory(member(Uuid::new_v4()))
        .get_manager("Product")
        .unwrap();
    for price in [1, 2, 3] {
        products
            .create(attrs(json!({"name": "P", "price": price})))
            .await
            .unwrap();
    }

    for query in [
        ListQuery::new().limit(0),
        ListQuery::new().limit(501),
        ListQuery::new().order(OrderBy::asc("active")),
        ListQuery::new().cursor(Some("garbage".to_string())),
        ListQuery::new().filter(ListFilter::default().eq("colour", json!("red"))),
    ] {
        let err = products.list(query).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err:?}");
    }

    let page = products
        .list(ListQuery::new().limit(1).order(OrderBy::asc("price")))
        .await
        .unwrap();
    let err = products
        .list(
            ListQuery::new()
                .limit(1)
                .order(OrderBy::desc("price"))
                .cursor(page.next_cursor),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn permissions_are_enforced_per_action() {
    let runtime = local_runtime().await;
    let tenant = Uuid::new_v4();
    let record = runtime
        .factory(member(tenant))
        .get_manager("Product")
        .unwrap()
        .create(attrs(json!({"name": "A", "price": 1})))
        .await
        .unwrap();

    let reader = runtime
        .factory(RequestContext::new(Principal::member(tenant, ["product:read"])))
        .get_manager("Product")
        .unwrap();
    assert_eq!(reader.get(record.id).await.unwrap().id, record.id);
    assert!(matches!(
        reader.delete(record.id).await,
        Err(Error::PermissionDenied(_))
    ));
    assert!(matches!(
        reader.create(attrs(json!({"name": "B", "price": 1}))).await,
        Err(Error::PermissionDenied(_))
    ));

    let mut homeless = Principal::member(tenant, ["*"]);
    homeless.tenant_id = None;
    let homeless = runtime
        .factory(RequestContext::new(homeless))
        .get_manager("Product")
        .unwrap();
    assert!(matches!(
        homeless.list(ListQuery::new()).await,
        Err(Error::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn unknown_models_are_configuration_errors() {
    let runtime = local_runtime().await;
    let factory = runtime.factory(member(Uuid::new_v4()));

    assert!(matches!(
        factory.get_manager("Ghost"),
        Err(Error::ConfigurationError(_))
    ));
    assert!(factory.get_manager("product").unwrap().is_local());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_on_a_pooled_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::in_memory();
    config.database = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("records.db").display()),
        pool_size: Some(8),
        timeout_seconds: Some(10),
    };
    let runtime = open_runtime(config, local_registry()).await;
    let tenant = Uuid::new_v4();
    let factory = runtime.factory(member(tenant));

    let category_id = factory
        .get_manager("Category")
        .unwrap()
        .create(attrs(json!({"title": "Lamps"})))
        .await
        .unwrap()
        .id;
    let creates: Vec<_> = (0..16)
        .map(|i| {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                let products = runtime.factory(member(tenant)).get_manager("Product")?;
                let payload = json!({
                    "name": format!("P{}", i),
                    "price": i,
                    "category_id": category_id.to_string(),
                });
                products.create(attrs(payload)).await
            })
        })
        .collect();
    for create in creates {
        create.await.unwrap().unwrap();
    }

    let products = factory.get_manager("Product").unwrap();
    let target = products
        .create(attrs(json!({"name": "Contended", "price": 1})))
        .await
        .unwrap()
        .id;
    let updates: Vec<_> = (0..16)
        .map(|i| {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                let products = runtime.factory(member(tenant)).get_manager("Product")?;
                products
                    .update(target, attrs(json!({"price": 100 + i})), Some(1))
                    .await
            })
        })
        .collect();

    let mut applied = 0;
    for update in updates {
        match update.await.unwrap() {
            Ok(record) => {
                assert_eq!(record.lsn, 2);
                applied += 1;
            }
            Err(Error::Conflict {
                expected, actual, ..
            }) => assert_eq!((expected, actual), (1, 2)),
            Err(other) => panic!("expected Conflict, got {other:?}"),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(products.get(target).await.unwrap().lsn, 2);
    assert_eq!(
        products
            .list(ListQuery::new().limit(100))
            .await
            .unwrap()
            .count,
        17
    );
}
