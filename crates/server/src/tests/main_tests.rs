use super::*;
use axum::{body, body::Body, http::Request};
use persist::MemoryPersist;
use serde_json::json;
use shared::{domain::Origin, protocol::EventKind};
use tower::ServiceExt;

fn test_app() -> (Router, Arc<AppState>) {
    let persist = Arc::new(MemoryPersist::new());
    let engine = Arc::new(Engine::new(EngineConfig::default(), persist));
    let (events, _) = broadcast::channel(32);
    let sender = events.clone();
    engine.subscribe(Box::new(move |event| {
        let _ = sender.send(event.clone());
        Ok(())
    }));
    let state = Arc::new(AppState {
        engine,
        events,
        default_locator: "./tunables.toml".into(),
    });
    (build_router(state.clone()), state)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn register_hero(app: &Router) {
    let request = post_json(
        "/registrations",
        json!({
            "id": "hero",
            "locator": "src/Hero.tsx",
            "defaults": [
                { "key": "padding", "value": 60 },
                { "key": "accent", "value": "#3b82f6" }
            ]
        }),
    );
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _state) = test_app();
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"ok");
}

#[tokio::test]
async fn register_update_and_poll_round_trip() {
    let (app, _state) = test_app();
    register_hero(&app).await;

    let update = post_json(
        "/values/update",
        json!({
            "registration_id": "hero",
            "key": "padding",
            "value": 80,
            "origin": "agent"
        }),
    );
    let response = app.clone().oneshot(update).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let event = json_body(response).await;
    assert_eq!(event["kind"], "value-changed");
    assert_eq!(event["origin"], "agent");

    let request = Request::get("/events?after=0")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let tail = json_body(response).await;
    let kinds: Vec<&str> = tail["events"]
        .as_array()
        .expect("events")
        .iter()
        .map(|event| event["kind"].as_str().expect("kind"))
        .collect();
    assert_eq!(kinds, vec!["registration-added", "value-changed"]);
    assert_eq!(tail["latest_sequence"], 2);

    let request = Request::get("/registrations/hero")
        .body(Body::empty())
        .expect("request");
    let snapshot = json_body(app.oneshot(request).await.expect("response")).await;
    assert_eq!(snapshot["has_unsaved_changes"], true);
}

#[tokio::test]
async fn idempotent_update_returns_null_event() {
    let (app, _state) = test_app();
    register_hero(&app).await;

    let update = post_json(
        "/values/update",
        json!({
            "registration_id": "hero",
            "key": "padding",
            "value": 60,
            "origin": "human"
        }),
    );
    let response = app.oneshot(update).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::Value::Null);
}

#[tokio::test]
async fn unknown_registration_maps_to_404() {
    let (app, _state) = test_app();
    let update = post_json(
        "/values/update",
        json!({
            "registration_id": "ghost",
            "key": "padding",
            "value": 1,
            "origin": "human"
        }),
    );
    let response = app.oneshot(update).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error = json_body(response).await;
    assert_eq!(error["code"], "not_found");
}

#[tokio::test]
async fn suggestion_routes_enforce_single_resolution() {
    let (app, _state) = test_app();
    register_hero(&app).await;

    let create = post_json(
        "/suggestions",
        json!({
            "registration_id": "hero",
            "key": "padding",
            "value": 72,
            "reason": "align to 8px grid"
        }),
    );
    let suggestion = json_body(app.clone().oneshot(create).await.expect("response")).await;
    assert_eq!(suggestion["status"], "pending");
    let id = suggestion["id"].as_str().expect("id").to_string();

    let resolve = post_json(
        &format!("/suggestions/{id}/resolve"),
        json!({ "outcome": "accepted" }),
    );
    let response = app.clone().oneshot(resolve).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "accepted");

    let resolve_again = post_json(
        &format!("/suggestions/{id}/resolve"),
        json!({ "outcome": "rejected" }),
    );
    let response = app.clone().oneshot(resolve_again).await.expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let request = Request::get("/suggestions?status=accepted")
        .body(Body::empty())
        .expect("request");
    let listed = json_body(app.oneshot(request).await.expect("response")).await;
    assert_eq!(listed.as_array().expect("list").len(), 1);
}

#[tokio::test]
async fn save_all_reports_partial_failures_over_the_wire() {
    let persist = Arc::new(MemoryPersist::new());
    let engine = Arc::new(Engine::new(EngineConfig::default(), persist.clone()));
    let (events, _) = broadcast::channel(32);
    let app = build_router(Arc::new(AppState {
        engine: engine.clone(),
        events,
        default_locator: "./tunables.toml".into(),
    }));
    register_hero(&app).await;

    engine
        .update_value(
            &RegistrationId::new("hero"),
            "padding",
            json!(80),
            Origin::Human,
        )
        .expect("update");
    engine
        .update_value(
            &RegistrationId::new("hero"),
            "accent",
            json!("#ef4444"),
            Origin::Human,
        )
        .expect("update");
    persist.fail_key("hero", "accent");

    let response = app
        .oneshot(post_json("/values/save-all", json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let report = json_body(response).await;
    assert_eq!(report["saved_count"], 1);
    assert_eq!(report["failures"].as_array().expect("failures").len(), 1);
    assert_eq!(report["failures"][0]["key"], "accent");
}

#[tokio::test]
async fn undo_route_reverts_the_last_edit() {
    let (app, _state) = test_app();
    register_hero(&app).await;
    let update = post_json(
        "/values/update",
        json!({
            "registration_id": "hero",
            "key": "padding",
            "value": 90,
            "origin": "human"
        }),
    );
    app.clone().oneshot(update).await.expect("response");

    let response = app
        .clone()
        .oneshot(post_json("/history/undo", json!({})))
        .await
        .expect("response");
    let entry = json_body(response).await;
    assert_eq!(entry["old_value"], 60);
    assert_eq!(entry["new_value"], 90);

    let request = Request::get("/registrations/hero")
        .body(Body::empty())
        .expect("request");
    let snapshot = json_body(app.oneshot(request).await.expect("response")).await;
    assert_eq!(snapshot["properties"][0]["current_value"], 60);
}

#[tokio::test]
async fn long_poll_with_short_wait_returns_empty() {
    let (app, state) = test_app();
    let after = state.engine.latest_sequence();

    let request = Request::get(format!("/events?after={after}&wait_ms=20"))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    let tail = json_body(response).await;
    assert_eq!(tail["events"].as_array().expect("events").len(), 0);
}

#[tokio::test]
async fn broadcast_bridge_receives_committed_events() {
    let (app, state) = test_app();
    let mut rx = state.events.subscribe();
    register_hero(&app).await;

    let event = rx.try_recv().expect("bridged event");
    assert_eq!(event.kind, EventKind::RegistrationAdded);
}
