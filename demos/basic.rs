//! Minimal sluice example: a small user store, a transaction layer and health
//! checks.
//!
//! Run with:
//!   SLUICE_VERBOSE=true cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/1
//!   curl http://localhost:3000/users/abc            # 400, validation
//!   curl http://localhost:3000/users/9              # 404, declared error
//!   curl -X POST http://localhost:3000/users \
//!        -H 'content-type: application/json' \
//!        -d '{"name":"alice","password":"hunter2"}'
//!   curl -X DELETE http://localhost:3000/users/1    # 403 without a token
//!   curl -X DELETE http://localhost:3000/users/1 -H 'x-token: admin'
//!   curl http://localhost:3000/readyz

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use sluice::capability::{self, Capabilities, Requirements};
use sluice::config::ServerConfig;
use sluice::{
    AppState, Ctx, DeclaredError, Endpoint, HandlerError, Method, RequestContext, Router, Server, StatusMapping,
    health, schema,
};

#[derive(Default)]
struct Users(Mutex<BTreeMap<i64, String>>);

/// Per-request unit of work, opened by the `transaction` layer.
struct Tx {
    request_id: String,
}

#[derive(Deserialize)]
struct ById {
    id: i64,
}

#[derive(Deserialize)]
struct CreateUser {
    name: String,
}

// GET /users/{id}
async fn get_user(ctx: Ctx) -> Result<Value, HandlerError> {
    let ById { id } = ctx.parse()?;
    let users = ctx.get::<Users>()?;
    let name = users.0.lock().get(&id).cloned();
    match name {
        Some(name) => Ok(json!({ "id": id, "name": name })),
        None => Err(DeclaredError::not_found("User", &json!(id)).into()),
    }
}

// POST /users
async fn create_user(ctx: Ctx) -> Result<Value, HandlerError> {
    let CreateUser { name } = ctx.parse()?;
    let users = ctx.get::<Users>()?;
    let mut users = users.0.lock();
    let id = users.keys().next_back().map_or(1, |last| last + 1);
    users.insert(id, name.clone());
    tracing::info!(id, "created user");
    Ok(json!({ "id": id, "name": name }))
}

// DELETE /users/{id}
async fn delete_user(ctx: Ctx) -> Result<(), HandlerError> {
    let ById { id } = ctx.parse()?;
    if ctx.input().header("x-token").and_then(Value::as_str) != Some("admin") {
        return Err(DeclaredError::unauthorized("admin token required").into());
    }
    let tx = ctx.get::<Tx>()?;
    tracing::info!(tx = %tx.request_id, id, "deleting user");
    let users = ctx.get::<Users>()?;
    if users.0.lock().remove(&id).is_none() {
        return Err(DeclaredError::not_found("User", &json!(id)).into());
    }
    Ok(())
}

fn user_schema() -> schema::Object {
    schema::object().field("id", schema::integer()).field("name", schema::string())
}

#[tokio::main]
async fn main() -> Result<(), sluice::Error> {
    let config = ServerConfig::load(None)?;
    sluice::logging::init(&config.logging);

    let users = Users::default();
    users.0.lock().insert(1, "ann".to_owned());

    let transaction = capability::layer_fn(
        Requirements::new().with::<RequestContext>(),
        Requirements::new().with::<Tx>(),
        |caps: Capabilities| async move {
            let request_id = caps
                .get::<RequestContext>()
                .map(|ctx| ctx.request_id().to_owned())
                .ok_or_else(|| DeclaredError::service_unavailable("no request context"))?;
            Ok(Capabilities::new().with(Tx { request_id }))
        },
    );

    let app = Router::new(
        AppState::new()
            .error_handler(StatusMapping::new())
            .provide(Arc::new(users)),
    )
    .route(
        Method::Get,
        "/users/{id}",
        Endpoint::builder("getUser")
            .path("id", schema::integer())
            .requires::<Users>()
            .response(user_schema())
            .handler(get_user)?,
    )?
    .route(
        Method::Post,
        "/users",
        Endpoint::builder("createUser")
            .body("name", schema::string().min_len(1).max_len(255))
            .body("password", schema::optional(schema::string()))
            .requires::<Users>()
            .response(user_schema())
            .handler(create_user)?,
    )?
    .route(
        Method::Delete,
        "/users/{id}",
        Endpoint::builder("deleteUser")
            .path("id", schema::integer())
            .header("x-token", schema::optional(schema::string()))
            .requires::<Users>()
            .requires::<Tx>()
            .layer(transaction)
            .handler(delete_user)?,
    )?
    .route(Method::Get, "/healthz", health::liveness()?)?
    .route(Method::Get, "/readyz", health::readiness()?)?;

    Server::from_config(&config)?.serve(app).await
}
