//! Clearing REST surface

use crate::{
    routing::{NewRoute, RouteUpdate, RoutingTable},
    Error, Result,
};
use actix_web::{web, HttpResponse, Responder};
use ledger_core::{storage::Storage, types::RoutingHandle};
use serde_json::json;
use std::sync::Arc;
use transfer_saga::api::{parse_transaction_id, HealthResponse};

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    /// Clearing store
    pub storage: Arc<Storage>,
    /// Routing table
    pub routing: RoutingTable,
}

/// Register the clearing routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(prometheus_metrics))
        .route("/clearing/bank-mapping", web::post().to(create_mapping))
        .route("/clearing/bank-mapping", web::get().to(list_mappings))
        .route("/clearing/bank-mapping/{handle}", web::get().to(get_mapping))
        .route("/clearing/bank-mapping/{handle}", web::put().to(update_mapping))
        .route("/clearing/bank-mapping/{handle}", web::delete().to(delete_mapping))
        .route("/clearing/transaction/{id}", web::get().to(get_transaction));
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        service: "clearing-node".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn prometheus_metrics(state: web::Data<AppState>) -> impl Responder {
    let mut body = state.storage.metrics().render();
    body.push_str(&message_bus::metrics::render());
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}

async fn create_mapping(
    state: web::Data<AppState>,
    body: web::Json<NewRoute>,
) -> Result<HttpResponse> {
    let entry = state.routing.register(body.into_inner())?;
    Ok(HttpResponse::Created().json(entry))
}

async fn list_mappings(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.routing.list()?))
}

async fn get_mapping(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let handle = RoutingHandle::new(path.into_inner());
    let entry = state
        .routing
        .resolve(&handle)?
        .ok_or_else(|| Error::RoutingNotFound(handle.to_string()))?;
    Ok(HttpResponse::Ok().json(entry))
}

async fn update_mapping(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<RouteUpdate>,
) -> Result<HttpResponse> {
    let handle = RoutingHandle::new(path.into_inner());
    let entry = state
        .routing
        .update(&handle, body.into_inner())?
        .ok_or_else(|| Error::RoutingNotFound(handle.to_string()))?;
    Ok(HttpResponse::Ok().json(entry))
}

async fn delete_mapping(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let handle = RoutingHandle::new(path.into_inner());
    if state.routing.remove(&handle)? {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(Error::RoutingNotFound(handle.to_string()))
    }
}

async fn get_transaction(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let id = parse_transaction_id(&path).map_err(|e| Error::Validation(e.to_string()))?;
    let row = state
        .storage
        .outgoing(&id)?
        .ok_or_else(|| Error::TransactionNotFound(id.to_string()))?;
    let events = state.storage.outbox_for_transaction(&id)?;
    Ok(HttpResponse::Ok().json(json!({
        "transaction": row,
        "events": events,
    })))
}
