//! Bank REST surface

use crate::{origin::OriginSaga, origin::TransferRequest, Error, Result};
use actix_web::{web, HttpResponse, Responder};
use ledger_core::{
    types::{AccountNumber, TransactionId},
    Ledger,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    /// Account operations
    pub ledger: Ledger,
    /// Transfer submission
    pub origin: OriginSaga,
}

/// Service health
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "healthy" while serving
    pub status: String,
    /// Service name
    pub service: String,
    /// Crate version
    pub version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenAccountRequest {
    account_number: AccountNumber,
    holder: String,
    #[serde(default)]
    initial_balance: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAccountRequest {
    holder: String,
}

#[derive(Debug, Deserialize)]
struct AmountQuery {
    amount: Decimal,
}

/// Register the bank routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/metrics", web::get().to(prometheus_metrics))
        .route("/bank/account", web::post().to(open_account))
        .route("/bank/account", web::get().to(list_accounts))
        .route("/bank/account/{number}", web::get().to(get_account))
        .route("/bank/account/{number}", web::put().to(update_account))
        .route("/bank/account/{number}", web::delete().to(close_account))
        .route("/bank/account/{number}/{op}", web::post().to(account_operation))
        .route("/bank/transaction/outgoing", web::post().to(submit_transfer))
        .route("/bank/transaction/outgoing/{id}", web::get().to(get_outgoing))
        .route("/bank/transaction/incoming/{id}", web::get().to(get_incoming));
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        service: "bank-node".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn prometheus_metrics(state: web::Data<AppState>) -> impl Responder {
    let mut body = state.ledger.storage().metrics().render();
    body.push_str(&message_bus::metrics::render());
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body)
}

async fn open_account(
    state: web::Data<AppState>,
    body: web::Json<OpenAccountRequest>,
) -> Result<HttpResponse> {
    let request = body.into_inner();
    let account = state.ledger.open_account(
        request.account_number,
        &request.holder,
        request.initial_balance.unwrap_or(Decimal::ZERO),
    )?;
    Ok(HttpResponse::Created().json(account))
}

async fn list_accounts(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.ledger.accounts()?))
}

async fn get_account(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let number = AccountNumber::new(path.into_inner());
    Ok(HttpResponse::Ok().json(state.ledger.account(&number)?))
}

async fn update_account(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UpdateAccountRequest>,
) -> Result<HttpResponse> {
    let number = AccountNumber::new(path.into_inner());
    let holder = body.into_inner().holder;
    if holder.trim().is_empty() {
        return Err(Error::Validation("holder must not be blank".to_string()));
    }
    Ok(HttpResponse::Ok().json(state.ledger.update_holder(&number, &holder)?))
}

async fn close_account(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let number = AccountNumber::new(path.into_inner());
    state.ledger.close_account(&number)?;
    Ok(HttpResponse::NoContent().finish())
}

async fn account_operation(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<AmountQuery>,
) -> Result<HttpResponse> {
    let (number, op) = path.into_inner();
    let number = AccountNumber::new(number);
    let amount = query.amount;

    let account = match op.as_str() {
        "deposit" => state.ledger.deposit(&number, amount)?,
        "reserve" => state.ledger.reserve(&number, amount)?,
        "commit" => state.ledger.commit(&number, amount)?,
        "release" => state.ledger.release(&number, amount)?,
        other => return Err(Error::NotFound(format!("account operation {}", other))),
    };
    Ok(HttpResponse::Ok().json(account))
}

async fn submit_transfer(
    state: web::Data<AppState>,
    body: web::Json<TransferRequest>,
) -> Result<HttpResponse> {
    let receipt = state.origin.submit(body.into_inner())?;
    Ok(HttpResponse::Accepted().json(receipt))
}

async fn get_outgoing(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let id = parse_transaction_id(&path)?;
    let tx = state
        .ledger
        .storage()
        .outgoing(&id)?
        .ok_or_else(|| Error::NotFound(format!("outgoing transaction {}", id)))?;
    Ok(HttpResponse::Ok().json(tx))
}

async fn get_incoming(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let id = parse_transaction_id(&path)?;
    let tx = state
        .ledger
        .storage()
        .incoming(&id)?
        .ok_or_else(|| Error::NotFound(format!("incoming transaction {}", id)))?;
    Ok(HttpResponse::Ok().json(tx))
}

/// Parse a path segment as a transaction id
pub fn parse_transaction_id(raw: &str) -> Result<TransactionId> {
    raw.parse()
        .map_err(|e| Error::Validation(format!("invalid transaction id {}: {}", raw, e)))
}
