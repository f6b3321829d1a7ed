//! HTTP surface: thin request/response mapping onto the trade service.

use crate::errors::EngineError;
use crate::hub::PriceFeedHub;
use crate::liquidity::ForecastSpread;
use crate::lmsr::Side;
use crate::service::{LiquidityRequest, Portfolio, PriceQuote, TradeResponse, TradeService};
use crate::store::{LedgerEntry, Market};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{MatchedPath, Path, Query, Request, State, WebSocketUpgrade};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-frame write deadline for live subscribers.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Liveness ping cadence and the grace before a silent subscriber is closed.
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_GRACE: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TradeService>,
    pub hub: Arc<PriceFeedHub>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    use tower_http::cors::CorsLayer;
    use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
    use tower_http::timeout::TimeoutLayer;
    use tower_http::trace::TraceLayer;

    let api = Router::new()
        .route("/markets", get(list_markets).post(create_market))
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/price", get(get_price))
        .route("/markets/:id/history", get(get_history))
        .route("/trade", post(execute_trade))
        .route("/portfolio/:user_id", get(get_portfolio));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/ws", get(ws_handler))
        .nest("/api/v1", api)
        // Layers are applied in reverse here since each `.layer()` call wraps
        // the previous one on the outside; this reproduces the same
        // outermost-to-innermost order as the original ServiceBuilder stack:
        // answer_preflight, Cors, Timeout, SetRequestId, Trace,
        // PropagateRequestId, track_requests (innermost).
        .layer(middleware::from_fn(track_requests))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(answer_preflight))
        .with_state(state)
}

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    // Route template, not the raw path, to keep label cardinality bounded.
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let started = Instant::now();
    let response = next.run(req).await;

    metrics::increment_counter!(
        "http_requests_total",
        "method" => method,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    );
    metrics::histogram!(
        "http_request_duration_seconds",
        started.elapsed().as_secs_f64()
    );
    response
}

async fn answer_preflight(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        let any = HeaderValue::from_static("*");
        headers.insert("access-control-allow-origin", any.clone());
        headers.insert("access-control-allow-methods", any.clone());
        headers.insert("access-control-allow-headers", any);
        return response;
    }
    next.run(req).await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "market-engine" }))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

#[derive(Debug, Deserialize)]
struct ListMarketsQuery {
    h3_cell: Option<String>,
}

async fn list_markets(
    State(state): State<AppState>,
    Query(query): Query<ListMarketsQuery>,
) -> Result<Json<Vec<Market>>, EngineError> {
    let markets = state
        .service
        .list_markets(query.h3_cell.as_deref())
        .await?;
    Ok(Json(markets))
}

#[derive(Debug, Deserialize)]
struct ForecastBody {
    p25: Decimal,
    p50: Decimal,
    p75: Decimal,
    base_volume: Decimal,
}

#[derive(Debug, Deserialize)]
struct CreateMarketBody {
    contract_id: String,
    /// Missing or non-positive falls back to forecast-derived or default liquidity.
    #[serde(default)]
    b: Decimal,
    #[serde(default)]
    forecast: Option<ForecastBody>,
}

async fn create_market(
    State(state): State<AppState>,
    Json(body): Json<CreateMarketBody>,
) -> Result<(StatusCode, Json<Market>), EngineError> {
    let forecast = body
        .forecast
        .map(|f| {
            Ok::<_, EngineError>(LiquidityRequest {
                spread: ForecastSpread::new(f.p25, f.p50, f.p75)?,
                base_volume: f.base_volume,
            })
        })
        .transpose()?;

    let market = state
        .service
        .create_market(&body.contract_id, body.b, forecast)
        .await?;
    Ok((StatusCode::CREATED, Json(market)))
}

async fn get_market(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Market>, EngineError> {
    Ok(Json(state.service.get_market(id).await?))
}

async fn get_price(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PriceQuote>, EngineError> {
    Ok(Json(state.service.get_price(id).await?))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LedgerEntry>>, EngineError> {
    Ok(Json(state.service.get_market_history(id).await?))
}

#[derive(Debug, Deserialize)]
struct TradeBody {
    user_id: String,
    contract_id: String,
    side: String,
    quantity: Decimal,
}

async fn execute_trade(
    State(state): State<AppState>,
    Json(body): Json<TradeBody>,
) -> Result<Json<TradeResponse>, EngineError> {
    let side = Side::parse(&body.side)?;
    let response = state
        .service
        .execute_trade(&body.user_id, &body.contract_id, side, body.quantity)
        .await?;
    Ok(Json(response))
}

async fn get_portfolio(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Portfolio>, EngineError> {
    Ok(Json(state.service.get_portfolio(&user_id).await?))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| subscriber_connection(socket, state.hub))
}

/// Owns one live-subscriber socket: forwards hub frames under a write
/// deadline, pings every 30 s, and closes after 60 s without a pong. The
/// read half exists only to observe pongs and disconnects.
async fn subscriber_connection(socket: WebSocket, hub: Arc<PriceFeedHub>) {
    let (id, mut frames) = hub.subscribe();
    let (mut sink, mut stream) = socket.split();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(frame))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            _ = ping.tick() => {
                if last_pong.elapsed() > PONG_GRACE {
                    tracing::debug!(subscriber = id, "no pong within grace, closing");
                    break;
                }
                match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.unsubscribe(id);
}
