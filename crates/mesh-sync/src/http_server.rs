//! HTTP JSON-RPC Server
//!
//! Status and trading endpoint for dashboards and scripts. Every call goes
//! through the node task, so answers reflect a consistent view.

use crate::error::RpcError;
use crate::node::NodeHandle;
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use mesh_types::Side;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

const DEFAULT_TRADE_LIMIT: usize = 20;

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderParams {
    side: Side,
    trader: String,
    asset: String,
    quantity: u64,
    price: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrderParams {
    order_id: String,
    trader: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageParams {
    content: String,
    sender: String,
}

#[derive(Debug, Default, Deserialize)]
struct AssetParams {
    #[serde(default)]
    asset: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// HTTP RPC Server
pub struct HttpRpcServer {
    node: NodeHandle,
}

impl HttpRpcServer {
    pub fn new(node: NodeHandle) -> Self {
        Self { node }
    }

    pub fn router(self) -> Router {
        // CORS layer to allow browser clients
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/", post(handle_rpc))
            .layer(cors)
            .with_state(self.node)
    }

    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP RPC server listening on {}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn handle_rpc(State(node): State<NodeHandle>, Json(request): Json<JsonRpcRequest>) -> impl IntoResponse {
    let result = dispatch_method(&node, &request.method, request.params).await;

    let response = match result {
        Ok(value) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: Some(value),
            error: None,
        },
        Err(e) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: None,
            error: Some(JsonRpcError {
                code: error_code(&e),
                message: e.to_string(),
            }),
        },
    };

    (StatusCode::OK, Json(response))
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn to_json<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}

/// Dispatch to the node
pub async fn dispatch_method(node: &NodeHandle, method: &str, params: Value) -> Result<Value, RpcError> {
    tracing::debug!("RPC method called: {}", method);
    match method {
        "getStatus" => to_json(node.status().await?),

        "getLatestBlock" => to_json(node.latest_block().await?),

        "getOrderBook" => {
            let params: AssetParams = if params.is_null() { AssetParams::default() } else { parse(params)? };
            to_json(node.order_book(params.asset).await?)
        }

        "getRecentTrades" => {
            let params: AssetParams = if params.is_null() { AssetParams::default() } else { parse(params)? };
            let limit = params.limit.unwrap_or(DEFAULT_TRADE_LIMIT);
            to_json(node.recent_trades(params.asset, limit).await?)
        }

        "getEnterpriseBook" => {
            let params: AssetParams = parse(params)?;
            let asset = params
                .asset
                .ok_or_else(|| RpcError::InvalidParams("Missing asset".to_string()))?;
            to_json(node.enterprise_book(asset).await?)
        }

        "placeOrder" => {
            let p: PlaceOrderParams = parse(params)?;
            let placement = node
                .place_order(p.side, p.trader, p.asset, p.quantity, p.price)
                .await?;
            to_json(placement)
        }

        "cancelOrder" => {
            let p: CancelOrderParams = parse(params)?;
            let cancelled = node.cancel_order(p.order_id, p.trader).await?;
            Ok(json!({ "cancelled": cancelled }))
        }

        "sendMessage" => {
            let p: SendMessageParams = parse(params)?;
            let id = node.send_message(p.content, p.sender).await?;
            Ok(json!({ "transactionId": id }))
        }

        "forceElection" => {
            let term = node.force_election().await?;
            Ok(json!({ "term": term }))
        }

        "getHealth" => Ok(json!("ok")),

        "getVersion" => Ok(json!({ "mesh-node": env!("CARGO_PKG_VERSION") })),

        _ => Err(RpcError::MethodNotFound(method.to_string())),
    }
}

/// Map error to JSON-RPC error code
fn error_code(error: &RpcError) -> i32 {
    match error {
        RpcError::InvalidParams(_) => -32602,
        RpcError::MethodNotFound(_) => -32601,
        RpcError::InternalError(_) => -32603,
    }
}
