//! User-facing API. HTTP Basic auth; JSON in, JSON out; every ledger error
//! surfaces as 503 with the structured error body.

use super::{basic_credentials, error_response, unavailable, GateGuard, RestState};
use actix_web::{
    dev::Server,
    web::{self, Data, Json, Path, Query},
    App, HttpRequest, HttpResponse, HttpServer,
};
use casualchain_common::{
    api::{
        BlockQueryOptions, CombinedQueryOptions, HistoryOptions, JsonQueryOptions,
        LastBlockOptions, OidQueryOptions, PoolQueryOptions, PostTxResponse,
        TotalNumberResponse,
    },
    transaction::ObjectId,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Payload ceiling: a 15 MiB tx plus envelope must pass the transport so
/// the ledger can reject it with a positioned Validation error.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub fn start_user_api(state: Arc<RestState>, port: u16) -> std::io::Result<Server> {
    let data = Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(MAX_BODY_BYTES))
            .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
            .route("/get/byjson", web::get().to(get_byjson))
            .route("/get/byoid/{oid}", web::get().to(get_byoid))
            .route("/get/alltxs", web::get().to(get_alltxs))
            .route("/get/pooling", web::get().to(get_pooling))
            .route("/get/poolingdelivered", web::get().to(get_pooling_delivered))
            .route("/get/blocked", web::get().to(get_blocked))
            .route("/get/lastblock", web::get().to(get_lastblock))
            .route("/get/totalnumber", web::get().to(get_totalnumber))
            .route("/get/history/{oid}", web::get().to(get_history))
            .route("/post/byjson", web::post().to(post_byjson))
    })
    .bind(("0.0.0.0", port))?
    .run();
    Ok(server)
}

async fn authorize<'a>(
    state: &'a Data<Arc<RestState>>,
    req: &HttpRequest,
    api: &str,
) -> Result<GateGuard<'a>, HttpResponse> {
    let Some(guard) = state.gate.enter() else {
        return Err(unavailable(api));
    };
    let rest = state.ctx.conf.current().await.rest;
    match basic_credentials(req) {
        Some((user, password))
            if user == rest.userapi_user && password == rest.userapi_password =>
        {
            Ok(guard)
        }
        Some(_) => Err(HttpResponse::Forbidden().finish()),
        None => Err(HttpResponse::Unauthorized().finish()),
    }
}

fn parse_oid(raw: &str) -> Result<ObjectId, HttpResponse> {
    ObjectId::from_hex(raw).map_err(|e| {
        HttpResponse::BadRequest().json(serde_json::json!({ "detail": e.to_string() }))
    })
}

#[derive(Deserialize)]
struct TenantQuery {
    #[serde(default)]
    tenant: Option<String>,
}

async fn get_byjson(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    body: Json<JsonQueryOptions>,
) -> HttpResponse {
    const API: &str = "user/get/byjson";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.ledger.get_search_by_json(&state.ctx, &body).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response(API, &e),
    }
}

async fn get_byoid(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    path: Path<String>,
    query: Query<OidQueryOptions>,
) -> HttpResponse {
    const API: &str = "user/get/byoid";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let oid = match parse_oid(&path) {
        Ok(oid) => oid,
        Err(resp) => return resp,
    };
    match state
        .ctx
        .ledger
        .get_search_by_oid(&state.ctx, &oid, &query)
        .await
    {
        Ok(Some(found)) => HttpResponse::Ok().json(found),
        Ok(None) => HttpResponse::Ok().json(Value::Null),
        Err(e) => error_response(API, &e),
    }
}

async fn get_alltxs(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    query: Query<CombinedQueryOptions>,
) -> HttpResponse {
    const API: &str = "user/get/alltxs";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.ledger.get_all(&state.ctx, &query).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response(API, &e),
    }
}

async fn get_pooling(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    query: Query<PoolQueryOptions>,
) -> HttpResponse {
    const API: &str = "user/get/pooling";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.ledger.get_all_pool(&state.ctx, &query).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response(API, &e),
    }
}

async fn get_pooling_delivered(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    query: Query<PoolQueryOptions>,
) -> HttpResponse {
    const API: &str = "user/get/poolingdelivered";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state
        .ctx
        .ledger
        .get_all_delivered_pool(&state.ctx, &query)
        .await
    {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response(API, &e),
    }
}

async fn get_blocked(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    query: Query<BlockQueryOptions>,
) -> HttpResponse {
    const API: &str = "user/get/blocked";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.ledger.get_all_block(&state.ctx, &query).await {
        Ok(rows) => HttpResponse::Ok().json(rows),
        Err(e) => error_response(API, &e),
    }
}

async fn get_lastblock(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    query: Query<LastBlockOptions>,
) -> HttpResponse {
    const API: &str = "user/get/lastblock";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.ledger.get_last_block(&state.ctx, &query).await {
        Ok(block) => HttpResponse::Ok().json(block),
        Err(e) => error_response(API, &e),
    }
}

async fn get_totalnumber(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    query: Query<TenantQuery>,
) -> HttpResponse {
    const API: &str = "user/get/totalnumber";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state
        .ctx
        .ledger
        .get_transaction_height(&state.ctx, query.tenant.as_deref())
        .await
    {
        Ok(total) => HttpResponse::Ok().json(TotalNumberResponse { total }),
        Err(e) => error_response(API, &e),
    }
}

async fn get_history(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    path: Path<String>,
    query: Query<HistoryOptions>,
) -> HttpResponse {
    const API: &str = "user/get/history";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    let oid = match parse_oid(&path) {
        Ok(oid) => oid,
        Err(resp) => return resp,
    };
    match state
        .ctx
        .ledger
        .get_history_by_oid(&state.ctx, &oid, query.tenant.as_deref())
        .await
    {
        Ok(history) => HttpResponse::Ok().json(history),
        Err(e) => error_response(API, &e),
    }
}

async fn post_byjson(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    body: Json<Value>,
) -> HttpResponse {
    const API: &str = "user/post/byjson";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.ledger.post_by_json(&state.ctx, &body).await {
        Ok(id) => HttpResponse::Ok().json(PostTxResponse { id }),
        Err(e) => error_response(API, &e),
    }
}
