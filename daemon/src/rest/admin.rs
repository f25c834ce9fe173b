//! Administration API. `/sys/login` exchanges credentials for an opaque
//! token signed with the node key; every other route requires it as a
//! bearer token and maps 1:1 onto a system flow.

use super::{bearer_token, error_response, unavailable, GateGuard, RestState};
use actix_web::{
    dev::Server,
    web::{self, Data, Json, Path},
    App, HttpRequest, HttpResponse, HttpServer,
};
use casualchain_common::{
    api::{LoginRequest, LoginResponse},
    time::get_current_time_in_millis,
};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn start_admin_api(state: Arc<RestState>, port: u16) -> std::io::Result<Server> {
    let data = Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/sys/login", web::post().to(login))
            .route("/sys/deliverpooling", web::post().to(deliver_pooling))
            .route("/sys/blocking", web::post().to(blocking))
            .route("/sys/initbc", web::post().to(initbc))
            .route("/sys/syncblocked", web::post().to(sync_blocked))
            .route("/sys/syncpooling", web::post().to(sync_pooling))
            .route("/sys/synccache", web::post().to(sync_cache))
            .route("/sys/opentenant", web::post().to(open_tenant))
            .route("/sys/closetenant", web::post().to(close_tenant))
            .route("/sys/getconf", web::get().to(get_conf))
            .route("/sys/getconf/{module}", web::get().to(get_conf_module))
            .route("/sys/editconf", web::post().to(edit_conf))
            // historic misspelling kept as a compatibility route; it only
            // ever answers 503
            .route("/sys/editonf", web::post().to(edit_conf_misspelled))
            .route("/sys/resetconf", web::post().to(reset_conf))
            .route("/sys/applyconf", web::post().to(apply_conf))
    })
    .bind(("0.0.0.0", port))?
    .run();
    Ok(server)
}

fn issue_token(state: &RestState, user: &str) -> Option<String> {
    let payload = json!({ "user": user, "iat": get_current_time_in_millis() });
    let sig = state.ctx.keyring.sign_by_private_key(&payload).ok()?;
    Some(format!(
        "{}.{}",
        hex::encode(payload.to_string().as_bytes()),
        sig
    ))
}

fn token_is_valid(state: &RestState, token: &str, expected_user: &str) -> bool {
    let Some((payload_hex, sig)) = token.split_once('.') else {
        return false;
    };
    let Ok(raw) = hex::decode(payload_hex) else {
        return false;
    };
    let Ok(payload) = serde_json::from_slice::<Value>(&raw) else {
        return false;
    };
    if payload.get("user").and_then(Value::as_str) != Some(expected_user) {
        return false;
    }
    state
        .ctx
        .keyring
        .verify_with_own_key(sig, &payload)
        .unwrap_or(false)
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
    match bearer_token(req) {
        Some(token) if token_is_valid(state, &token, &rest.adminapi_user) => Ok(guard),
        Some(_) => Err(HttpResponse::Forbidden().finish()),
        None => Err(HttpResponse::Unauthorized().finish()),
    }
}

async fn login(
    state: Data<Arc<RestState>>,
    body: Json<LoginRequest>,
) -> HttpResponse {
    const API: &str = "admin/sys/login";
    let Some(_guard) = state.gate.enter() else {
        return unavailable(API);
    };
    let rest = state.ctx.conf.current().await.rest;
    if body.user != rest.adminapi_user || body.password != rest.adminapi_password {
        return HttpResponse::Unauthorized().finish();
    }
    match issue_token(&state, &body.user) {
        Some(token) => {
            info!("admin session opened for {}", body.user);
            HttpResponse::Ok().json(LoginResponse { token })
        }
        None => unavailable(API),
    }
}

async fn deliver_pooling(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/deliverpooling";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_delivery_pool(&state.ctx, true).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(API, &e),
    }
}

async fn blocking(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/blocking";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_append_blocks(&state.ctx).await {
        Ok(sealed) => HttpResponse::Ok().json(json!({ "sealed": sealed.len() })),
        Err(e) => error_response(API, &e),
    }
}

async fn initbc(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/initbc";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_genesis_block(&state.ctx).await {
        Ok(created) => HttpResponse::Ok().json(json!({ "created": created.len() })),
        Err(e) => error_response(API, &e),
    }
}

async fn sync_blocked(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/syncblocked";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_scan_and_fix_block(&state.ctx).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(API, &e),
    }
}

async fn sync_pooling(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/syncpooling";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_scan_and_fix_pool(&state.ctx).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(API, &e),
    }
}

async fn sync_cache(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/synccache";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_sync_caches(&state.ctx).await {
        Ok(known) => HttpResponse::Ok().json(json!({ "known_keys": known })),
        Err(e) => error_response(API, &e),
    }
}

#[derive(Deserialize)]
struct TenantRequest {
    tenant: String,
}

async fn open_tenant(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    body: Json<TenantRequest>,
) -> HttpResponse {
    const API: &str = "admin/sys/opentenant";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_open_parcel(&body.tenant).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "tenant": body.tenant, "open": true })),
        Err(e) => error_response(API, &e),
    }
}

async fn close_tenant(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    body: Json<TenantRequest>,
) -> HttpResponse {
    const API: &str = "admin/sys/closetenant";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.system.post_close_parcel(&body.tenant).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "tenant": body.tenant, "open": false })),
        Err(e) => error_response(API, &e),
    }
}

async fn get_conf(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/getconf";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.conf.get_conf(None).await {
        Ok(conf) => HttpResponse::Ok().json(conf),
        Err(e) => error_response(API, &e),
    }
}

async fn get_conf_module(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    path: Path<String>,
) -> HttpResponse {
    const API: &str = "admin/sys/getconf";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.conf.get_conf(Some(&path)).await {
        Ok(conf) => HttpResponse::Ok().json(conf),
        Err(e) => error_response(API, &e),
    }
}

async fn edit_conf(
    req: HttpRequest,
    state: Data<Arc<RestState>>,
    body: Json<Value>,
) -> HttpResponse {
    const API: &str = "admin/sys/editconf";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.conf.edit_conf(body.into_inner()).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "pending": true })),
        Err(e) => error_response(API, &e),
    }
}

async fn edit_conf_misspelled() -> HttpResponse {
    unavailable("admin/sys/editonf")
}

async fn reset_conf(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/resetconf";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    state.ctx.conf.reset_conf().await;
    HttpResponse::Ok().json(json!({ "pending": false }))
}

async fn apply_conf(req: HttpRequest, state: Data<Arc<RestState>>) -> HttpResponse {
    const API: &str = "admin/sys/applyconf";
    let _guard = match authorize(&state, &req, API).await {
        Ok(g) => g,
        Err(resp) => return resp,
    };
    match state.ctx.conf.apply_conf().await {
        Ok(()) => HttpResponse::Ok().json(json!({ "reload": "scheduled" })),
        Err(e) => error_response(API, &e),
    }
}
