//! HTTP surface for Trackrelay
//!
//! Emulates the MapMyTracks server endpoints that tracker firmware and the
//! vendor's own apps actually call. The path layout is quirky on purpose:
//! deployed clients reach the API under `/api/` but also under `/`, `//`,
//! and any reverse-proxied prefix ending in `/api/`, and the scraping
//! surfaces live at double-slash paths. Routes that axum can express
//! directly are registered; the rest go through a fallback that matches on
//! method and raw path, the same way the original server dispatched.
//!
//! Every response from the protocol surface carries the vendor's header
//! set (text/xml content type, Basic auth challenge, tracking cookie)
//! because deployed clients check for them.

pub mod protocol;

use crate::audit::{AuditLog, AuditRecord};
use crate::auth::AuthGate;
use crate::config::Config;
use crate::error::{CoreError, ProtocolError, Result};
use crate::fanout::DestinationSet;
use crate::registry::SessionRegistry;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::Utc;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Everything the session registry and fan-out share one lock for.
///
/// A request that touches tracking state holds this lock from session
/// lookup through destination write, so concurrent batches from one
/// tracker cannot interleave their points.
pub struct TrackingState {
    pub registry: SessionRegistry,
    pub destinations: DestinationSet,
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub tracking: Arc<tokio::sync::Mutex<TrackingState>>,
    pub auth: Arc<AuthGate>,
    pub audit: Arc<AuditLog>,
    /// Value for the `exp_uniqueid` cookie, fixed per process.
    pub uniqueid: String,
}

/// Start the HTTP server
pub async fn serve(config: &Config, state: AppState) -> Result<()> {
    let addr = config.server_addr();

    // Check if port is already in use (another trackrelay instance running)
    if tokio::net::TcpStream::connect(addr).await.is_ok() {
        tracing::error!(
            "Port {} is already in use — another trackrelay instance may be running.",
            addr.port()
        );
        return Err(CoreError::Server(format!(
            "Port {} already in use",
            addr.port()
        )));
    }

    let app = create_router(state);

    if config.tls_enabled() {
        let cert = config.server.cert_file.as_ref().unwrap();
        let key = config.server.key_file.as_ref().unwrap();
        let tls = RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| CoreError::Server(format!("TLS setup failed: {}", e)))?;

        tracing::info!("Listening on https://{}", addr);

        let handle = axum_server::Handle::new();
        let watcher = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            watcher.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .map_err(|e| CoreError::Server(e.to_string()))?;
    } else {
        tracing::info!("Listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CoreError::Server(e.to_string()))?;
    }

    Ok(())
}

/// Create the router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Homepage fragment and the canonical API path
        .route("/", get(homepage).post(api_post))
        // Everything else the vendor's clients hit: `//`, proxied paths
        // ending in `/api/`, and the double-slash GET surfaces
        .fallback(vendor_paths)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wrap a body in the vendor's fixed header set.
fn vendor_response(uniqueid: &str, status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/xml; charset=UTF-8".to_string()),
            (
                header::WWW_AUTHENTICATE,
                "Basic realm=\"MMTracks API\"".to_string(),
            ),
            (header::SET_COOKIE, format!("exp_uniqueid={}", uniqueid)),
        ],
        body,
    )
        .into_response()
}

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

fn record_request(
    state: &AppState,
    command: Option<String>,
    sender: IpAddr,
    fields: HashMap<String, String>,
    status: StatusCode,
    outcome: &str,
) {
    state.audit.record(AuditRecord {
        timestamp: Utc::now(),
        command,
        sender,
        fields,
        response_status: status.as_u16(),
        outcome: outcome.to_string(),
    });
}

async fn run_protocol(
    state: &AppState,
    peer: SocketAddr,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    // Trackers in the field send broken encodings; a lossy decode keeps the
    // batch alive instead of bouncing it on a stray byte.
    let body = String::from_utf8_lossy(body);
    let handled = protocol::handle_post(state, peer.ip(), auth_header(headers), &body).await;
    record_request(
        state,
        handled.command,
        peer.ip(),
        handled.fields,
        handled.status,
        &handled.body,
    );
    vendor_response(&state.uniqueid, handled.status, handled.body)
}

/// One GET fragment: audit it and wrap it in the vendor headers.
fn fragment_response(
    state: &AppState,
    peer: SocketAddr,
    fields: HashMap<String, String>,
    result: std::result::Result<String, ProtocolError>,
) -> Response {
    let (status, body) = match result {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::warn!(status = err.status().as_u16(), error = %err, "request refused");
            (err.status(), protocol::error_body(&err.to_string()))
        }
    };
    record_request(state, None, peer.ip(), fields, status, &body);
    vendor_response(&state.uniqueid, status, body)
}

/// POST handler for the registered API paths.
async fn api_post(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_protocol(&state, peer, &headers, &body).await
}

/// GET `/`: the hidden member-id fragment the vendor's site embeds.
async fn homepage(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let result = protocol::homepage(&state, auth_header(&headers));
    fragment_response(&state, peer, HashMap::new(), result)
}

/// Fallback for the paths axum routing cannot express: double-slash
/// prefixes and arbitrary proxy prefixes in front of `/api/`.
async fn vendor_paths(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    if method == Method::POST && (path == "//" || path.ends_with("/api/")) {
        return run_protocol(&state, peer, &headers, &body).await;
    }
    if method == Method::GET {
        if path.ends_with("//explore/wall") {
            return fragment_response(&state, peer, HashMap::new(), Ok(protocol::categories()));
        }
        if path.starts_with("//assets/php/gpx.php") {
            let result = protocol::stored_track(&state, uri.query()).await;
            let mut fields = HashMap::new();
            if let Some(query) = uri.query() {
                for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                    fields.insert(key.into_owned(), value.into_owned());
                }
            }
            return fragment_response(&state, peer, fields, result);
        }
    }

    tracing::warn!(method = %method, path, "unsupported path");
    let err = ProtocolError::MalformedRequest(format!("unsupported path {}", path));
    record_request(
        &state,
        None,
        peer.ip(),
        HashMap::new(),
        err.status(),
        &err.to_string(),
    );
    vendor_response(
        &state.uniqueid,
        err.status(),
        protocol::error_body(&err.to_string()),
    )
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::directory::DirectoryDestination;
    use axum::body::Body;
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tower::ServiceExt;

    const PEER: [u8; 4] = [192, 168, 7, 9];

    fn test_state(root: &Path) -> AppState {
        std::fs::write(root.join(".users"), "gpslogger:secret\nzoe:pw\n").unwrap();
        let destination = DirectoryDestination::new(root.join("tracks")).unwrap();
        AppState {
            tracking: Arc::new(tokio::sync::Mutex::new(TrackingState {
                registry: SessionRegistry::new(),
                destinations: DestinationSet::new(vec![Box::new(destination)]),
            })),
            auth: Arc::new(AuthGate::new(root)),
            audit: Arc::new(AuditLog::new(64)),
            uniqueid: "cafefeed".to_string(),
        }
    }

    fn basic_auth(user: &str, password: &str) -> String {
        format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", user, password))
        )
    }

    fn post(uri: &str, auth: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded");
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        let mut request = builder.body(Body::from(body.to_string())).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((PEER, 43210))));
        request
    }

    fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((PEER, 43210))));
        request
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_get_time_with_vendor_headers() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");
        let (status, headers, body) =
            send(&state, post("/api/", Some(&auth), "request=get_time")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get("content-type").unwrap(),
            "text/xml; charset=UTF-8"
        );
        assert_eq!(
            headers.get("www-authenticate").unwrap(),
            "Basic realm=\"MMTracks API\""
        );
        assert_eq!(headers.get("set-cookie").unwrap(), "exp_uniqueid=cafefeed");
        assert!(body.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?><message>"));
        assert!(body.contains("<type>time</type><server_time>"));
    }

    #[tokio::test]
    async fn test_api_reachable_under_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");
        for uri in ["/", "//", "/api/", "/proxied/deep/api/"] {
            let (status, _, body) = send(&state, post(uri, Some(&auth), "request=get_time")).await;
            assert_eq!(status, StatusCode::OK, "uri {}", uri);
            assert!(body.contains("<type>time</type>"), "uri {}", uri);
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "wrong");
        let (status, _, body) = send(&state, post("/api/", Some(&auth), "request=get_time")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("<type>error</type>"));
        assert!(body.contains("Authorization failed"));

        let (status, _, _) = send(&state, post("/api/", None, "request=get_time")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_auth_refusal_wins_over_malformed_body() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "wrong");
        let (status, _, body) = send(
            &state,
            post("/api/", Some(&auth), "request=get_time&request=get_time"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Authorization failed"));
    }

    #[tokio::test]
    async fn test_unknown_command_and_missing_request_field() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");

        let (status, _, body) = send(&state, post("/api/", Some(&auth), "request=fly")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Unknown request fly"));

        let (status, _, body) = send(&state, post("/api/", Some(&auth), "title=no+command")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("missing field request"));
    }

    #[tokio::test]
    async fn test_full_tracking_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");

        let start = "request=start_activity&title=Morning+ride&privacy=public\
                     &activity=running&points=52.5+13.4+34.0+1700000000";
        let (status, _, body) = send(&state, post("/api/", Some(&auth), start)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<type>activity_started</type><activity_id>1</activity_id>"));

        let update =
            "request=update_activity&points=52.6+13.5+35.0+1700000060+52.7+13.6+36.0+1700000120";
        let (status, _, body) = send(&state, post("/api/", Some(&auth), update)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<type>activity_updated</type>"));

        let (status, _, body) =
            send(&state, post("/api/", Some(&auth), "request=stop_activity")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<type>activity_stopped</type>"));

        // The stored file holds the whole run: all three points, the
        // repaired metadata, public status.
        let stored = std::fs::read_to_string(dir.path().join("tracks/1.gpx")).unwrap();
        assert!(stored.contains("<name>Morning ride</name>"));
        assert!(stored.contains("Status:public"));
        assert!(stored.contains("Category:Running"));
        assert_eq!(stored.matches("<trkpt").count(), 3);

        let (_, _, listing) =
            send(&state, post("/api/", Some(&auth), "request=get_activities")).await;
        assert!(listing.contains("<activities><activity1><id>1</id>"));
        assert!(listing.contains("<title><![CDATA[ Morning ride ]]></title>"));
        assert!(listing.contains("<activity_type>Running</activity_type>"));
    }

    #[tokio::test]
    async fn test_get_activities_offset_pages_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");

        let start = "request=start_activity&points=52.5+13.4+34.0+1700000000";
        send(&state, post("/api/", Some(&auth), start)).await;

        let (_, _, body) = send(
            &state,
            post("/api/", Some(&auth), "request=get_activities&offset=20"),
        )
        .await;
        assert!(body.contains("<activities></activities>"));
    }

    #[tokio::test]
    async fn test_upload_activity_stores_raw_text() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");

        let gpx = "<gpx><trk><name>imported</name></trk></gpx>";
        let body = format!(
            "request=upload_activity&gpx_file={}",
            form_urlencoded::byte_serialize(gpx.as_bytes()).collect::<String>()
        );
        let (status, _, response) = send(&state, post("/api/", Some(&auth), &body)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(response.contains("<type>success</type><id>1</id>"));

        let stored = std::fs::read_to_string(dir.path().join("tracks/1.gpx")).unwrap();
        assert_eq!(stored, gpx);
    }

    #[tokio::test]
    async fn test_listing_survives_cdata_terminator_in_uploaded_title() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");

        let gpx = "<gpx><metadata><name>bad ]]> name</name></metadata></gpx>";
        let body = format!(
            "request=upload_activity&gpx_file={}",
            form_urlencoded::byte_serialize(gpx.as_bytes()).collect::<String>()
        );
        let (status, _, _) = send(&state, post("/api/", Some(&auth), &body)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, _, listing) =
            send(&state, post("/api/", Some(&auth), "request=get_activities")).await;
        assert!(listing.contains("<![CDATA[ bad ]]]]><![CDATA[> name ]]>"));
        // The envelope keeps its shape past the hostile title.
        assert!(listing.ends_with("</activities></message>"));
    }

    #[tokio::test]
    async fn test_homepage_reports_member_index() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let auth = basic_auth("zoe", "pw");
        let (status, _, body) = send(&state, get("/", Some(&auth))).await;
        assert_eq!(status, StatusCode::OK);
        // Users sort as [gpslogger, zoe]; zoe is index 1.
        assert_eq!(
            body,
            "<input type=\"hidden\" value=\"1\" name=\"mid\" id=\"mid\" />"
        );

        let (status, _, _) = send(&state, get("/", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_explore_wall_lists_categories_without_auth() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (status, _, body) = send(&state, get("/anything//explore/wall", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("<li><input name=\"add-activity-x\">&nbsp;Cycling</li>"));
        assert!(body.contains("&nbsp;Miscellaneous"));
    }

    #[tokio::test]
    async fn test_gpx_download_surface() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");

        let start = "request=start_activity&title=dl&points=52.5+13.4+34.0+1700000000";
        send(&state, post("/api/", Some(&auth), start)).await;

        let (status, _, body) = send(&state, get("//assets/php/gpx.php?tid=1", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<trkpt lat=\"52.5\" lon=\"13.4\">"));

        let (status, _, body) = send(&state, get("//assets/php/gpx.php?tid=99", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("unknown track 99"));

        let (status, _, body) = send(&state, get("//assets/php/gpx.php", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("missing field tid"));
    }

    #[tokio::test]
    async fn test_unknown_path_gets_enveloped_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let (status, headers, body) = send(&state, get("/favicon.ico", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.starts_with("<?xml"));
        assert!(body.contains("<type>error</type>"));
        assert_eq!(headers.get("set-cookie").unwrap(), "exp_uniqueid=cafefeed");
    }

    #[tokio::test]
    async fn test_requests_land_in_the_audit_ring() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");

        send(&state, post("/api/", Some(&auth), "request=get_time")).await;
        send(&state, post("/api/", Some(&auth), "request=fly")).await;
        send(&state, get("/favicon.ico", None)).await;

        let records = state.audit.snapshot();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].command.as_deref(), Some("get_time"));
        assert_eq!(records[0].response_status, 200);
        assert_eq!(records[0].sender, IpAddr::from(PEER));
        assert_eq!(records[1].command.as_deref(), Some("fly"));
        assert_eq!(records[1].response_status, 400);
        assert_eq!(records[2].command, None);
    }

    #[tokio::test]
    async fn test_distinct_senders_track_independently() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let auth = basic_auth("gpslogger", "secret");
        let router = create_router(state.clone());

        let mut from_other = post(
            "/api/",
            Some(&auth),
            "request=start_activity&points=1.0+2.0+3.0+1700000000",
        );
        from_other
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 999))));

        send(
            &state,
            post(
                "/api/",
                Some(&auth),
                "request=start_activity&points=52.5+13.4+34.0+1700000000",
            ),
        )
        .await;
        router.oneshot(from_other).await.unwrap();

        let tracking = state.tracking.lock().await;
        assert_eq!(tracking.registry.active_count(), 2);
    }
}
