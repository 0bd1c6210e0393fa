/*!
 * The HTTP surface: receiver and fleet JSON, the WebSocket echo endpoint,
 * favicons and static files from the configured filesystem capability.
 */
use std::convert::Infallible;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use warp::filters::ws::WebSocket;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::webfs::{content_type, WebFs};
use crate::App;

type Shared = Arc<Mutex<App>>;

#[derive(Clone)]
pub struct WebConfig {
    pub web_page: String,
    pub keep_alive: bool,
    pub json_interval: u64,
}

/// 1x1 transparent PNG
#[rustfmt::skip]
static FAVICON_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d,
    0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01,
    0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4, 0x89, 0x00, 0x00, 0x00,
    0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x60, 0x00, 0x02, 0x00,
    0x00, 0x05, 0x00, 0x01, 0x7a, 0x5e, 0xab, 0x3f, 0x00, 0x00, 0x00, 0x00,
    0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// 1x1 transparent icon for the browsers that insist on .ico
#[rustfmt::skip]
static FAVICON_ICO: &[u8] = &[
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00,
    0x20, 0x00, 0x30, 0x00, 0x00, 0x00, 0x16, 0x00, 0x00, 0x00, 0x28, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00,
    0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

async fn receiver_json(
    app: Shared,
    interval: u64,
) -> Result<impl Reply, Infallible> {
    let mut app = app.lock().await;
    app.stats.http_get_requests += 1;
    let (lat, lon) = app
        .fleet
        .home
        .map(|p| (p.latitude, p.longitude))
        .unwrap_or((0., 0.));
    let body = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "refresh": interval,
        "history": 0,
        "lat": lat,
        "lon": lon,
    });
    Ok(warp::reply::json(&body))
}

async fn aircraft_json(app: Shared) -> Result<impl Reply, Infallible> {
    let mut app = app.lock().await;
    app.stats.http_get_requests += 1;
    let now = rx1090::decode::time::now_in_s();
    let body = app.fleet.to_json(now);
    Ok(warp::reply::with_header(
        warp::reply::json(&body),
        "Access-Control-Allow-Origin",
        "*",
    ))
}

async fn echo_session(ws: WebSocket) {
    let (mut tx, mut rx) = ws.split();
    while let Some(Ok(message)) = rx.next().await {
        if message.is_close() {
            break;
        }
        // echo text and binary messages in kind
        if message.is_text() || message.is_binary() {
            if tx.send(message).await.is_err() {
                break;
            }
        }
    }
}

async fn static_file(
    tail: warp::path::Tail,
    fs: Arc<dyn WebFs>,
    app: Shared,
) -> Result<warp::reply::Response, Rejection> {
    let name = tail.as_str();
    // only dotted paths reach for files; the rest falls through to 404
    if !name.contains('.') {
        return Err(warp::reject::not_found());
    }
    let mut app = app.lock().await;
    app.stats.http_get_requests += 1;
    match fs.open(name) {
        Some(content) => Ok(warp::reply::with_header(
            content.bytes,
            "Content-Type",
            content_type(name),
        )
        .into_response()),
        None => {
            app.stats.http_404_responses += 1;
            Ok(warp::reply::with_status(
                "Not found\n",
                StatusCode::NOT_FOUND,
            )
            .into_response())
        }
    }
}

/// Marks requests with a method other than GET or HEAD
#[derive(Debug)]
struct BadMethod;

impl warp::reject::Reject for BadMethod {}

/// Only GET and HEAD pass; everything else gets a 400 out of the
/// rejection handler
fn get_or_head(
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::method()
        .and_then(|method: warp::http::Method| async move {
            match method {
                warp::http::Method::GET | warp::http::Method::HEAD => Ok(()),
                _ => Err(warp::reject::custom(BadMethod)),
            }
        })
        .untuple_one()
}

async fn handle_rejection(
    err: Rejection,
    app: Shared,
) -> Result<impl Reply, Infallible> {
    let mut app = app.lock().await;
    let (code, message) = if err.find::<BadMethod>().is_some()
        || err.find::<warp::reject::MethodNotAllowed>().is_some()
    {
        // anything but GET and HEAD is a bad request here
        app.stats.http_400_responses += 1;
        (StatusCode::BAD_REQUEST, "Bad request\n")
    } else if err.is_not_found() {
        app.stats.http_404_responses += 1;
        (StatusCode::NOT_FOUND, "Not found\n")
    } else {
        app.stats.http_500_responses += 1;
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n")
    };
    Ok(warp::reply::with_status(message, code))
}

/// Assemble the route tree served on the HTTP port
pub fn routes(
    app: Shared,
    fs: Arc<dyn WebFs>,
    config: WebConfig,
) -> BoxedFilter<(warp::reply::Response,)> {
    let with_app = {
        let app = app.clone();
        warp::any().map(move || app.clone())
    };
    let with_fs = warp::any().map(move || fs.clone());

    let location = format!("/{}", config.web_page);
    let home = warp::path::end().map(move || {
        warp::reply::with_header(
            warp::reply::with_status(
                warp::reply(),
                StatusCode::MOVED_PERMANENTLY,
            ),
            "Location",
            location.clone(),
        )
    });

    let interval = config.json_interval;
    let receiver = warp::path!("data" / "receiver.json")
        .and(with_app.clone())
        .and_then(move |app| receiver_json(app, interval));

    let aircraft = warp::path!("data" / "aircraft.json")
        .and(with_app.clone())
        .and_then(aircraft_json);
    let data_legacy = warp::path!("data.json")
        .and(with_app.clone())
        .and_then(aircraft_json);
    let chunks = warp::path!("chunks" / "chunks.json")
        .and(with_app.clone())
        .and_then(aircraft_json);

    let echo_app = with_app.clone();
    let echo = warp::path!("echo")
        .and(warp::ws())
        .and(echo_app)
        .and_then(|ws: warp::ws::Ws, app: Shared| async move {
            app.lock().await.stats.http_websockets += 1;
            Ok::<_, Rejection>(ws.on_upgrade(echo_session))
        });

    let favicon_png = warp::path!("favicon.png").map(|| {
        warp::reply::with_header(
            FAVICON_PNG.to_vec(),
            "Content-Type",
            "image/png",
        )
    });
    let favicon_ico = warp::path!("favicon.ico").map(|| {
        warp::reply::with_header(
            FAVICON_ICO.to_vec(),
            "Content-Type",
            "image/x-icon",
        )
    });

    let files = warp::path::tail()
        .and(with_fs)
        .and(with_app.clone())
        .and_then(static_file);

    let connection = if config.keep_alive {
        "keep-alive"
    } else {
        "close"
    };

    get_or_head()
        .and(
            home.or(receiver)
                .or(aircraft)
                .or(data_legacy)
                .or(chunks)
                .or(echo)
                .or(favicon_png)
                .or(favicon_ico)
                .or(files),
        )
        .recover(move |err| handle_rejection(err, app.clone()))
        .with(warp::reply::with::header("Connection", connection))
        .map(|reply| Reply::into_response(reply))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::FleetTable;
    use crate::services::ServiceSet;
    use crate::webfs::PackedFs;

    fn test_app() -> Shared {
        Arc::new(Mutex::new(App::new(
            FleetTable::new(None, 300., 60.),
            ServiceSet::new(30001, 30002, 30004, 30003, 8080),
        )))
    }

    fn test_routes(app: Shared) -> BoxedFilter<(warp::reply::Response,)> {
        routes(
            app,
            Arc::new(PackedFs::builtin()),
            WebConfig {
                web_page: "index.html".to_string(),
                keep_alive: true,
                json_interval: 1000,
            },
        )
    }

    #[tokio::test]
    async fn receiver_json_ok() {
        let app = test_app();
        let reply = warp::test::request()
            .method("GET")
            .path("/data/receiver.json")
            .reply(&test_routes(app.clone()))
            .await;
        assert_eq!(reply.status(), 200);
        assert_eq!(
            reply.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body = String::from_utf8_lossy(reply.body());
        assert!(body.contains("\"version\""));
        assert!(body.contains("\"refresh\""));
        assert_eq!(app.lock().await.stats.http_get_requests, 1);
    }

    #[tokio::test]
    async fn aircraft_json_has_cors() {
        let app = test_app();
        let reply = warp::test::request()
            .method("GET")
            .path("/data/aircraft.json")
            .reply(&test_routes(app))
            .await;
        assert_eq!(reply.status(), 200);
        assert_eq!(
            reply
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
        let body = String::from_utf8_lossy(reply.body());
        assert!(body.contains("\"aircraft\""));
    }

    #[tokio::test]
    async fn root_redirects_to_the_page() {
        let app = test_app();
        let reply = warp::test::request()
            .method("GET")
            .path("/")
            .reply(&test_routes(app))
            .await;
        assert_eq!(reply.status(), 301);
        assert_eq!(
            reply.headers().get("location").unwrap(),
            "/index.html"
        );
    }

    #[tokio::test]
    async fn delete_is_bad_request() {
        let app = test_app();
        let reply = warp::test::request()
            .method("DELETE")
            .path("/")
            .reply(&test_routes(app.clone()))
            .await;
        assert_eq!(reply.status(), 400);
        assert_eq!(app.lock().await.stats.http_400_responses, 1);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let app = test_app();
        let reply = warp::test::request()
            .method("GET")
            .path("/nonexistent.html")
            .reply(&test_routes(app.clone()))
            .await;
        assert_eq!(reply.status(), 404);
        assert_eq!(app.lock().await.stats.http_404_responses, 1);
    }

    #[tokio::test]
    async fn packed_index_is_served() {
        let app = test_app();
        let reply = warp::test::request()
            .method("GET")
            .path("/index.html")
            .reply(&test_routes(app))
            .await;
        assert_eq!(reply.status(), 200);
        assert_eq!(
            reply.headers().get("content-type").unwrap(),
            "text/html"
        );
    }

    #[tokio::test]
    async fn favicon_bytes() {
        let app = test_app();
        let reply = warp::test::request()
            .method("GET")
            .path("/favicon.png")
            .reply(&test_routes(app))
            .await;
        assert_eq!(reply.status(), 200);
        assert_eq!(
            reply.headers().get("content-type").unwrap(),
            "image/png"
        );
        assert_eq!(&reply.body()[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn websocket_echoes() {
        let app = test_app();
        let routes = test_routes(app);
        let mut client = warp::test::ws()
            .path("/echo")
            .handshake(routes)
            .await
            .expect("handshake");
        client.send_text("ping").await;
        let reply = client.recv().await.expect("echo");
        assert_eq!(reply.to_str().unwrap(), "ping");
    }
}
