//! Runs a small blog through the pipeline without a network listener.
//!
//! Raw HTTP/1.1 requests are parsed from bytes, handled by the app and the
//! serialized responses are written to stdout: first a full document, then a
//! signed client-navigation data request whose comments stream after `r`.
//!
//! ```text
//! RUST_LOG=routeweave=debug cargo run --example ssr_demo
//! ```

use std::time::Duration;

use routeweave::component::MatchedComponent;
use routeweave::config::RenderConfig;
use routeweave::defer::DeferOptions;
use routeweave::head::HeadConfig;
use routeweave::http::signal;
use routeweave::middleware::LoggerMiddleware;
use routeweave::router::RoutePayload;
use routeweave::{App, Request};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn build_app() -> Result<App, Box<dyn std::error::Error>> {
    let config = RenderConfig::new()
        .entry_script("/assets/client.js")
        .signing("demo-secret", 300);

    let app = App::builder()
        .config(config)
        .middleware(LoggerMiddleware)
        .route("/", RoutePayload::new("/index").layout("/_layout"))?
        .route("/posts/:slug", RoutePayload::new("/posts/[slug]").layout("/_layout"))?
        .component(
            MatchedComponent::new("/_layout")
                .head(|_ctx| HeadConfig {
                    site_name: Some("Weave Blog".into()),
                    ..HeadConfig::titled("Weave Blog")
                })
                .preloader(|_ctx| async {
                    let mut context = serde_json::Map::new();
                    context.insert("tenant".into(), json!("demo"));
                    Ok(context)
                })
                .render(|props| {
                    format!(
                        "<header>Weave Blog</header><main>{}</main>",
                        props.children.unwrap_or_default()
                    )
                }),
        )
        .component(
            MatchedComponent::new("/index")
                .loader(|_ctx| async { Ok(json!({ "posts": ["hello-world", "streaming"] })) })
                .render(|props| format!("<ul>{}</ul>", props.data["posts"])),
        )
        .component(
            MatchedComponent::new("/posts/[slug]")
                .head(|ctx| {
                    HeadConfig::titled(format!(
                        "{} - {}",
                        ctx.data["title"].as_str().unwrap_or_default(),
                        ctx.parent_head.title.as_deref().unwrap_or_default()
                    ))
                })
                .loader(|ctx| async move {
                    let slug = ctx.location().params.get_str("slug").unwrap_or_default().to_owned();
                    let tenant = ctx.context().get("tenant").cloned().unwrap_or_default();
                    let comments = ctx.defer(
                        async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(json!(["First!", "Nice post."]))
                        },
                        DeferOptions::new().key("comments"),
                    );
                    Ok(json!({
                        "title": slug.replace('-', " "),
                        "tenant": tenant,
                        "comments": comments,
                    }))
                })
                .render(|props| {
                    format!("<article><h1>{}</h1></article>", props.data["title"].as_str().unwrap_or_default())
                }),
        )
        .build();

    Ok(app)
}

async fn send(app: &App, raw: &[u8]) -> Result<(), Box<dyn std::error::Error>> {
    let (request, _body_offset) = Request::parse(raw)?;
    let response = app.handle(request).await;

    let mut stdout = tokio::io::stdout();
    response.write_to(&mut stdout).await?;
    stdout.write_all(b"\n\n").await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routeweave=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let app = build_app()?;

    send(&app, b"GET /posts/hello-world HTTP/1.1\r\nHost: localhost\r\n\r\n").await?;

    let signature = app
        .config()
        .signer()
        .map(|signer| signer.sign())
        .transpose()?
        .unwrap_or_default();
    let raw = format!(
        "GET /posts/streaming HTTP/1.1\r\nHost: localhost\r\n{}: 1\r\n{}: {signature}\r\n\r\n",
        signal::DATA_REQUEST,
        signal::DATA_SIGNATURE,
    );
    send(&app, raw.as_bytes()).await?;

    send(&app, b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n").await?;

    Ok(())
}
