// # polyfetch
//
// Fetch a URL over the engine and write the body to stdout. Doubles
// as an end-to-end smoke test of the whole stack: job queue, network
// block I/O, buffered stream, HTTP state machine.

use parking_lot::{Condvar, Mutex};
use polystream::config::Settings;
use polystream::error::{IoError, Result};
use polystream::http::{HttpCallback, HttpStream};
use polystream::runtime;
use polystream::url::ParsedUrl;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

/// Blocks the main thread until the terminal document callback.
struct WaitingCallback {
    done: Mutex<Option<Result<()>>>,
    signal: Condvar,
}

impl WaitingCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(None),
            signal: Condvar::new(),
        })
    }

    fn wait(&self) -> Result<()> {
        let mut done = self.done.lock();
        while done.is_none() {
            self.signal.wait(&mut done);
        }
        done.take().unwrap_or(Err(IoError::Fail))
    }

    fn complete(&self, result: Result<()>) {
        *self.done.lock() = Some(result);
        self.signal.notify_all();
    }
}

impl HttpCallback for WaitingCallback {
    fn on_read_http_document(&self, result: Result<()>, _http: Arc<HttpStream>) {
        self.complete(result);
    }

    fn on_write_http_document(&self, result: Result<()>, _http: Arc<HttpStream>) {
        self.complete(result);
    }
}

fn settings_from_env() -> Settings {
    let mut settings = Settings::default();
    if let Ok(proxy) = std::env::var("HTTP_PROXY") {
        if let Some((host, port)) = proxy
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .split_once(':')
        {
            if let Ok(port) = port.parse() {
                settings.proxy_host = Some(host.to_string());
                settings.proxy_port = port;
                settings.use_proxy = true;
            }
        }
    }
    settings
}

fn run(url_text: &str) -> Result<()> {
    let url = ParsedUrl::parse(url_text)?;
    runtime::init(settings_from_env())?;

    let http = HttpStream::new();
    let callback = WaitingCallback::new();
    http.read_http_document(&url, callback.clone())?;
    let result = callback.wait();

    if result.is_ok() {
        info!(
            status = http.status_code(),
            redirects = http.redirect_count(),
            "document complete"
        );
        if let Some(content_type) = http.content_type()? {
            eprintln!("status: {}", http.status_code());
            eprintln!("content-type: {}", content_type.to_header_value());
        }
        let body = http.read_body()?;
        std::io::stdout().write_all(&body).map_err(IoError::from)?;
    }

    http.close();
    runtime::shutdown();
    result
}

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        eprintln!("usage: polyfetch <url>");
        std::process::exit(2);
    };

    if let Err(err) = run(&url) {
        eprintln!("polyfetch: {}", err);
        std::process::exit(1);
    }
}
