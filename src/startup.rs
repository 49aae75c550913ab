use std::net::TcpListener;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_actix_web::TracingLogger;

use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::email_client::EmailClient;
use crate::gatekeeper::GatekeeperClient;
use crate::routes::confirm;
use crate::routes::health_check;
use crate::routes::submit;
use crate::routes::submit_probe;

/// Wrapper for actix's `Server` with access to the bound port. Not to be
/// confused with actix's `App`!
pub struct Application {
    /// Left private; use `get_port` to access
    port: u16,
    server: Server,
}

impl Application {
    /// Build every long-lived component exactly once: the TCP listener, the
    /// db pool, and the two outbound clients. Handlers borrow these through
    /// `web::Data` instead of constructing their own.
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;

        // when configured with port 0, the OS assigns one; it must be
        // retrievable for clients (and tests)
        let port = listener.local_addr().unwrap().port();

        let pool = get_connection_pool(&cfg.database);
        let email_client = cfg.email_client.client();
        let gatekeeper = cfg.gatekeeper.client();

        let server = run(
            listener,
            pool,
            email_client,
            gatekeeper,
            cfg.application.base_url,
        )?;

        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 { self.port }

    /// Because this consumes `self`, this should be the final function call
    /// (or passed to `tokio::spawn`)
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> PgPool {
    // connect_lazy only connects when the pool is first used; db-free
    // requests (e.g. health_check) can be served before the db is reachable
    PgPoolOptions::new().connect_lazy_with(db_cfg.connection())
}

/// Wrapper for top-level application `base_url` (because raw `String`s may
/// conflict with one another when passed around by `Data`)
pub struct AppBaseUrl(pub String);

/// Declares all API endpoints. The server is not responsible for binding to
/// an address, it only listens to an already bound one.
pub fn run(
    listener: TcpListener,
    pool: PgPool,
    email_client: EmailClient,
    gatekeeper: GatekeeperClient,
    base_url: String,
) -> Result<Server, std::io::Error> {
    // `Data` is externally an `Arc`, so each worker shares the same instance
    let pool = web::Data::new(pool);
    let email_client = web::Data::new(email_client);
    let gatekeeper = web::Data::new(gatekeeper);
    let base_url = Data::new(AppBaseUrl(base_url));

    // `actix-web` spins up a worker per core, each running its own copy of
    // the `App` built by this closure; everything moved in must be cloneable
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default()) // wrap the whole app in tracing middleware
            .route("/health_check", web::get().to(health_check))
            .route("/submit", web::get().to(submit_probe))
            .route("/submit", web::post().to(submit))
            .route("/confirm", web::get().to(confirm))
            .app_data(pool.clone())
            .app_data(email_client.clone())
            .app_data(gatekeeper.clone())
            .app_data(base_url.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
