#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

mod dns;
mod enroll;
mod error;
mod http;
mod ingest;
mod issuer;
mod models;
mod schema;
mod session;
mod store;

#[derive(Deserialize, Debug)]
struct Config {
    listen: std::net::SocketAddr,
    database_url: String,
    confdir: std::path::PathBuf,
}

type DBPool = diesel_async::pooled_connection::mobc::Pool<diesel_async::AsyncPgConnection>;
type DBConn = mobc::Connection<diesel_async::pooled_connection::AsyncDieselConnectionManager<diesel_async::AsyncPgConnection>>;

pub const MIGRATIONS: diesel_migrations::EmbeddedMigrations = diesel_migrations::embed_migrations!("migrations");

fn main() {
    use diesel::Connection;
    use diesel_migrations::MigrationHarness;

    pretty_env_logger::init();

    info!("Loading config");
    let env = config::Environment::with_prefix("NIVLHEIM")
        .prefix_separator("_")
        .separator("_")
        .keep_prefix(false);
    let file = config::File::new("config.toml", config::FileFormat::Toml)
        .required(false);
    let config = match config::Config::builder()
        .add_source(env)
        .add_source(file)
        .build() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to get config: {}", e);
            std::process::exit(1);
        }
    };

    let config: Config = match config.try_deserialize() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to parse config: {}", e);
            std::process::exit(1);
        }
    };

    info!("Running migrations");
    let mut conn = match diesel::pg::PgConnection::establish(&config.database_url) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to get database connection: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = conn.run_pending_migrations(MIGRATIONS) {
        error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    info!("Loading CA material");
    let ca = match issuer::CaIssuer::open(&config.confdir) {
        Ok(c) => std::sync::Arc::new(c),
        Err(e) => {
            error!("Failed to set up the CA issuer: {}", e);
            std::process::exit(1);
        }
    };

    let queue_dir = config.confdir.join("queue");
    if let Err(e) = std::fs::create_dir_all(&queue_dir) {
        error!("Failed to create queue directory {}: {}", queue_dir.display(), e);
        std::process::exit(1);
    }

    let db_config = diesel_async::pooled_connection::AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(config.database_url);
    let db_pool = DBPool::new(db_config);

    info!("Setting up runtime");
    let rt = match tokio::runtime::Runtime::new() {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to setup Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let app = std::sync::Arc::new(http::App {
        store: store::CertStore::new(db_pool),
        ca,
        queue_dir,
    });

    info!("Listening for requests on {}", config.listen);
    let server_future = async {
        let listener = tokio::net::TcpListener::bind(config.listen).await?;
        axum::serve(
            listener,
            http::router(app).into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
    };
    rt.block_on(server_future).expect("failed to run the future on runtime");
}
