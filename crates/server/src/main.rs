//! Ubergang gateway daemon
//!
//! Terminates public TLS for internal HTTP backends, authenticates users via
//! WebAuthn passkeys, brokers MQTT with per-client ACLs, and serves SSH for
//! jump hosts and ephemeral reverse-proxied backends.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ubergang_common::Db;
use ubergang_server::server;

#[derive(Parser)]
#[command(name = "ubergang")]
#[command(about = "Multi-protocol access gateway")]
#[command(version)]
struct Cli {
    /// Database file
    #[arg(long, default_value = "ubergang.db")]
    db: String,

    /// Configure the server: administrator email and site FQDN
    #[arg(long, num_args = 2, value_names = ["EMAIL", "SITE_FQDN"])]
    configure: Option<Vec<String>>,

    /// Create a user account with the given email, then exit
    #[arg(long)]
    account: Option<String>,

    /// Give the created account admin privileges
    #[arg(long)]
    admin: bool,

    /// Clear the database (DANGER!)
    #[arg(long)]
    clear_db: bool,

    /// Test mode (only used in integration tests)
    #[arg(long)]
    test_mode: bool,

    /// Port for the SSH server
    #[arg(long, default_value = "10022")]
    ssh: u16,

    /// Port for the HTTPS server
    #[arg(long, default_value = "10443")]
    https: u16,

    /// Port for the HTTP server
    #[arg(long, default_value = "10080")]
    http: u16,

    /// Port for the metrics server
    #[arg(long, default_value = "9090")]
    metrics: u16,

    /// Port for the MQTT proxy server
    #[arg(long, default_value = "1883")]
    mqtt: u16,

    /// Port for the MQTT TLS proxy server
    #[arg(long, default_value = "8883")]
    mqtt_tls: u16,

    /// Upstream MQTT broker address (host:port); empty disables MQTT
    #[arg(long, default_value = "")]
    mqtt_server: String,

    /// Proxy the admin UI to a local dev frontend
    #[arg(long)]
    local_dev: bool,

    /// Verbose logs
    #[arg(long)]
    verbose: bool,

    /// Port for the proxy test server (0 disables)
    #[arg(long, default_value = "0")]
    proxy_test: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!("Ubergang v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Using database at {}", cli.db);

    let db = Db::open(&cli.db)?;

    if let Some(values) = &cli.configure {
        let (email, site_fqdn) = (values[0].clone(), values[1].clone());
        server::configure(&db, &email, &site_fqdn)?;
        println!("Configured site {site_fqdn} (admin host account.{site_fqdn})");
        return Ok(());
    }
    if cli.clear_db {
        db.clear_database()?;
        println!("Database cleared.");
        return Ok(());
    }
    if cli.test_mode {
        server::start_test_mode(&db)?;
    }

    let opts = server::Options {
        ssh_port: cli.ssh,
        https_port: cli.https,
        http_port: cli.http,
        metrics_port: cli.metrics,
        mqtt_port: cli.mqtt,
        mqtt_tls_port: cli.mqtt_tls,
        mqtt_server: cli.mqtt_server.clone(),
        local_dev: cli.local_dev,
        proxy_test_port: cli.proxy_test,
    };

    let server = server::Server::new(db, opts).await?;

    if let Some(email) = &cli.account {
        let (user, token) = server.create_account(email, cli.admin)?;
        println!(
            "Success! {} has been created: https://{}/signin/{}",
            user.email,
            server.admin_fqdn(),
            token
        );
        return Ok(());
    }

    server.serve().await
}
