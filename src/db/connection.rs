use anyhow::Context;
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use super::query::{bind_params, parse_rows, QueryResult};
use crate::ast::{Dialect, Value};
use crate::error::{Error, Result};

/// A data connection the provider executes compiled statements on.
///
/// Connections are not reentrant; the provider serializes access. Calls
/// block the current thread.
pub trait Connection: Send {
    fn dialect(&self) -> Dialect;
    fn is_open(&self) -> bool;
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    /// Run a statement that returns rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;
    /// Run a statement for its affected-row count.
    fn execute_non_query(&mut self, sql: &str, params: &[Value]) -> Result<u64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    /// Provider name, resolved through the `ProviderRegistry`.
    #[serde(default = "default_provider")]
    pub provider: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub ssl_mode: SslMode,
    /// Accept invalid/self-signed certificates. Use with caution.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate file (PEM format).
    /// If not set, uses the system CA store.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

fn default_provider() -> String {
    String::from("postgres")
}

/// SSL/TLS connection modes, matching the PostgreSQL `sslmode` parameter:
/// - `Disable`: No SSL (unencrypted)
/// - `Prefer`: Try SSL first, fall back to non-SSL (default)
/// - `Require`: Require SSL but don't verify certificate
/// - `VerifyCa`: Require SSL and verify the server certificate is signed by a trusted CA
/// - `VerifyFull`: Like VerifyCa, but also verify the server hostname matches the certificate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl ConnectionConfig {
    pub fn connection_string(&self) -> String {
        let sslmode = match self.ssl_mode {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        };
        format!(
            "host={} port={} dbname={} user={} password={} sslmode={} connect_timeout=10",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.username),
            quote_conn_value(&self.password),
            sslmode
        )
    }

    pub fn display_string(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::from("Local PostgreSQL"),
            provider: default_provider(),
            host: String::from("localhost"),
            port: 5432,
            database: String::from("postgres"),
            username: String::from("postgres"),
            password: String::new(),
            ssl_mode: SslMode::default(),
            accept_invalid_certs: false,
            ca_cert_path: None,
        }
    }
}

/// Saved connection profiles.
pub struct ConnectionManager;

impl ConnectionManager {
    pub fn get_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("predsql")
            .join("connections.toml")
    }

    pub fn load_saved_connections() -> anyhow::Result<Vec<ConnectionConfig>> {
        Self::load_from(&Self::get_config_path())
    }

    pub fn save_connections(connections: &[ConnectionConfig]) -> anyhow::Result<()> {
        Self::save_to(&Self::get_config_path(), connections)
    }

    /// Look up a saved connection by name.
    pub fn find(name: &str) -> anyhow::Result<ConnectionConfig> {
        Self::load_saved_connections()?
            .into_iter()
            .find(|c| c.name == name)
            .with_context(|| {
                format!(
                    "No saved connection named '{}' in {}",
                    name,
                    Self::get_config_path().display()
                )
            })
    }

    fn load_from(path: &std::path::Path) -> anyhow::Result<Vec<ConnectionConfig>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let connections: SavedConnections =
            toml::from_str(&content).context("Failed to parse saved connections")?;
        Ok(connections.connections)
    }

    fn save_to(path: &std::path::Path, connections: &[ConnectionConfig]) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let saved = SavedConnections {
            connections: connections.to_vec(),
        };
        let content = toml::to_string_pretty(&saved)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedConnections {
    connections: Vec<ConnectionConfig>,
}

/// PostgreSQL connection driving `tokio-postgres` on a private
/// current-thread runtime. Must not be used from inside another runtime.
pub struct PgConnection {
    config: ConnectionConfig,
    runtime: Runtime,
    client: Option<Client>,
}

impl PgConnection {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::DataAccess(format!("failed to start runtime: {}", e)))?;
        Ok(Self {
            config,
            runtime,
            client: None,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::DataAccess("connection is not open".to_string()))
    }
}

impl Connection for PgConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn is_open(&self) -> bool {
        self.client.as_ref().is_some_and(|c| !c.is_closed())
    }

    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let client = self
            .runtime
            .block_on(create_client(&self.config))
            .map_err(|e| Error::DataAccess(format!("{:#}", e)))?;
        info!(server = %self.config.display_string(), "connection opened");
        self.client = Some(client);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.client.take().is_some() {
            info!(server = %self.config.display_string(), "connection closed");
        }
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let client = self.client()?;
        let start = Instant::now();
        self.runtime.block_on(async {
            let statement = client.prepare(sql).await?;
            let bound = bind_params(params, statement.params())?;
            let refs: Vec<&(dyn ToSql + Sync)> = bound
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let rows = client.query(&statement, &refs).await?;
            Ok::<_, Error>(parse_rows(statement.columns(), &rows, start.elapsed()))
        })
    }

    fn execute_non_query(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let client = self.client()?;
        self.runtime.block_on(async {
            let statement = client.prepare(sql).await?;
            let bound = bind_params(params, statement.params())?;
            let refs: Vec<&(dyn ToSql + Sync)> = bound
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            Ok::<_, Error>(client.execute(&statement, &refs).await?)
        })
    }
}

/// Create a PostgreSQL client. The connection task is spawned on the
/// current runtime.
pub async fn create_client(config: &ConnectionConfig) -> anyhow::Result<Client> {
    let conn_string = config.connection_string();
    let timeout = Duration::from_secs(15);

    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, NoTls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
        SslMode::Prefer | SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
            let strict = matches!(config.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull);
            let tls = build_tls_connector(config, strict)?;
            let (client, connection) =
                tokio::time::timeout(timeout, tokio_postgres::connect(&conn_string, tls))
                    .await
                    .map_err(|_| anyhow::anyhow!("Connection timed out after 15s"))?
                    .context("Failed to connect to PostgreSQL")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
    };

    Ok(client)
}

/// Build a TLS connector with appropriate certificate configuration.
///
/// With `strict_verify` (verify-ca/verify-full) certificates are always
/// verified, even when `accept_invalid_certs` is set.
fn build_tls_connector(
    config: &ConnectionConfig,
    strict_verify: bool,
) -> anyhow::Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if config.accept_invalid_certs && !strict_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &config.ca_cert_path {
        let ca_data = std::fs::read(ca_path)
            .with_context(|| format!("Failed to read CA certificate file: {}", ca_path))?;
        for pem in split_pem_certificates(&ca_data)? {
            let cert = native_tls::Certificate::from_pem(pem.as_bytes())
                .context("Failed to parse certificate")?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into one PEM block per certificate.
fn split_pem_certificates(pem_data: &[u8]) -> anyhow::Result<Vec<String>> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let pem_str =
        std::str::from_utf8(pem_data).context("CA certificate file is not valid UTF-8")?;

    let mut certs = Vec::new();
    let mut rest = pem_str;
    while let Some(start) = rest.find(BEGIN) {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        certs.push(format!("{}\n", &rest[start..stop]));
        rest = &rest[stop..];
    }

    if certs.is_empty() {
        anyhow::bail!("No valid certificates found in PEM data");
    }
    Ok(certs)
}

/// Quote a value for use in a libpq key=value connection string.
/// Wraps in single quotes and escapes backslashes and single quotes.
fn quote_conn_value(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}
