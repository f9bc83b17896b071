use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{
    md5_hash,
    sasl::{ChannelBinding, ScramSha256, SCRAM_SHA_256},
};
use postgres_protocol::message::{backend::Message, frontend};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use super::protocol::{log_notice, server_error, write_all, BackendFrame, MessageReader};
use super::replication::{ReplicationStream, StreamOptions};
use super::types::LogPosition;
use crate::{Error, Result};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The only output plugin this crate decodes.
pub const OUTPUT_PLUGIN: &str = "pgoutput";

const DUPLICATE_OBJECT: &str = "42710";

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    /// Parses a `postgres://` URL or a key/value connection string.
    pub fn from_url(url: &str) -> Result<Self> {
        let config = url.parse::<tokio_postgres::Config>()?;

        let host = match config.get_hosts().first() {
            Some(tokio_postgres::config::Host::Tcp(host)) => host.clone(),
            Some(_) => {
                return Err(Error::Config(
                    "unix socket hosts are not supported".to_string(),
                ))
            }
            None => "localhost".to_string(),
        };
        let user = config
            .get_user()
            .ok_or_else(|| Error::Config("connection string has no user".to_string()))?
            .to_string();
        let password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).into_owned());

        Ok(Self {
            host,
            port: config.get_ports().first().copied().unwrap_or(5432),
            database: config
                .get_dbname()
                .map(str::to_string)
                .unwrap_or_else(|| user.clone()),
            user,
            password,
            connect_timeout: config
                .get_connect_timeout()
                .copied()
                .unwrap_or(Duration::from_secs(30)),
        })
    }
}

/// Output of IDENTIFY_SYSTEM.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: LogPosition,
    pub dbname: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub name: String,
    pub created: bool,
    /// Set when the slot was created by this call.
    pub consistent_point: Option<LogPosition>,
}

/// One row of a simple query result, all values in text format.
#[derive(Debug, Clone)]
pub struct SimpleRow {
    columns: Arc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl SimpleRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values[i].as_deref())
    }
}

/// A connection in replication mode (`replication=database`).
pub struct ReplicationConnection {
    reader: MessageReader<BoxedRead>,
    writer: BoxedWrite,
    database: String,
    parameters: HashMap<String, String>,
}

impl ReplicationConnection {
    pub async fn connect(options: &ConnectOptions) -> Result<Self> {
        info!(
            host = %options.host,
            port = options.port,
            database = %options.database,
            user = %options.user,
            "Connecting to PostgreSQL in replication mode"
        );

        let connect = async {
            let stream = TcpStream::connect((options.host.as_str(), options.port))
                .await
                .map_err(|e| {
                    Error::Connection(format!(
                        "failed to connect to {}:{}: {}",
                        options.host, options.port, e
                    ))
                })?;
            stream.set_nodelay(true)?;
            Self::handshake(stream, options).await
        };

        let connection = tokio::time::timeout(options.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "timed out after {:?} connecting to {}:{}",
                    options.connect_timeout, options.host, options.port
                ))
            })??;

        info!(
            server_version = connection.parameter("server_version").unwrap_or("unknown"),
            "Successfully connected to PostgreSQL in replication mode"
        );
        Ok(connection)
    }

    /// Runs startup and authentication over an already open transport.
    pub(crate) async fn handshake<S>(io: S, options: &ConnectOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut connection = Self {
            reader: MessageReader::new(Box::new(read_half) as BoxedRead),
            writer: Box::new(write_half),
            database: options.database.clone(),
            parameters: HashMap::new(),
        };

        let mut buf = BytesMut::new();
        frontend::startup_message(
            [
                ("user", options.user.as_str()),
                ("database", options.database.as_str()),
                ("replication", "database"),
                ("application_name", "railgun"),
            ],
            &mut buf,
        )?;
        connection.send(&buf).await?;

        connection.authenticate(options).await?;
        connection.wait_until_ready().await?;
        Ok(connection)
    }

    async fn authenticate(&mut self, options: &ConnectOptions) -> Result<()> {
        let password = || {
            options.password.as_deref().ok_or_else(|| {
                Error::Authentication("server requested a password but none is configured".to_string())
            })
        };

        loop {
            let mut buf = BytesMut::new();
            match self.reader.next_message().await? {
                Message::AuthenticationOk => {
                    debug!("Authentication successful");
                    return Ok(());
                }
                Message::AuthenticationCleartextPassword => {
                    warn!("Server requested a cleartext password");
                    frontend::password_message(password()?.as_bytes(), &mut buf)?;
                    self.send(&buf).await?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let hash = md5_hash(options.user.as_bytes(), password()?.as_bytes(), body.salt());
                    frontend::password_message(hash.as_bytes(), &mut buf)?;
                    self.send(&buf).await?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        supported |= mechanism == SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(Error::Authentication(
                            "server offered no supported SASL mechanism".to_string(),
                        ));
                    }
                    self.authenticate_scram(password()?).await?;
                }
                Message::ErrorResponse(body) => {
                    return Err(Error::Authentication(server_error(&body).to_string()));
                }
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message during authentication".to_string(),
                    ))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self, password: &str) -> Result<()> {
        let mut scram = ScramSha256::new(password.as_bytes(), ChannelBinding::unsupported());

        let mut buf = BytesMut::new();
        frontend::sasl_initial_response(SCRAM_SHA_256, scram.message(), &mut buf)?;
        self.send(&buf).await?;

        match self.reader.next_message().await? {
            Message::AuthenticationSaslContinue(body) => scram
                .update(body.data())
                .map_err(|e| Error::Authentication(e.to_string()))?,
            Message::ErrorResponse(body) => {
                return Err(Error::Authentication(server_error(&body).to_string()))
            }
            _ => return Err(Error::Protocol("expected SASL continue".to_string())),
        }

        let mut buf = BytesMut::new();
        frontend::sasl_response(scram.message(), &mut buf)?;
        self.send(&buf).await?;

        match self.reader.next_message().await? {
            Message::AuthenticationSaslFinal(body) => scram
                .finish(body.data())
                .map_err(|e| Error::Authentication(e.to_string())),
            Message::ErrorResponse(body) => {
                Err(Error::Authentication(server_error(&body).to_string()))
            }
            _ => Err(Error::Protocol("expected SASL final".to_string())),
        }
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        loop {
            match self.reader.next_message().await? {
                Message::ReadyForQuery(_) => return Ok(()),
                Message::ParameterStatus(body) => {
                    let name = body.name()?.to_string();
                    let value = body.value()?.to_string();
                    trace!("Server parameter {}={}", name, value);
                    self.parameters.insert(name, value);
                }
                Message::BackendKeyData(_) => {}
                Message::NoticeResponse(body) => log_notice(&body),
                Message::ErrorResponse(body) => return Err(server_error(&body)),
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message before ReadyForQuery".to_string(),
                    ))
                }
            }
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        MessageReader<BoxedRead>,
        BoxedWrite,
        String,
        HashMap<String, String>,
    ) {
        (self.reader, self.writer, self.database, self.parameters)
    }

    pub(crate) fn from_parts(
        reader: MessageReader<BoxedRead>,
        writer: BoxedWrite,
        database: String,
        parameters: HashMap<String, String>,
    ) -> Self {
        Self {
            reader,
            writer,
            database,
            parameters,
        }
    }

    pub(crate) async fn send(&mut self, buf: &[u8]) -> Result<()> {
        write_all(&mut self.writer, buf).await
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Runs a simple-protocol query and collects its rows.
    pub async fn simple_query(&mut self, query: &str) -> Result<Vec<SimpleRow>> {
        trace!("Simple query: {}", query);
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.send(&buf).await?;

        let mut columns = Arc::new(Vec::new());
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            match self.reader.next_message().await? {
                Message::RowDescription(body) => {
                    columns = Arc::new(
                        body.fields()
                            .map(|f| Ok(f.name().to_string()))
                            .collect::<Vec<_>>()?,
                    );
                }
                Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let values = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                        })
                        .collect::<Vec<_>>()?;
                    rows.push(SimpleRow {
                        columns: columns.clone(),
                        values,
                    });
                }
                Message::CommandComplete(_) | Message::EmptyQueryResponse => {}
                Message::NoticeResponse(body) => log_notice(&body),
                Message::ErrorResponse(body) => failure = Some(server_error(&body)),
                Message::ReadyForQuery(_) => break,
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in response to '{}'",
                        query
                    )))
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| {
            Error::Protocol("IDENTIFY_SYSTEM returned no rows".to_string())
        })?;

        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or("unknown").to_string(),
            timeline: row.get("timeline").and_then(|t| t.parse().ok()).unwrap_or(1),
            xlogpos: row
                .get("xlogpos")
                .and_then(|p| p.parse().ok())
                .unwrap_or_default(),
            dbname: row.get("dbname").map(str::to_string),
        };

        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Makes sure a logical `pgoutput` slot named `name` exists in this
    /// database, creating it if needed.
    pub async fn ensure_slot(&mut self, name: &str) -> Result<SlotInfo> {
        validate_slot_name(name)?;

        if self.check_existing_slot(name).await? {
            info!("Replication slot '{}' already exists", name);
            return Ok(SlotInfo {
                name: name.to_string(),
                created: false,
                consistent_point: None,
            });
        }

        info!("Creating replication slot: {}", name);
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {} NOEXPORT_SNAPSHOT",
            name, OUTPUT_PLUGIN
        );

        match self.simple_query(&query).await {
            Ok(rows) => {
                let consistent_point = rows
                    .first()
                    .and_then(|row| row.get("consistent_point"))
                    .and_then(|p| p.parse().ok());
                info!(
                    "Created replication slot '{}' at LSN {}",
                    name,
                    consistent_point.unwrap_or(LogPosition::ZERO)
                );
                Ok(SlotInfo {
                    name: name.to_string(),
                    created: true,
                    consistent_point,
                })
            }
            Err(Error::Server { code, .. }) if code == DUPLICATE_OBJECT => {
                debug!("Slot '{}' was created concurrently, checking it", name);
                if self.check_existing_slot(name).await? {
                    Ok(SlotInfo {
                        name: name.to_string(),
                        created: false,
                        consistent_point: None,
                    })
                } else {
                    Err(Error::SlotConflict {
                        slot: name.to_string(),
                        reason: "slot exists but is not visible".to_string(),
                    })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Returns whether a compatible slot exists; errors if an incompatible
    /// one does.
    async fn check_existing_slot(&mut self, name: &str) -> Result<bool> {
        let query = format!(
            "SELECT slot_type, plugin, database FROM pg_catalog.pg_replication_slots WHERE slot_name = '{}'",
            name
        );
        let rows = self.simple_query(&query).await?;
        let Some(row) = rows.first() else {
            return Ok(false);
        };

        let conflict = |reason: String| Error::SlotConflict {
            slot: name.to_string(),
            reason,
        };

        match row.get("slot_type") {
            Some("logical") => {}
            other => {
                return Err(conflict(format!(
                    "slot type is {}, expected logical",
                    other.unwrap_or("unknown")
                )))
            }
        }
        if row.get("plugin") != Some(OUTPUT_PLUGIN) {
            return Err(conflict(format!(
                "slot uses plugin {}, expected {}",
                row.get("plugin").unwrap_or("none"),
                OUTPUT_PLUGIN
            )));
        }
        if row.get("database") != Some(self.database.as_str()) {
            return Err(conflict(format!(
                "slot belongs to database {}, connected to {}",
                row.get("database").unwrap_or("none"),
                self.database
            )));
        }
        Ok(true)
    }

    /// Drops the slot. Never called by the pipeline itself: dropping a slot
    /// discards the WAL the server retained for it.
    pub async fn drop_slot(&mut self, name: &str) -> Result<bool> {
        validate_slot_name(name)?;
        info!("Dropping replication slot: {}", name);

        match self.simple_query(&format!("DROP_REPLICATION_SLOT {}", name)).await {
            Ok(_) => {
                info!("Dropped replication slot '{}'", name);
                Ok(true)
            }
            Err(Error::Server { code, .. }) if code == "42704" => {
                warn!("Replication slot '{}' does not exist", name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Enters CopyBoth mode on `slot` starting at `from`.
    ///
    /// Consumes the connection; [`ReplicationStream::stop`] hands it back.
    pub async fn start_streaming(
        mut self,
        slot: &str,
        publication: &str,
        from: LogPosition,
        options: StreamOptions,
    ) -> Result<ReplicationStream> {
        validate_slot_name(slot)?;
        info!(slot = %slot, publication = %publication, "Starting replication from LSN: {}", from);

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            slot,
            from,
            quote_publication(publication)
        );
        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.send(&buf).await?;

        loop {
            match self.reader.next_frame().await? {
                BackendFrame::CopyBothResponse => break,
                BackendFrame::Message(Message::NoticeResponse(body)) => log_notice(&body),
                BackendFrame::Message(Message::ErrorResponse(body)) => {
                    let err = server_error(&body);
                    // The server follows an error with ReadyForQuery.
                    let _ = self.wait_until_ready().await;
                    return Err(err);
                }
                BackendFrame::Message(_) => {
                    return Err(Error::Protocol(
                        "unexpected response to START_REPLICATION".to_string(),
                    ))
                }
            }
        }

        info!("Entered CopyBoth mode");
        Ok(ReplicationStream::spawn(self, from, options))
    }

    /// Sends Terminate and closes the socket.
    pub async fn close(mut self) -> Result<()> {
        info!("Closing replication connection");
        let mut buf = BytesMut::new();
        frontend::terminate(&mut buf);
        self.send(&buf).await
    }
}

pub fn validate_slot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid slot name '{}': use 1-63 lowercase letters, digits or underscores",
            name
        )))
    }
}

fn quote_publication(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\"").replace('\'', "''"))
}
