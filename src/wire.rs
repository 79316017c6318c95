use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::DaybookAuthSource;
use crate::booking::Actor;
use crate::engine::{BookingRequest, EngineError};
use crate::lanes::Placement;
use crate::model::*;
use crate::notify::parse_channel;
use crate::sql::{self, Command};
use crate::tenant::{Tenant, TenantManager};

/// Per-connection query handler. Holds the connection's LISTEN
/// subscriptions; queued day events are delivered ahead of the next
/// query's results.
pub struct DaybookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<DaybookQueryParser>,
    listens: Mutex<Vec<(String, broadcast::Receiver<Event>)>>,
}

impl DaybookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(DaybookQueryParser),
            listens: Mutex::new(Vec::new()),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Tenant>, Actor)> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let actor = Actor::from_user(metadata.get("user").map_or("", String::as_str));
        let tenant = self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })?;
        Ok((tenant, actor))
    }

    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (tenant, actor) = self.resolve_tenant(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = crate::observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&tenant, actor, cmd).await;
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        self.flush_notifications(client).await?;
        result
    }

    async fn execute_command(
        &self,
        tenant: &Tenant,
        actor: Actor,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let bookings = &tenant.bookings;
        match cmd {
            Command::InsertClient { client } => {
                bookings.save_client(actor, client).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertPackage { package } => {
                bookings.save_package(actor, package).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertPurchase { purchase } => {
                bookings.save_purchase(actor, purchase).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertAppointment {
                id,
                client,
                date,
                start,
                purchase_id,
                package_id,
                preferences,
            } => {
                let receipt = bookings
                    .create(
                        actor,
                        BookingRequest {
                            id,
                            client,
                            date,
                            start,
                            purchase_id,
                            package_id,
                            schedule_preferences: preferences,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(receipt_schema());
                let a = &receipt.appointment;
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&a.id.to_string())?;
                encoder.encode_field(&a.status.as_str())?;
                encoder.encode_field(&a.date.to_string())?;
                encoder.encode_field(&format_hhmm(a.span.start))?;
                encoder.encode_field(&format_hhmm(a.span.end))?;
                encoder.encode_field(&receipt.requires_advance_payment)?;
                encoder.encode_field(&(receipt.advance_payment_amount as i64))?;
                encoder.encode_field(&receipt.package_name)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::MoveAppointment { id, date, start } => {
                let date = match date {
                    Some(d) => d,
                    None => {
                        tenant
                            .engine
                            .appointment(&id)
                            .await
                            .ok_or(EngineError::NotFound(id))
                            .map_err(engine_err)?
                            .date
                    }
                };
                bookings
                    .reschedule(actor, id, date, start)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SetStatus {
                id,
                status,
                cancel_reason,
                paid_amount,
            } => {
                bookings
                    .set_status(actor, id, status, cancel_reason.as_deref(), paid_amount)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::MarkMessage { id, status } => {
                let changed = bookings
                    .set_message_status(actor, id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("UPDATE").with_rows(usize::from(changed)),
                )])
            }
            Command::SelectAppointments { date } => {
                let appointments = bookings.appointments_on(actor, date).await;
                let schema = Arc::new(appointment_schema());
                let rows: Vec<PgWireResult<_>> = appointments
                    .iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.client.kind().as_str())?;
                        encoder.encode_field(&a.client.id().to_string())?;
                        encoder.encode_field(&a.date.to_string())?;
                        encoder.encode_field(&format_hhmm(a.span.start))?;
                        encoder.encode_field(&format_hhmm(a.span.end))?;
                        encoder.encode_field(&a.status.as_str())?;
                        encoder.encode_field(&a.package_id.map(|p| p.to_string()))?;
                        encoder.encode_field(&a.reminder_24h_sent)?;
                        encoder.encode_field(&a.reminder_day_sent)?;
                        encoder.encode_field(&a.payment_reminder_sent)?;
                        encoder.encode_field(&a.cancel_reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots { date } => {
                let usage = tenant.engine.slot_usage(date).await;
                let schema = Arc::new(slot_schema());
                let rows: Vec<PgWireResult<_>> = usage
                    .iter()
                    .map(|u| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_hhmm(u.start))?;
                        encoder.encode_field(&(u.booked as i64))?;
                        encoder.encode_field(&(u.capacity as i64))?;
                        encoder.encode_field(&(u.remaining() as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectLanes { date } => {
                let placements = tenant.engine.day_layout(date, &[]).await;
                let visible: Vec<Placement> = match actor {
                    Actor::Staff => placements,
                    Actor::Parent(_) => {
                        let own: Vec<_> = bookings
                            .appointments_on(actor, date)
                            .await
                            .into_iter()
                            .map(|a| a.id)
                            .collect();
                        placements.into_iter().filter(|p| own.contains(&p.id)).collect()
                    }
                };
                let schema = Arc::new(lane_schema());
                let rows: Vec<PgWireResult<_>> = visible
                    .iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&(p.lane as i64))?;
                        encoder.encode_field(&(p.lanes_used as i64))?;
                        encoder.encode_field(&p.left_pct)?;
                        encoder.encode_field(&p.width_pct)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectOutbound => {
                let messages = bookings.pending_messages(actor).map_err(engine_err)?;
                let schema = Arc::new(message_schema());
                let rows: Vec<PgWireResult<_>> = messages
                    .iter()
                    .map(|m| {
                        let ids: Vec<String> = m.appointment_ids.iter().map(Ulid::to_string).collect();
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&m.id.to_string())?;
                        encoder.encode_field(&m.category.as_str())?;
                        encoder.encode_field(&m.phone)?;
                        encoder.encode_field(&m.body)?;
                        encoder.encode_field(&ids.join(","))?;
                        encoder.encode_field(&m.created_at)?;
                        encoder.encode_field(&m.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                if parse_channel(&channel).is_none() {
                    return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected day_YYYY-MM-DD)"),
                    ))));
                }
                let mut listens = self.listens.lock().await;
                if !listens.iter().any(|(c, _)| *c == channel) {
                    if let Some(date) = parse_channel(&channel) {
                        let rx = tenant.engine.notify.subscribe(date);
                        listens.push((channel, rx));
                    }
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut listens = self.listens.lock().await;
                match channel {
                    Some(channel) => listens.retain(|(c, _)| *c != channel),
                    None => listens.clear(),
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Deliver day events received since the last query.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pending = {
            let mut listens = self.listens.lock().await;
            let mut pending = Vec::new();
            for (channel, rx) in listens.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending.push((channel.clone(), event)),
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            tracing::warn!("{channel}: listener lagged, {n} events dropped");
                        }
                        Err(_) => break,
                    }
                }
            }
            pending
        };
        for (channel, event) in pending {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            let notification = NotificationResponse::new(std::process::id() as i32, channel, payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("status"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        typed_field("requires_advance_payment", Type::BOOL),
        typed_field("advance_payment_amount", Type::INT8),
        text_field("package_name"),
    ]
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("client_type"),
        text_field("client_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("status"),
        text_field("package_id"),
        typed_field("reminder_24h_sent", Type::BOOL),
        typed_field("reminder_day_sent", Type::BOOL),
        typed_field("payment_reminder_sent", Type::BOOL),
        text_field("cancel_reason"),
    ]
}

fn slot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start_time"),
        typed_field("booked", Type::INT8),
        typed_field("capacity", Type::INT8),
        typed_field("remaining", Type::INT8),
    ]
}

fn lane_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        typed_field("lane", Type::INT8),
        typed_field("lanes_used", Type::INT8),
        typed_field("left_pct", Type::FLOAT8),
        typed_field("width_pct", Type::FLOAT8),
    ]
}

fn message_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("category"),
        text_field("phone"),
        text_field("body"),
        text_field("appointment_ids"),
        typed_field("created_at", Type::INT8),
        text_field("status"),
    ]
}

/// Result columns a statement will produce, judged from its text alone
/// since bound parameters are not known at describe time.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    match words.as_slice() {
        ["insert", "into", "appointments", ..] => receipt_schema(),
        ["select", rest @ ..] => {
            let table = rest.iter().skip_while(|w| **w != "from").nth(1).copied();
            match table {
                Some("appointments") => appointment_schema(),
                Some("slots") => slot_schema(),
                Some("lanes") => lane_schema(),
                Some("outbound_messages") => message_schema(),
                _ => vec![],
            }
        }
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for DaybookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct DaybookQueryParser;

#[async_trait]
impl QueryParser for DaybookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for DaybookHandler {
    type Statement = String;
    type QueryParser = DaybookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(client, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so $1 never clobbers the prefix of $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct DaybookFactory {
    handler: Arc<DaybookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<DaybookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl DaybookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = DaybookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(DaybookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for DaybookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes. Each connection gets its
/// own handler so LISTEN subscriptions stay per-session.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(DaybookFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let state = match e.code() {
        "UNAUTHORIZED" => "42501",
        "NOT_FOUND" => "P0002",
        "INTERNAL" => "XX000",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        state.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_counted_by_highest_index() {
        assert_eq!(count_params("SELECT * FROM slots WHERE date = $1"), 1);
        assert_eq!(count_params("UPDATE appointments SET start_time = $2 WHERE id = $10"), 10);
        assert_eq!(count_params("SELECT * FROM outbound_messages"), 0);
    }

    #[test]
    fn schema_follows_statement_kind() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("INSERT INTO appointments (id) VALUES ($1)")[1], "status");
        assert_eq!(names("select * from slots where date = $1")[0], "start_time");
        assert_eq!(names("SELECT * FROM lanes WHERE date = $1").len(), 5);
        assert!(names("INSERT INTO clients (id) VALUES ($1)").is_empty());
        assert!(names("UPDATE appointments SET status = 'completed' WHERE id = $1").is_empty());
    }

    #[test]
    fn engine_errors_keep_their_code() {
        let err = engine_err(EngineError::PrepaymentRequired(Ulid::nil()));
        match err {
            PgWireError::UserError(info) => {
                let text = format!("{info:?}");
                assert!(text.contains("P0001"));
                assert!(text.contains("PREPAYMENT_REQUIRED"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
