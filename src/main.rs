use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use casedesk::auth::{Actor, Role};
use casedesk::config::{Config, DatabaseConfig, StorageBackend};
use casedesk::db::{Address, AuditAction, ClientKind, CreateClientParams, DocumentStatus, TableName};
use casedesk::logging::init_logging;
use casedesk::registry::{AuditFilter, DocumentFilter, NewUpload};
use casedesk::session::{Services, Session};

#[derive(Parser, Debug)]
#[command(name = "casedesk", version, about = "Client and document desk")]
struct Cli {
    /// Email of the person acting; their id is derived from it.
    #[arg(long, env = "CASEDESK_ACTOR_EMAIL", global = true)]
    actor_email: Option<String>,

    /// Role given to a profile created on first use.
    #[arg(long, global = true, default_value = "user", value_parser = parse_role)]
    role: Role,

    /// Use process-local storage; nothing survives the command.
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage clients
    #[command(subcommand)]
    Clients(ClientsCommand),
    /// Manage documents
    #[command(subcommand)]
    Documents(DocumentsCommand),
    /// Show dashboard counts
    Stats,
    /// Show the newest audit entries
    Audit {
        #[arg(long, value_parser = parse_table)]
        table: Option<TableName>,
        #[arg(long, value_parser = parse_action)]
        action: Option<AuditAction>,
    },
    /// Summaries over clients and documents
    Report {
        /// Window for "new" items, in days
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
enum ClientsCommand {
    List {
        #[arg(long)]
        search: Option<String>,
    },
    Add(AddClientArgs),
    Remove {
        id: Uuid,
    },
}

#[derive(Args, Debug)]
struct AddClientArgs {
    #[arg(long, value_parser = parse_kind)]
    kind: ClientKind,
    #[arg(long)]
    name: String,
    #[arg(long)]
    tax_id: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    phone: String,
    #[arg(long)]
    occupation: Option<String>,
    #[arg(long)]
    postal_code: String,
    #[arg(long)]
    street: String,
    #[arg(long)]
    number: String,
    #[arg(long)]
    complement: Option<String>,
    #[arg(long)]
    district: String,
    #[arg(long)]
    city: String,
    #[arg(long)]
    region: String,
}

#[derive(Subcommand, Debug)]
enum DocumentsCommand {
    List {
        #[arg(long)]
        client: Option<Uuid>,
        #[arg(long, value_parser = parse_status)]
        status: Option<DocumentStatus>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        mime_type: Option<String>,
    },
    Upload {
        #[arg(long)]
        client: Uuid,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        mime_type: Option<String>,
        file: PathBuf,
    },
    Status {
        id: Uuid,
        #[arg(value_parser = parse_status)]
        status: DocumentStatus,
    },
    Download {
        id: Uuid,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    Remove {
        id: Uuid,
    },
}

fn parse_role(raw: &str) -> Result<Role, String> {
    Role::from_db_value(&raw.to_ascii_lowercase()).ok_or_else(|| format!("unknown role '{raw}'"))
}

fn parse_kind(raw: &str) -> Result<ClientKind, String> {
    match raw.to_ascii_lowercase().as_str() {
        "pf" => Ok(ClientKind::Individual),
        "pj" => Ok(ClientKind::Organization),
        other => ClientKind::from_db_value(other).ok_or_else(|| format!("unknown kind '{raw}'")),
    }
}

fn parse_status(raw: &str) -> Result<DocumentStatus, String> {
    match raw.to_ascii_lowercase().as_str() {
        "in_review" | "in-review" => Ok(DocumentStatus::InReview),
        other => {
            DocumentStatus::from_db_value(other).ok_or_else(|| format!("unknown status '{raw}'"))
        }
    }
}

fn parse_table(raw: &str) -> Result<TableName, String> {
    TableName::from_db_value(&raw.to_ascii_lowercase())
        .ok_or_else(|| format!("unknown table '{raw}'"))
}

fn parse_action(raw: &str) -> Result<AuditAction, String> {
    AuditAction::from_db_value(&raw.to_ascii_uppercase())
        .ok_or_else(|| format!("unknown action '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    if cli.ephemeral {
        config.database = DatabaseConfig::memory();
        config.storage.backend = StorageBackend::Memory;
    }
    init_logging(&config.logging)?;

    let Some(email) = cli.actor_email.as_deref() else {
        bail!("no actor: pass --actor-email or set CASEDESK_ACTOR_EMAIL");
    };
    let actor = Actor::from_email(email, cli.role);
    let services = Services::from_config(&config)
        .await
        .context("failed to open the record store")?;
    let mut session = Session::start(services, actor).await?;

    let result = run(&mut session, cli.command).await;
    session.end();
    result
}

async fn run(session: &mut Session, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Clients(cmd) => run_clients(session, cmd).await,
        Command::Documents(cmd) => run_documents(session, cmd).await,
        Command::Stats => {
            let stats = session.stats().current();
            println!("clients:          {}", stats.client_count);
            println!("documents:        {}", stats.document_count);
            println!("pending review:   {}", stats.pending_document_count);
            println!("recent activity:  {}", stats.recent_activity_count);
            Ok(())
        }
        Command::Audit { table, action } => {
            for entry in session
                .audit_trail()
                .entries(&AuditFilter { table, action })
            {
                println!(
                    "{}  {:<8} {:<10} {}  {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.action.as_str(),
                    entry.table_name.as_str(),
                    entry.record_id,
                    entry.actor_email,
                );
            }
            Ok(())
        }
        Command::Report { days } => {
            let report = session.report(days);
            println!(
                "clients:   {} ({} new in {days} days)",
                report.total_clients, report.new_clients
            );
            println!(
                "documents: {} ({} new in {days} days)",
                report.total_documents, report.new_documents
            );
            for (kind, count) in &report.clients_by_kind {
                println!("  {:<14} {count}", kind.as_str());
            }
            for (status, count) in &report.documents_by_status {
                println!("  {:<14} {count}", status.as_str());
            }
            for (mime, count) in &report.mime_types {
                println!("  {mime:<14} {count}");
            }
            println!("most recent clients:");
            for client in &report.recent_clients {
                println!(
                    "  {}  {}",
                    client.created_at.format("%Y-%m-%d"),
                    client.legal_name
                );
            }
            Ok(())
        }
    }
}

async fn run_clients(session: &Session, command: ClientsCommand) -> anyhow::Result<()> {
    let clients = session.clients();
    match command {
        ClientsCommand::List { search } => {
            let rows = match search {
                Some(term) => clients.search(&term),
                None => clients.list().to_vec(),
            };
            for client in rows {
                println!(
                    "{}  {:<12} {:<14} {}  <{}>",
                    client.id,
                    client.kind.as_str(),
                    client.tax_id,
                    client.legal_name,
                    client.email,
                );
            }
        }
        ClientsCommand::Add(args) => {
            let record = clients
                .create(&CreateClientParams {
                    kind: args.kind,
                    legal_name: args.name,
                    tax_id: args.tax_id,
                    email: args.email,
                    phone: args.phone,
                    occupation_or_activity: args.occupation,
                    address: Address {
                        postal_code: args.postal_code,
                        street: args.street,
                        number: args.number,
                        complement: args.complement,
                        district: args.district,
                        city: args.city,
                        region: args.region,
                    },
                })
                .await?;
            println!("{}", record.id);
        }
        ClientsCommand::Remove { id } => {
            clients.delete(id).await?;
            println!("removed client {id}");
        }
    }
    Ok(())
}

async fn run_documents(session: &mut Session, command: DocumentsCommand) -> anyhow::Result<()> {
    match command {
        DocumentsCommand::List {
            client,
            status,
            search,
            mime_type,
        } => {
            let registry = match client {
                Some(client_id) => session.documents_for_client(client_id).await?,
                None => session.documents().clone(),
            };
            let filter = DocumentFilter {
                text: search,
                status,
                mime_type,
            };
            for doc in registry.search(&filter) {
                println!(
                    "{}  {:<9} {}  [{}]  {}",
                    doc.id,
                    doc.status.as_str(),
                    doc.title,
                    doc.client_name.as_deref().unwrap_or("-"),
                    doc.file
                        .as_ref()
                        .map(|f| f.original_file_name.as_str())
                        .unwrap_or("-"),
                );
            }
        }
        DocumentsCommand::Upload {
            client,
            title,
            description,
            tags,
            mime_type,
            file,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .with_context(|| format!("{} has no usable file name", file.display()))?;
            let record = session
                .documents()
                .upload(NewUpload {
                    client_id: client,
                    title,
                    description,
                    tags: tags.into_iter().collect::<BTreeSet<_>>(),
                    file_name,
                    mime_type,
                    bytes: Bytes::from(bytes),
                })
                .await?;
            println!("{}", record.id);
        }
        DocumentsCommand::Status { id, status } => {
            let reviewer = session.actor().id;
            let record = session
                .documents()
                .update_status(id, status, Some(reviewer))
                .await?;
            println!("{} is now {}", record.id, record.status.as_str());
        }
        DocumentsCommand::Download { id, output } => {
            let documents = session.documents();
            let Some(doc) = documents.get(id) else {
                bail!("document {id} not found");
            };
            let bytes = documents.download(&doc).await?;
            let target = match output {
                Some(path) => path,
                // Only the last component, so a stored name cannot pick the directory.
                None => doc
                    .file
                    .as_ref()
                    .and_then(|f| Path::new(&f.original_file_name).file_name())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(id.to_string())),
            };
            tokio::fs::write(&target, &bytes)
                .await
                .with_context(|| format!("failed to write {}", target.display()))?;
            println!("wrote {} bytes to {}", bytes.len(), target.display());
        }
        DocumentsCommand::Remove { id } => {
            session.documents().delete(id).await?;
            println!("removed document {id}");
        }
    }
    Ok(())
}
