//! txq CLI: operator interface to a txqueue database.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use txqueue::config::Config;
use txqueue::engine::Engine;
use chrono::TimeDelta;
use txqueue::model::{MessageId, NewMessage, QueueId, QueueRef};
use txqueue::service::{MessageView, Service};
use txqueue::store::{PgStore, SqliteStore, Store};
use txqueue::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "txq", about = "Transactional work queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic sweeper until interrupted
    Serve,
    /// Run one sweep and print what it repaired
    Sweep,
    /// Queue administration
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Enqueue one message in its own transaction
    Send {
        /// Queue name or id
        queue: String,
        /// Message payload
        payload: String,
        /// Priority (higher = dequeued first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Attempts before the message is given up on
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,
        /// Minutes until the message expires
        #[arg(long)]
        expiry_minutes: Option<i64>,
        #[arg(long, default_value = "")]
        metadata: String,
        #[arg(long)]
        group: Option<String>,
        #[arg(long, default_value_t = 0)]
        correlation_id: i64,
    },
    /// Dequeue one message and commit (or roll back) its transaction
    Receive {
        /// Queue name or id
        queue: String,
        /// Roll back instead of committing, returning the message for retry
        #[arg(long)]
        rollback: bool,
        /// Transaction TTL in minutes
        #[arg(long, default_value_t = 5)]
        ttl_minutes: i64,
    },
    /// Show the next message on a queue, or one message by id
    Peek {
        /// Queue name or id
        queue: Option<String>,
        /// Message id
        #[arg(long, conflicts_with = "queue")]
        id: Option<u64>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Create a queue
    Create { name: String },
    /// Delete a queue and all its messages
    Delete { queue: String },
    /// Show a queue
    Info { queue: String },
    /// List queues
    List,
    /// Message counts per state
    Stats { queue: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "txq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let url = config.database_url.expose_secret();
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PgStore::connect(url, config.max_connections).await?;
        dispatch(cli.command, store, &config).await
    } else {
        let store = SqliteStore::open(url).await?;
        dispatch(cli.command, store, &config).await
    }
}

async fn dispatch<S: Store>(command: Command, store: S, config: &Config) -> anyhow::Result<()> {
    let engine = Engine::with_lock_capacity(store, config.lock_table_capacity);
    let service = Service::new(engine);

    match command {
        Command::Serve => cmd_serve(&service, config).await,
        Command::Sweep => {
            let report = service.run_sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Queue { action } => cmd_queue(&service, action).await,
        Command::Send {
            queue,
            payload,
            priority,
            max_attempts,
            expiry_minutes,
            metadata,
            group,
            correlation_id,
        } => {
            let queue_id = resolve(&service, &queue).await?;
            let mut new = NewMessage::new(payload)
                .priority(priority)
                .max_attempts(max_attempts)
                .metadata(metadata)
                .correlation_id(correlation_id);
            if let Some(minutes) = expiry_minutes {
                let ttl = TimeDelta::try_minutes(minutes)
                    .ok_or_else(|| anyhow::anyhow!("{minutes} minutes is out of range"))?;
                new = new.expires_in(ttl);
            }
            if let Some(group) = group {
                new = new.group_name(group);
            }

            let id = service.send_message(queue_id, new).await?;
            println!("Sent: {id}");
            Ok(())
        }
        Command::Receive {
            queue,
            rollback,
            ttl_minutes,
        } => {
            let queue_id = resolve(&service, &queue).await?;
            let txn = service.start_transaction(ttl_minutes).await?;
            let Some(message) = service.dequeue_message(txn, queue_id).await? else {
                service.rollback_transaction(txn, "nothing to receive").await?;
                println!("Queue is empty.");
                return Ok(());
            };
            print_message(&message);
            if rollback {
                let undone = service.rollback_transaction(txn, "released by operator").await?;
                if undone.exhausted > 0 {
                    println!("Rolled back; message is out of attempts.");
                } else {
                    println!("Rolled back; message returned to the queue.");
                }
            } else {
                service.commit_transaction(txn).await?;
                println!("Committed.");
            }
            Ok(())
        }
        Command::Peek { queue, id } => {
            let message = match (queue, id) {
                (_, Some(id)) => Some(service.peek_message_by_id(MessageId(id)).await?),
                (Some(queue), None) => {
                    let queue_id = resolve(&service, &queue).await?;
                    service.peek_message_by_queue(queue_id).await?
                }
                (None, None) => anyhow::bail!("give a queue or --id"),
            };
            match message {
                Some(m) => print_message(&m),
                None => println!("Queue is empty."),
            }
            Ok(())
        }
    }
}

async fn cmd_serve<S: Store>(service: &Service<S>, config: &Config) -> anyhow::Result<()> {
    let sweep_loop = service.engine().sweep_loop(config.sweep_interval);

    let stop = sweep_loop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.shutdown();
    });

    sweep_loop.run().await?;
    Ok(())
}

async fn cmd_queue<S: Store>(service: &Service<S>, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Create { name } => {
            let id = service.create_queue(&name).await?;
            println!("Created: {id}");
        }
        QueueAction::Delete { queue } => {
            let removed = service.delete_queue(queue_ref(&queue)).await?;
            println!("Deleted {queue} ({removed} message(s) removed)");
        }
        QueueAction::Info { queue } => {
            let info = service.get_queue_info(queue_ref(&queue)).await?;
            println!("{:<8}  NAME", "ID");
            println!("{:<8}  {}", info.id.0, info.name);
        }
        QueueAction::List => {
            let queues = service.list_queues().await?;
            if queues.is_empty() {
                println!("No queues.");
                return Ok(());
            }
            println!("{:<8}  NAME", "ID");
            println!("{}", "-".repeat(40));
            for q in &queues {
                println!("{:<8}  {}", q.id.0, q.name);
            }
            println!("\n{} queue(s)", queues.len());
        }
        QueueAction::Stats { queue } => {
            let stats = service.engine().queues.stats(queue_ref(&queue)).await?;
            println!("active             {}", stats.active);
            println!("in_transaction     {}", stats.in_transaction);
            println!("processed          {}", stats.processed);
            println!("expired            {}", stats.expired);
            println!("attempts_exceeded  {}", stats.attempts_exceeded);
            println!("total              {}", stats.total());
        }
    }
    Ok(())
}

/// A numeric argument is a queue id; anything else is a name.
fn queue_ref(raw: &str) -> QueueRef {
    match raw.parse::<u64>() {
        Ok(id) => QueueRef::Id(QueueId(id)),
        Err(_) => QueueRef::Name(raw.to_string()),
    }
}

async fn resolve<S: Store>(service: &Service<S>, raw: &str) -> anyhow::Result<QueueId> {
    Ok(service.get_queue_info(queue_ref(raw)).await?.id)
}

fn print_message(m: &MessageView) {
    println!("ID:          {}", m.id.0);
    println!("Queue:       {}", m.queue_id.0);
    println!("State:       {}", m.state);
    println!("Priority:    {}", m.priority);
    println!("Attempts:    {}/{}", m.attempts, m.max_attempts);
    println!("Added:       {}", m.add_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(expiry) = m.expiry_time {
        println!("Expires:     {}", expiry.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref group) = m.group_name {
        println!("Group:       {group}");
    }
    if m.correlation_id != 0 {
        println!("Correlation: {}", m.correlation_id);
    }
    if !m.metadata.is_empty() {
        println!("Metadata:    {}", m.metadata);
    }
    println!("Payload:     {}", String::from_utf8_lossy(&m.payload));
}
